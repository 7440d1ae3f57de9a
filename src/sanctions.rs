//! CEIS/CNEP sanctions lookups via the Portal da Transparência.
//!
//! Both databases are queried concurrently through the resilience core,
//! walking all pages up to a safety cap. Either endpoint failing
//! degrades to an empty list with a warning; only both failing marks the
//! aggregate unavailable, which downstream treats as "not sanctioned"
//! (fail-open).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::filter::SanctionsOracle;
use crate::models::procurement::digits_only;
use crate::models::sanctions::{
    SanctionRecord, SanctionSource, SanctionsResult, SanctionsStatus, SanctionsSummary,
};
use crate::resilience::{RequestSpec, ResilientClient, SourceError};

pub const CACHE_TTL: Duration = Duration::from_secs(86_400);
const PAGE_CAP: u32 = 50;
const UPSTREAM: &str = "SANCTIONS";
/// Portal da Transparência allows 90 req/min.
const RATE_LIMIT_RPS: f64 = 1.5;

pub struct SanctionsChecker {
    client: Arc<ResilientClient>,
    api_key: String,
    base_url: String,
    cache: DashMap<String, (SanctionsResult, Instant)>,
}

impl SanctionsChecker {
    pub fn new(client: Arc<ResilientClient>, api_key: Option<String>) -> Self {
        Self::with_base_url(
            client,
            api_key,
            "https://api.portaldatransparencia.gov.br/api-de-dados".to_string(),
        )
    }

    pub fn with_base_url(
        client: Arc<ResilientClient>,
        api_key: Option<String>,
        base_url: String,
    ) -> Self {
        client.set_rate_limit(UPSTREAM, RATE_LIMIT_RPS);
        Self {
            client,
            api_key: api_key.unwrap_or_default(),
            base_url,
            cache: DashMap::new(),
        }
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    pub fn invalidate_cache(&self, cnpj: Option<&str>) {
        match cnpj {
            Some(cnpj) => {
                self.cache.remove(&digits_only(cnpj));
            }
            None => self.cache.clear(),
        }
    }

    /// Aggregate CEIS + CNEP for one CNPJ, with a 24h cache.
    pub async fn check_sanctions(&self, cnpj: &str) -> SanctionsResult {
        let (result, _) = self.check_with_availability(cnpj).await;
        result
    }

    async fn check_with_availability(&self, cnpj: &str) -> (SanctionsResult, bool) {
        let cnpj_digits = digits_only(cnpj);

        if let Some(entry) = self.cache.get(&cnpj_digits) {
            let (result, cached_at) = entry.value();
            if cached_at.elapsed() < CACHE_TTL {
                let mut hit = result.clone();
                hit.cache_hit = true;
                tracing::debug!(age_s = cached_at.elapsed().as_secs(), "sanctions cache hit");
                return (hit, true);
            }
            drop(entry);
            self.cache.remove(&cnpj_digits);
        }

        let (ceis, cnep) = tokio::join!(
            self.fetch_records("/ceis", &cnpj_digits, SanctionSource::Ceis),
            self.fetch_records("/cnep", &cnpj_digits, SanctionSource::Cnep),
        );

        let available = ceis.is_ok() || cnep.is_ok();
        let ceis_records = ceis.unwrap_or_else(|e| {
            tracing::warn!("CEIS query failed for {}: {}", cnpj_digits, e);
            Vec::new()
        });
        let cnep_records = cnep.unwrap_or_else(|e| {
            tracing::warn!("CNEP query failed for {}: {}", cnpj_digits, e);
            Vec::new()
        });

        let ceis_count = ceis_records.len();
        let cnep_count = cnep_records.len();
        let mut sanctions = ceis_records;
        sanctions.extend(cnep_records);
        let is_sanctioned = sanctions.iter().any(|s| s.is_active);

        let result = SanctionsResult {
            cnpj: cnpj_digits.clone(),
            is_sanctioned,
            sanctions,
            checked_at: Utc::now(),
            ceis_count,
            cnep_count,
            cache_hit: false,
        };

        // Unavailable results are not cached: the next check retries.
        if available {
            self.cache
                .insert(cnpj_digits.clone(), (result.clone(), Instant::now()));
        }

        tracing::info!(
            cnpj = %cnpj_digits,
            sanctioned = is_sanctioned,
            ceis = ceis_count,
            cnep = cnep_count,
            "sanctions check complete"
        );
        (result, available)
    }

    /// Tri-state summary for the search UI.
    pub async fn summary_for(&self, cnpj: &str) -> SanctionsSummary {
        let (result, available) = self.check_with_availability(cnpj).await;
        if !available {
            return SanctionsSummary {
                status: SanctionsStatus::Unavailable,
                active_count: 0,
                sanction_types: Vec::new(),
            };
        }

        let active: Vec<&SanctionRecord> =
            result.sanctions.iter().filter(|s| s.is_active).collect();
        let mut types: Vec<String> = active.iter().map(|s| s.sanction_type.clone()).collect();
        types.sort();
        types.dedup();

        SanctionsSummary {
            status: if active.is_empty() {
                SanctionsStatus::Clean
            } else {
                SanctionsStatus::Sanctioned
            },
            active_count: active.len(),
            sanction_types: types,
        }
    }

    async fn fetch_records(
        &self,
        path: &str,
        cnpj_digits: &str,
        source: SanctionSource,
    ) -> Result<Vec<SanctionRecord>, SourceError> {
        if cnpj_digits.is_empty() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut pagina: u32 = 1;
        loop {
            let spec = RequestSpec::get(UPSTREAM, &format!("{}{}", self.base_url, path))
                .with_header("chave-api-dados", &self.api_key)
                .with_query(vec![
                    ("codigoSancionado".into(), cnpj_digits.to_string()),
                    ("pagina".into(), pagina.to_string()),
                ])
                .with_timeout(Duration::from_secs(30));

            let page = self.client.request(&spec).await?;
            let items = match page {
                Value::Array(items) => items,
                Value::Object(obj) => obj
                    .get("data")
                    .or_else(|| obj.get("registros"))
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            if items.is_empty() {
                break;
            }

            for raw in &items {
                match parse_record(raw, source) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::warn!("skipping unparsable {} record: {}", path, e);
                    }
                }
            }

            pagina += 1;
            if pagina > PAGE_CAP {
                tracing::warn!(cnpj = cnpj_digits, path = path, "sanctions page cap reached");
                break;
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl SanctionsOracle for SanctionsChecker {
    async fn status_for(&self, cnpj: &str) -> SanctionsStatus {
        self.summary_for(cnpj).await.status
    }
}

/// Portal da Transparência dates arrive as `DD/MM/YYYY`, occasionally
/// ISO.
fn parse_sanction_date(value: Option<&Value>) -> Option<NaiveDate> {
    let raw = value?.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }
    for fmt in ["%d/%m/%Y", "%Y-%m-%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(d);
        }
    }
    tracing::debug!("unparsable sanction date: {}", raw);
    None
}

fn parse_record(raw: &Value, source: SanctionSource) -> Result<SanctionRecord, String> {
    let sancionado = raw.get("sancionado").cloned().unwrap_or(Value::Null);
    let tipo = match source {
        SanctionSource::Ceis => raw.get("tipo").cloned().unwrap_or(Value::Null),
        SanctionSource::Cnep => raw.get("tipoSancao").cloned().unwrap_or(Value::Null),
    };
    let orgao = raw.get("orgaoSancionador").cloned().unwrap_or(Value::Null);
    let fundamentacao = raw.get("fundamentacao").cloned().unwrap_or(Value::Null);

    let cnpj = sancionado
        .get("codigoFormatado")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    if cnpj.is_empty() && sancionado.get("nome").is_none() {
        return Err("record without sancionado".into());
    }

    let start_date = parse_sanction_date(raw.get("dataInicioSancao"));
    let end_date = parse_sanction_date(raw.get("dataFinalSancao"));
    let today = Utc::now().date_naive();
    let is_active = SanctionRecord::compute_is_active(end_date, today);

    // Only CNEP carries a fine amount.
    let fine_amount = match source {
        SanctionSource::Ceis => None,
        SanctionSource::Cnep => raw.get("valorMulta").and_then(|v| match v {
            Value::Number(n) => n.to_string().parse::<Decimal>().ok(),
            Value::String(s) => s.replace('.', "").replace(',', ".").parse::<Decimal>().ok(),
            _ => None,
        }),
    };

    Ok(SanctionRecord {
        source,
        cnpj,
        company_name: sancionado
            .get("nome")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        sanction_type: tipo
            .get("descricaoResumida")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        start_date,
        end_date,
        sanctioning_body: orgao
            .get("nome")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        legal_basis: fundamentacao
            .get("descricao")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        fine_amount,
        is_active,
    })
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::RetryPolicy;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn checker_for(server: &MockServer) -> SanctionsChecker {
        let client = Arc::new(ResilientClient::with_policy(RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }));
        SanctionsChecker::with_base_url(client, Some("key".into()), server.uri())
    }

    fn ceis_record(end_date: Option<&str>) -> Value {
        json!({
            "tipo": {"descricaoResumida": "Impedimento"},
            "sancionado": {"nome": "Empresa X LTDA", "codigoFormatado": "00.000.000/0001-00"},
            "dataInicioSancao": "01/01/2025",
            "dataFinalSancao": end_date,
            "orgaoSancionador": {"nome": "Ministério da Defesa"},
            "fundamentacao": {"descricao": "Lei 8.666/1993, Art. 87, IV"}
        })
    }

    async fn mount_empty(server: &MockServer, endpoint: &str) {
        Mock::given(method("GET"))
            .and(path(endpoint))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_active_ceis_sanction_detected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ceis"))
            .and(query_param("pagina", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([ceis_record(None)])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ceis"))
            .and(query_param("pagina", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        mount_empty(&server, "/cnep").await;

        let checker = checker_for(&server);
        let result = checker.check_sanctions("00.000.000/0001-00").await;

        assert!(result.is_sanctioned);
        assert_eq!(result.ceis_count, 1);
        assert_eq!(result.cnep_count, 0);
        assert_eq!(result.cnpj, "00000000000100");
        let record = &result.sanctions[0];
        assert_eq!(record.sanction_type, "Impedimento");
        assert!(record.is_active);
        assert!(record.fine_amount.is_none());
    }

    #[tokio::test]
    async fn test_expired_sanction_is_not_active() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ceis"))
            .and(query_param("pagina", "1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([ceis_record(Some("01/01/2020"))])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ceis"))
            .and(query_param("pagina", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        mount_empty(&server, "/cnep").await;

        let checker = checker_for(&server);
        let result = checker.check_sanctions("00000000000100").await;
        assert!(!result.is_sanctioned);
        assert_eq!(result.ceis_count, 1);
    }

    #[tokio::test]
    async fn test_cnep_fine_amount_parsed() {
        let server = MockServer::start().await;
        mount_empty(&server, "/ceis").await;
        Mock::given(method("GET"))
            .and(path("/cnep"))
            .and(query_param("pagina", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "tipoSancao": {"descricaoResumida": "Multa"},
                "sancionado": {"nome": "Empresa Y", "codigoFormatado": "11.111.111/0001-11"},
                "dataInicioSancao": "01/06/2025",
                "dataFinalSancao": null,
                "orgaoSancionador": {"nome": "CGU"},
                "fundamentacao": {"descricao": "Lei 12.846/2013"},
                "valorMulta": 150000.5
            }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cnep"))
            .and(query_param("pagina", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let checker = checker_for(&server);
        let result = checker.check_sanctions("11111111000111").await;
        assert!(result.is_sanctioned);
        let record = &result.sanctions[0];
        assert_eq!(record.source, SanctionSource::Cnep);
        assert!(record.fine_amount.is_some());
    }

    #[tokio::test]
    async fn test_cache_hit_flag() {
        let server = MockServer::start().await;
        mount_empty(&server, "/ceis").await;
        mount_empty(&server, "/cnep").await;

        let checker = checker_for(&server);
        let first = checker.check_sanctions("22222222000122").await;
        assert!(!first.cache_hit);
        let second = checker.check_sanctions("22222222000122").await;
        assert!(second.cache_hit);
        assert_eq!(checker.cache_size(), 1);
    }

    #[tokio::test]
    async fn test_both_endpoints_down_is_unavailable_fail_open() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let checker = checker_for(&server);
        let summary = checker.summary_for("33333333000133").await;
        assert_eq!(summary.status, SanctionsStatus::Unavailable);

        let result = checker.check_sanctions("33333333000133").await;
        assert!(!result.is_sanctioned);
    }

    #[tokio::test]
    async fn test_one_endpoint_down_degrades_gracefully() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ceis"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        mount_empty(&server, "/cnep").await;

        let checker = checker_for(&server);
        let summary = checker.summary_for("44444444000144").await;
        assert_eq!(summary.status, SanctionsStatus::Clean);
    }

    #[tokio::test]
    async fn test_unparsable_record_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ceis"))
            .and(query_param("pagina", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"unexpected": "shape"},
                ceis_record(None)
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ceis"))
            .and(query_param("pagina", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        mount_empty(&server, "/cnep").await;

        let checker = checker_for(&server);
        let result = checker.check_sanctions("55555555000155").await;
        assert_eq!(result.ceis_count, 1);
    }

    #[test]
    fn test_date_parsing_formats() {
        assert!(parse_sanction_date(Some(&json!("15/03/2026"))).is_some());
        assert!(parse_sanction_date(Some(&json!("2026-03-15"))).is_some());
        assert!(parse_sanction_date(Some(&json!(""))).is_none());
        assert!(parse_sanction_date(Some(&json!("em breve"))).is_none());
        assert!(parse_sanction_date(None).is_none());
    }
}
