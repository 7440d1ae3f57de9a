//! PNCP adapter for the Portal Nacional de Contratações Públicas.
//!
//! The dominant source. Fetches fan out per UF under bounded concurrency;
//! each UF gets an adaptive timeout from the shared timeout manager, up
//! to two retries with 1.5× widening, and its own slice of the response
//! cache. Consulta endpoint dates use the compact `yyyyMMdd` form.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashSet;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};

use crate::models::procurement::{
    ProcurementFields, SourceCapability, SourceMetadata, UnifiedProcurement,
};
use crate::models::search::VALID_UFS;
use crate::resilience::{RequestSpec, SourceError};

use super::{
    get_str, parse_datetime, parse_valor, spawn_fetch_stream, FetchRequest, ProcurementStream,
    SourceAdapter, SourceContext, SourceStatus, HEALTH_CHECK_TIMEOUT, MAX_PAGES,
};

const PAGE_SIZE: u32 = 50;
const MAX_RETRIES_PER_UF: u32 = 2;
const MAX_CONCURRENT_UFS: usize = 5;
const UF_TIMEOUT_CAP: Duration = Duration::from_secs(180);
/// Pregão Eletrônico and Dispensa Eletrônica dominate publication volume.
const DEFAULT_MODALIDADES: &[u8] = &[6, 8];

pub struct PncpAdapter {
    ctx: SourceContext,
    metadata: SourceMetadata,
    per_uf_timeout: Duration,
}

impl PncpAdapter {
    pub fn new(ctx: SourceContext, per_uf_timeout: Duration) -> Self {
        Self {
            ctx,
            metadata: SourceMetadata {
                name: "Portal Nacional de Contratações Públicas",
                code: "PNCP",
                base_url: "https://pncp.gov.br/api/consulta/v1".to_string(),
                capabilities: HashSet::from([
                    SourceCapability::FilterByUf,
                    SourceCapability::Pagination,
                    SourceCapability::DateRange,
                    SourceCapability::RealTime,
                ]),
                rate_limit_rps: 10.0,
                typical_response_ms: 2000,
                priority: 1,
            },
            per_uf_timeout,
        }
    }

    async fn fetch_uf_with_resilience(
        &self,
        request: &FetchRequest,
        uf: &str,
        tx: &mpsc::Sender<Result<UnifiedProcurement, SourceError>>,
        seen: &DashSet<String>,
    ) -> Result<usize, SourceError> {
        // Adaptive when history exists for this UF, configured default
        // otherwise.
        let mut timeout = self
            .ctx
            .timeouts
            .stats(self.metadata.code, uf)
            .map(|s| s.effective_timeout)
            .unwrap_or_else(|| self.per_uf_timeout.min(UF_TIMEOUT_CAP));
        let mut attempt: u32 = 0;

        loop {
            let start = Instant::now();
            let result = tokio::time::timeout(
                timeout,
                self.fetch_uf_all_pages(request, uf, tx, seen),
            )
            .await;

            match result {
                Ok(Ok(count)) => {
                    self.ctx.timeouts.record_request(
                        self.metadata.code,
                        uf,
                        start.elapsed(),
                        true,
                        false,
                    );
                    tracing::info!(
                        uf = uf,
                        count = count,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "PNCP UF fetch complete"
                    );
                    return Ok(count);
                }
                Ok(Err(e)) => {
                    self.ctx.timeouts.record_request(
                        self.metadata.code,
                        uf,
                        start.elapsed(),
                        false,
                        false,
                    );
                    // 4xx are not worth retrying at the UF level either.
                    if matches!(e, SourceError::Auth(_) | SourceError::Api { status: 400..=499, .. }) {
                        return Err(e);
                    }
                    if attempt >= MAX_RETRIES_PER_UF {
                        return Err(e);
                    }
                    attempt += 1;
                    tokio::time::sleep(Duration::from_secs(2u64 << (attempt - 1))).await;
                }
                Err(_) => {
                    self.ctx
                        .timeouts
                        .record_request(self.metadata.code, uf, timeout, false, true);
                    tracing::warn!(
                        uf = uf,
                        timeout_s = timeout.as_secs(),
                        attempt = attempt + 1,
                        "PNCP UF fetch timed out"
                    );
                    if attempt >= MAX_RETRIES_PER_UF {
                        return Err(SourceError::Timeout {
                            seconds: timeout.as_secs(),
                        });
                    }
                    attempt += 1;
                    timeout = Duration::from_secs_f64(
                        (timeout.as_secs_f64() * 1.5).min(UF_TIMEOUT_CAP.as_secs_f64()),
                    );
                    tokio::time::sleep(Duration::from_secs(2u64 << (attempt - 1))).await;
                }
            }
        }
    }

    async fn fetch_uf_all_pages(
        &self,
        request: &FetchRequest,
        uf: &str,
        tx: &mpsc::Sender<Result<UnifiedProcurement, SourceError>>,
        seen: &DashSet<String>,
    ) -> Result<usize, SourceError> {
        let modalidades = if request.modalidades.is_empty() {
            DEFAULT_MODALIDADES.to_vec()
        } else {
            request.modalidades.clone()
        };

        let mut sent = 0usize;
        for modalidade in modalidades {
            let mut pagina: u32 = 1;
            loop {
                let query = vec![
                    ("dataInicial".into(), compact_date(&request.data_inicial)),
                    ("dataFinal".into(), compact_date(&request.data_final)),
                    (
                        "codigoModalidadeContratacao".into(),
                        modalidade.to_string(),
                    ),
                    ("uf".into(), uf.to_string()),
                    ("pagina".into(), pagina.to_string()),
                    ("tamanhoPagina".into(), PAGE_SIZE.to_string()),
                ];
                let spec = RequestSpec::get(
                    self.metadata.code,
                    &format!("{}/contratacoes/publicacao", self.metadata.base_url),
                )
                .with_query(query)
                .with_timeout(Duration::from_secs(30))
                .cached();

                let response = self.ctx.client.request(&spec).await?;

                let data = response
                    .get("data")
                    .and_then(|d| d.as_array())
                    .cloned()
                    .unwrap_or_default();
                if data.is_empty() {
                    break;
                }

                for raw in &data {
                    match self.normalize(raw) {
                        Ok(record) => {
                            if !seen.insert(record.source_id.clone()) {
                                continue;
                            }
                            if tx.send(Ok(record)).await.is_err() {
                                // Consumer gone; stop paginating.
                                return Ok(sent);
                            }
                            sent += 1;
                        }
                        Err(e) => {
                            tracing::warn!(uf = uf, "failed to normalize PNCP record: {}", e);
                        }
                    }
                }

                let total_paginas = response
                    .get("totalPaginas")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(1) as u32;
                if pagina >= total_paginas || pagina >= MAX_PAGES {
                    if pagina >= MAX_PAGES {
                        tracing::warn!(uf = uf, "PNCP page cap reached");
                    }
                    break;
                }
                pagina += 1;
            }
        }
        Ok(sent)
    }

    /// Map a PNCP consulta record into the unified shape.
    pub fn normalize(&self, raw: &Value) -> Result<UnifiedProcurement, SourceError> {
        let source_id = get_str(raw, &["numeroControlePNCP", "numeroControlePncp", "id"]);
        if source_id.is_empty() {
            return Err(SourceError::Parse("record without numeroControlePNCP".into()));
        }

        let orgao = raw.get("orgaoEntidade").cloned().unwrap_or(Value::Null);
        let unidade = raw.get("unidadeOrgao").cloned().unwrap_or(Value::Null);

        let ano = raw
            .get("anoCompra")
            .map(|v| match v {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                _ => String::new(),
            })
            .unwrap_or_default();

        Ok(UnifiedProcurement::new(ProcurementFields {
            source_id,
            source_name: self.metadata.code.to_string(),
            dedup_key: None,
            objeto: get_str(raw, &["objetoCompra", "objeto"]),
            valor_estimado: parse_valor(raw.get("valorTotalEstimado")),
            orgao: get_str(&orgao, &["razaoSocial", "nome"]),
            cnpj_orgao: get_str(&orgao, &["cnpj"]),
            uf: get_str(&unidade, &["ufSigla", "uf"]),
            municipio: get_str(&unidade, &["municipioNome", "municipio"]),
            data_publicacao: parse_datetime(raw.get("dataPublicacaoPncp")),
            data_abertura: parse_datetime(raw.get("dataAberturaProposta")),
            data_encerramento: parse_datetime(raw.get("dataEncerramentoProposta")),
            numero_edital: get_str(raw, &["numeroCompra"]),
            ano,
            modalidade: get_str(raw, &["modalidadeNome"]),
            situacao: get_str(raw, &["situacaoCompraNome"]),
            esfera: get_str(&orgao, &["esferaId"]),
            poder: get_str(&orgao, &["poderId"]),
            link_edital: get_str(raw, &["linkSistemaOrigem"]),
            link_portal: get_str(raw, &["linkProcessoEletronico"]),
            raw_data: Some(raw.clone()),
        }))
    }
}

#[async_trait]
impl SourceAdapter for PncpAdapter {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    async fn health_check(&self) -> SourceStatus {
        let spec = RequestSpec::get(
            self.metadata.code,
            &format!("{}/contratacoes/publicacao", self.metadata.base_url),
        )
        .with_query(vec![
            ("dataInicial".into(), "20260101".into()),
            ("dataFinal".into(), "20260101".into()),
            ("codigoModalidadeContratacao".into(), "6".into()),
            ("pagina".into(), "1".into()),
            ("tamanhoPagina".into(), "1".into()),
        ])
        .with_timeout(HEALTH_CHECK_TIMEOUT);

        let start = Instant::now();
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.ctx.client.request(&spec)).await {
            Ok(Ok(_)) if start.elapsed() > Duration::from_secs(3) => SourceStatus::Degraded,
            Ok(Ok(_)) => SourceStatus::Available,
            Ok(Err(SourceError::Api { .. })) => SourceStatus::Degraded,
            _ => SourceStatus::Unavailable,
        }
    }

    fn fetch(self: Arc<Self>, request: FetchRequest) -> ProcurementStream {
        spawn_fetch_stream(move |tx| async move {
            let ufs: Vec<String> = match &request.ufs {
                Some(set) if !set.is_empty() => set.iter().cloned().collect(),
                _ => VALID_UFS.iter().map(|s| s.to_string()).collect(),
            };
            let seen: Arc<DashSet<String>> = Arc::new(DashSet::new());
            let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_UFS));

            let mut handles = Vec::with_capacity(ufs.len());
            for uf in ufs {
                let adapter = self.clone();
                let request = request.clone();
                let tx = tx.clone();
                let seen = seen.clone();
                let semaphore = semaphore.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire().await;
                    adapter
                        .fetch_uf_with_resilience(&request, &uf, &tx, &seen)
                        .await
                        .map_err(|e| (uf, e))
                }));
            }

            let mut failed_ufs = 0usize;
            let mut total_ufs = 0usize;
            let mut last_error: Option<SourceError> = None;
            for handle in handles {
                total_ufs += 1;
                match handle.await {
                    Ok(Ok(_)) => {}
                    Ok(Err((uf, e))) => {
                        failed_ufs += 1;
                        tracing::warn!(uf = %uf, "PNCP UF failed: {}", e);
                        last_error = Some(e);
                    }
                    Err(_) => failed_ufs += 1,
                }
            }

            // All UFs failing means the source failed; partial UF failure
            // degrades silently to fewer records.
            if failed_ufs == total_ufs && total_ufs > 0 {
                let err = last_error.unwrap_or(SourceError::Network("all UFs failed".into()));
                let _ = tx.send(Err(err)).await;
            }
        })
    }
}

fn compact_date(iso: &str) -> String {
    iso.replace('-', "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{AdaptiveTimeoutManager, ResilientClient};
    use serde_json::json;

    fn test_adapter() -> PncpAdapter {
        PncpAdapter::new(
            SourceContext {
                client: Arc::new(ResilientClient::new()),
                timeouts: Arc::new(AdaptiveTimeoutManager::new(Duration::from_secs(90))),
            },
            Duration::from_secs(90),
        )
    }

    #[test]
    fn test_compact_date() {
        assert_eq!(compact_date("2026-01-15"), "20260115");
    }

    #[test]
    fn test_normalize_maps_pncp_fields() {
        let adapter = test_adapter();
        let raw = json!({
            "numeroControlePNCP": "00000000000100-1-000123/2026",
            "objetoCompra": "Uniformes escolares  diversos",
            "valorTotalEstimado": 150000.50,
            "orgaoEntidade": {"razaoSocial": "Prefeitura de Teste", "cnpj": "00.000.000/0001-00", "esferaId": "M", "poderId": "E"},
            "unidadeOrgao": {"ufSigla": "sp", "municipioNome": "Campinas"},
            "dataPublicacaoPncp": "2026-01-15T10:30:00Z",
            "numeroCompra": "123",
            "anoCompra": 2026,
            "modalidadeNome": "Pregão Eletrônico",
            "situacaoCompraNome": "Divulgada no PNCP"
        });

        let rec = adapter.normalize(&raw).unwrap();
        assert_eq!(rec.source_name, "PNCP");
        assert_eq!(rec.uf, "SP");
        assert_eq!(rec.objeto, "Uniformes escolares diversos");
        assert_eq!(rec.dedup_key, "00000000000100:123:2026");
        assert_eq!(rec.valor_estimado, 150000.50);
    }

    #[test]
    fn test_normalize_requires_source_id() {
        let adapter = test_adapter();
        let raw = json!({"objetoCompra": "sem id"});
        assert!(matches!(
            adapter.normalize(&raw),
            Err(SourceError::Parse(_))
        ));
    }

    #[test]
    fn test_metadata_priority_is_highest() {
        assert_eq!(test_adapter().metadata().priority, 1);
    }
}
