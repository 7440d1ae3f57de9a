//! ComprasGov adapter: federal open data, no credentials required.
//!
//! Doubles as the consolidation engine's last-resort fallback: it is
//! constructed even when disabled as a primary source and invoked with a
//! short timeout when every other source has failed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::models::procurement::{
    ProcurementFields, SourceCapability, SourceMetadata, UnifiedProcurement,
};
use crate::resilience::{RequestSpec, SourceError};

use super::{
    get_str, parse_datetime, parse_valor, spawn_fetch_stream, FetchRequest, ProcurementStream,
    SourceAdapter, SourceContext, SourceStatus, HEALTH_CHECK_TIMEOUT, MAX_PAGES,
};

const PAGE_SIZE: u32 = 100;

pub struct ComprasGovAdapter {
    ctx: SourceContext,
    metadata: SourceMetadata,
}

impl ComprasGovAdapter {
    pub fn new(ctx: SourceContext) -> Self {
        Self {
            ctx,
            metadata: SourceMetadata {
                name: "ComprasGov - Dados Abertos Federal",
                code: "COMPRAS_GOV",
                base_url: "https://compras.dados.gov.br".to_string(),
                capabilities: HashSet::from([
                    SourceCapability::Pagination,
                    SourceCapability::DateRange,
                    SourceCapability::FilterByUf,
                ]),
                rate_limit_rps: 2.0,
                typical_response_ms: 4000,
                priority: 4,
            },
        }
    }

    pub fn normalize(&self, raw: &Value) -> Result<UnifiedProcurement, SourceError> {
        let source_id = get_str(raw, &["identificador", "id"]);
        if source_id.is_empty() {
            return Err(SourceError::Parse("record without identificador".into()));
        }

        Ok(UnifiedProcurement::new(ProcurementFields {
            source_id,
            source_name: self.metadata.code.to_string(),
            dedup_key: None,
            objeto: get_str(raw, &["objeto", "descricao"]),
            valor_estimado: parse_valor(raw.get("valor_estimado")),
            orgao: get_str(raw, &["nome_orgao", "orgao"]),
            cnpj_orgao: get_str(raw, &["cnpj_orgao"]),
            uf: get_str(raw, &["uf"]),
            municipio: get_str(raw, &["municipio"]),
            data_publicacao: parse_datetime(raw.get("data_publicacao")),
            data_abertura: parse_datetime(raw.get("data_abertura_proposta")),
            data_encerramento: parse_datetime(raw.get("data_entrega_proposta")),
            numero_edital: get_str(raw, &["numero_aviso", "numero"]),
            ano: get_str(raw, &["ano"]),
            modalidade: get_str(raw, &["modalidade_descricao", "modalidade"]),
            situacao: get_str(raw, &["situacao_aviso", "situacao"]),
            esfera: "F".to_string(), // federal portal
            poder: get_str(raw, &["poder"]),
            link_edital: get_str(raw, &["url_edital"]),
            link_portal: get_str(raw, &["url"]),
            raw_data: Some(raw.clone()),
        }))
    }
}

#[async_trait]
impl SourceAdapter for ComprasGovAdapter {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    async fn health_check(&self) -> SourceStatus {
        let spec = RequestSpec::get(
            self.metadata.code,
            &format!("{}/licitacoes/v1/licitacoes.json", self.metadata.base_url),
        )
        .with_query(vec![("offset".into(), "0".into())])
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
            let mut seen: HashSet<String> = HashSet::new();
            let mut pagina: u32 = 0;
            loop {
                let mut query = vec![
                    (
                        "data_publicacao_min".into(),
                        request.data_inicial.clone(),
                    ),
                    ("data_publicacao_max".into(), request.data_final.clone()),
                    ("offset".into(), (pagina * PAGE_SIZE).to_string()),
                ];
                if let Some(ufs) = &request.ufs {
                    if ufs.len() == 1 {
                        if let Some(uf) = ufs.iter().next() {
                            query.push(("uf".into(), uf.clone()));
                        }
                    }
                }

                let spec = RequestSpec::get(
                    self.metadata.code,
                    &format!("{}/licitacoes/v1/licitacoes.json", self.metadata.base_url),
                )
                .with_query(query)
                .with_timeout(Duration::from_secs(30))
                .cached();

                let response = match self.ctx.client.request(&spec).await {
                    Ok(r) => r,
                    Err(e) => {
                        if seen.is_empty() {
                            let _ = tx.send(Err(e)).await;
                        }
                        return;
                    }
                };

                let data = response
                    .pointer("/_embedded/licitacoes")
                    .or_else(|| response.get("licitacoes"))
                    .and_then(|d| d.as_array())
                    .cloned()
                    .unwrap_or_default();
                if data.is_empty() {
                    break;
                }

                for raw in &data {
                    let record = match self.normalize(raw) {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!("failed to normalize ComprasGov record: {}", e);
                            continue;
                        }
                    };
                    if !seen.insert(record.source_id.clone()) {
                        continue;
                    }
                    if let Some(ufs) = &request.ufs {
                        if !ufs.is_empty() && !ufs.contains(&record.uf) {
                            continue;
                        }
                    }
                    if tx.send(Ok(record)).await.is_err() {
                        return;
                    }
                }

                pagina += 1;
                if pagina >= MAX_PAGES {
                    tracing::warn!("ComprasGov page cap reached");
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{AdaptiveTimeoutManager, ResilientClient};
    use serde_json::json;

    #[test]
    fn test_normalize_marks_federal_sphere() {
        let adapter = ComprasGovAdapter::new(SourceContext {
            client: Arc::new(ResilientClient::new()),
            timeouts: Arc::new(AdaptiveTimeoutManager::new(Duration::from_secs(90))),
        });
        let raw = json!({
            "identificador": "CG-3",
            "objeto": "Gêneros alimentícios",
            "uf": "DF",
            "valor_estimado": 50000
        });
        let rec = adapter.normalize(&raw).unwrap();
        assert_eq!(rec.esfera, "F");
        assert_eq!(rec.source_name, "COMPRAS_GOV");
    }
}
