//! Licitar Digital adapter.
//!
//! Credentialed source with no server-side UF filter; every UF
//! restriction is applied client-side during the page walk.

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

const PAGE_SIZE: u32 = 50;

pub struct LicitarAdapter {
    ctx: SourceContext,
    metadata: SourceMetadata,
    api_key: String,
}

impl LicitarAdapter {
    pub fn new(ctx: SourceContext, api_key: String) -> Self {
        let base_url = std::env::var("LICITAR_API_URL")
            .unwrap_or_else(|_| "https://api.licitar.digital/v1".to_string());
        Self {
            ctx,
            metadata: SourceMetadata {
                name: "Licitar Digital",
                code: "LICITAR",
                base_url,
                capabilities: HashSet::from([
                    SourceCapability::Pagination,
                    SourceCapability::DateRange,
                ]),
                rate_limit_rps: 5.0,
                typical_response_ms: 3000,
                priority: 3,
            },
            api_key,
        }
    }

    pub fn normalize(&self, raw: &Value) -> Result<UnifiedProcurement, SourceError> {
        let source_id = get_str(raw, &["id", "codigo"]);
        if source_id.is_empty() {
            return Err(SourceError::Parse("record without id".into()));
        }

        Ok(UnifiedProcurement::new(ProcurementFields {
            source_id,
            source_name: self.metadata.code.to_string(),
            dedup_key: None,
            objeto: get_str(raw, &["objeto", "descricao"]),
            valor_estimado: parse_valor(raw.get("valorEstimado").or_else(|| raw.get("valor"))),
            orgao: get_str(raw, &["orgaoNome", "orgao"]),
            cnpj_orgao: get_str(raw, &["orgaoCnpj", "cnpj"]),
            uf: get_str(raw, &["uf"]),
            municipio: get_str(raw, &["municipio"]),
            data_publicacao: parse_datetime(raw.get("dataPublicacao")),
            data_abertura: parse_datetime(raw.get("dataAbertura")),
            data_encerramento: parse_datetime(raw.get("dataLimite")),
            numero_edital: get_str(raw, &["numeroEdital", "numero"]),
            ano: get_str(raw, &["ano"]),
            modalidade: get_str(raw, &["modalidade"]),
            situacao: get_str(raw, &["situacao"]),
            esfera: get_str(raw, &["esfera"]),
            poder: get_str(raw, &["poder"]),
            link_edital: get_str(raw, &["linkEdital"]),
            link_portal: get_str(raw, &["linkPortal"]),
            raw_data: Some(raw.clone()),
        }))
    }
}

#[async_trait]
impl SourceAdapter for LicitarAdapter {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    async fn health_check(&self) -> SourceStatus {
        if self.api_key.is_empty() {
            return SourceStatus::Unavailable;
        }
        let spec = RequestSpec::get(
            self.metadata.code,
            &format!("{}/licitacoes", self.metadata.base_url),
        )
        .with_header("Authorization", &format!("Bearer {}", self.api_key))
        .with_query(vec![("limite".into(), "1".into())])
        .with_timeout(HEALTH_CHECK_TIMEOUT);

        let start = Instant::now();
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.ctx.client.request(&spec)).await {
            Ok(Ok(_)) if start.elapsed() > Duration::from_secs(3) => SourceStatus::Degraded,
            Ok(Ok(_)) => SourceStatus::Available,
            Ok(Err(SourceError::Auth(_))) => SourceStatus::Unavailable,
            Ok(Err(SourceError::Api { .. })) => SourceStatus::Degraded,
            _ => SourceStatus::Unavailable,
        }
    }

    fn fetch(self: Arc<Self>, request: FetchRequest) -> ProcurementStream {
        spawn_fetch_stream(move |tx| async move {
            if self.api_key.is_empty() {
                tracing::warn!("Licitar Digital fetch skipped: no API key");
                return;
            }

            let mut seen: HashSet<String> = HashSet::new();
            let mut pagina: u32 = 1;
            loop {
                let spec = RequestSpec::get(
                    self.metadata.code,
                    &format!("{}/licitacoes", self.metadata.base_url),
                )
                .with_header("Authorization", &format!("Bearer {}", self.api_key))
                .with_query(vec![
                    ("dataInicio".into(), request.data_inicial.clone()),
                    ("dataFim".into(), request.data_final.clone()),
                    ("pagina".into(), pagina.to_string()),
                    ("limite".into(), PAGE_SIZE.to_string()),
                ])
                .with_timeout(Duration::from_secs(20))
                .cached();

                let response = match self.ctx.client.request(&spec).await {
                    Ok(r) => r,
                    Err(e) => {
                        if seen.is_empty() {
                            let _ = tx.send(Err(e)).await;
                        } else {
                            tracing::warn!(
                                partial = seen.len(),
                                "Licitar page {} failed, keeping partial results: {}",
                                pagina,
                                e
                            );
                        }
                        return;
                    }
                };

                let data = response
                    .get("itens")
                    .or_else(|| response.get("data"))
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
                            tracing::warn!("failed to normalize Licitar record: {}", e);
                            continue;
                        }
                    };
                    if !seen.insert(record.source_id.clone()) {
                        continue;
                    }
                    // No server-side UF filter on this upstream.
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
                if pagina > MAX_PAGES {
                    tracing::warn!("Licitar page cap reached");
                    break;
                }
            }
        })
    }
}
