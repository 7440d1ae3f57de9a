//! Portal de Compras Públicas adapter.
//!
//! Credentialed source (`PublicKey` header), fully integrated with PNCP,
//! which makes it the main dedup overlap. Supports a single-UF
//! server-side filter; multi-UF requests are filtered client-side.

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

pub struct PortalComprasAdapter {
    ctx: SourceContext,
    metadata: SourceMetadata,
    api_key: String,
}

impl PortalComprasAdapter {
    pub fn new(ctx: SourceContext, api_key: String) -> Self {
        Self {
            ctx,
            metadata: SourceMetadata {
                name: "Portal de Compras Públicas",
                code: "PORTAL_COMPRAS",
                base_url: "https://apipcp.portaldecompraspublicas.com.br".to_string(),
                capabilities: HashSet::from([
                    SourceCapability::Pagination,
                    SourceCapability::DateRange,
                    SourceCapability::FilterByUf,
                ]),
                rate_limit_rps: 6.7,
                typical_response_ms: 2500,
                priority: 2,
            },
            api_key,
        }
    }

    fn base_spec(&self, path: &str) -> RequestSpec {
        RequestSpec::get(self.metadata.code, &format!("{}{}", self.metadata.base_url, path))
            .with_header("PublicKey", &self.api_key)
            .with_timeout(Duration::from_secs(25))
    }

    pub fn normalize(&self, raw: &Value) -> Result<UnifiedProcurement, SourceError> {
        let source_id = get_str(raw, &["codigo", "id", "processo_id"]);
        if source_id.is_empty() {
            return Err(SourceError::Parse("record without codigo".into()));
        }

        // orgao may arrive nested or as a bare string.
        let (orgao_nome, orgao_cnpj) = match raw.get("orgao") {
            Some(Value::String(s)) => (s.clone(), String::new()),
            Some(obj @ Value::Object(_)) => (get_str(obj, &["nome"]), get_str(obj, &["cnpj"])),
            _ => (get_str(raw, &["orgao_nome"]), get_str(raw, &["cnpj"])),
        };

        let data_publicacao =
            parse_datetime(raw.get("dataPublicacao").or_else(|| raw.get("data_publicacao")));
        let mut ano = get_str(raw, &["ano", "anoProcesso"]);
        if ano.is_empty() {
            if let Some(dt) = data_publicacao {
                ano = dt.format("%Y").to_string();
            }
        }

        Ok(UnifiedProcurement::new(ProcurementFields {
            source_id,
            source_name: self.metadata.code.to_string(),
            dedup_key: None,
            objeto: get_str(raw, &["objeto", "descricao"]),
            valor_estimado: parse_valor(
                raw.get("valorEstimado").or_else(|| raw.get("valor_estimado")),
            ),
            orgao: orgao_nome,
            cnpj_orgao: orgao_cnpj,
            uf: get_str(raw, &["uf", "estado"]),
            municipio: get_str(raw, &["municipio", "cidade"]),
            data_publicacao,
            data_abertura: parse_datetime(
                raw.get("dataAbertura").or_else(|| raw.get("data_abertura")),
            ),
            data_encerramento: parse_datetime(
                raw.get("dataEncerramento")
                    .or_else(|| raw.get("data_encerramento")),
            ),
            numero_edital: get_str(raw, &["numeroEdital", "numero_edital"]),
            ano,
            modalidade: get_str(raw, &["tipoLicitacao", "modalidade"]),
            situacao: get_str(raw, &["situacao", "status"]),
            esfera: get_str(raw, &["esfera"]),
            poder: get_str(raw, &["poder"]),
            link_edital: get_str(raw, &["linkDocumentos", "link_edital"]),
            link_portal: get_str(raw, &["linkPortal", "link"]),
            raw_data: Some(raw.clone()),
        }))
    }
}

#[async_trait]
impl SourceAdapter for PortalComprasAdapter {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    async fn health_check(&self) -> SourceStatus {
        if self.api_key.is_empty() {
            return SourceStatus::Unavailable;
        }
        let spec = self
            .base_spec("/api/v1/processos")
            .with_query(vec![
                ("pagina".into(), "1".into()),
                ("tamanhoPagina".into(), "1".into()),
            ])
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
                tracing::warn!("Portal de Compras fetch skipped: no API key");
                return;
            }

            // Single UF goes to the server; multiple UFs filter here.
            let (server_uf, client_filter) = match &request.ufs {
                Some(set) if set.len() == 1 => {
                    (set.iter().next().cloned(), None)
                }
                Some(set) if !set.is_empty() => (None, Some(set.clone())),
                _ => (None, None),
            };

            let mut seen: HashSet<String> = HashSet::new();
            let mut pagina: u32 = 1;
            loop {
                let mut query = vec![
                    ("dataInicial".into(), request.data_inicial.clone()),
                    ("dataFinal".into(), request.data_final.clone()),
                    ("pagina".into(), pagina.to_string()),
                    ("tamanhoPagina".into(), PAGE_SIZE.to_string()),
                ];
                if let Some(uf) = &server_uf {
                    query.push(("uf".into(), uf.clone()));
                }

                let spec = self
                    .base_spec("/api/v1/processos")
                    .with_query(query)
                    .cached();

                let response = match self.ctx.client.request(&spec).await {
                    Ok(r) => r,
                    Err(e) => {
                        if seen.is_empty() {
                            let _ = tx.send(Err(e)).await;
                        } else {
                            tracing::warn!(
                                partial = seen.len(),
                                "Portal de Compras page {} failed, returning partial results: {}",
                                pagina,
                                e
                            );
                        }
                        return;
                    }
                };

                let data = response
                    .get("data")
                    .or_else(|| response.get("processos"))
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
                            tracing::warn!("failed to normalize Portal de Compras record: {}", e);
                            continue;
                        }
                    };
                    if !seen.insert(record.source_id.clone()) {
                        continue;
                    }
                    if let Some(filter) = &client_filter {
                        if !filter.contains(&record.uf) {
                            continue;
                        }
                    }
                    if tx.send(Ok(record)).await.is_err() {
                        return;
                    }
                }

                let total_paginas = response
                    .get("totalPaginas")
                    .or_else(|| response.get("total_paginas"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(1) as u32;
                if pagina >= total_paginas || pagina >= MAX_PAGES {
                    if pagina >= MAX_PAGES {
                        tracing::warn!("Portal de Compras page cap reached");
                    }
                    break;
                }
                pagina += 1;
            }
        })
    }
}
