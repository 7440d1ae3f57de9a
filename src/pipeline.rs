//! The eight-stage search pipeline.
//!
//! validate → quota-check → fetch → filter → enrich → generate →
//! persist → notify, all inside the `SEARCH_FETCH_TIMEOUT` budget. Each
//! stage is slotted into the state machine and mirrored to the progress
//! tracker. The quota is charged atomically only when the fetch stage
//! succeeds, so a crash mid-filter never double-bills a user.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::consolidation::ConsolidationService;
use crate::correlation::RequestContext;
use crate::errors::AppError;
use crate::filter::{FilterCriteria, FilterEngine, FilterStats, SanctionsOracle};
use crate::llm::LlmArbiter;
use crate::models::procurement::UnifiedProcurement;
use crate::models::search::{SearchRequest, SearchState};
use crate::progress::ProgressRegistry;
use crate::quota::QuotaService;
use crate::sanctions::SanctionsChecker;
use crate::search_state::StateMachineRegistry;
use crate::sources::FetchRequest;
use crate::store::PgStore;

/// Bids closing within this window get the urgency hint.
const URGENCY_WINDOW_DAYS: i64 = 7;

/// Storage-only artifact upload. Implementations write the spreadsheet
/// to object storage and return its URL; there is deliberately no
/// in-band byte fallback.
#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    async fn upload_excel(
        &self,
        search_id: &str,
        bids: &[UnifiedProcurement],
    ) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ExcelArtifact {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub search_id: String,
    pub total_raw: usize,
    pub total_filtered: usize,
    pub valor_total: f64,
    pub is_partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degradation_reason: Option<String>,
    pub sources: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumo_executivo: Option<String>,
    pub destaques: Vec<String>,
    pub urgentes: usize,
    pub excel: ExcelArtifact,
    pub licitacoes: Vec<UnifiedProcurement>,
    pub filter_stats: FilterStats,
}

pub struct SearchPipeline {
    pub store: Option<PgStore>,
    pub quota: Arc<QuotaService>,
    pub consolidation: Arc<ConsolidationService>,
    pub llm: Arc<LlmArbiter>,
    pub sanctions: Option<Arc<SanctionsChecker>>,
    pub progress: Arc<ProgressRegistry>,
    pub machines: Arc<StateMachineRegistry>,
    pub excel: Option<Arc<dyn ArtifactUploader>>,
    pub budget: Duration,
}

impl SearchPipeline {
    /// Execute one search end to end. Terminal failures transition the
    /// state machine and emit a final progress event before returning.
    pub async fn run(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        request: SearchRequest,
    ) -> Result<SearchResponse, AppError> {
        let search_id = request
            .search_id
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let ctx = ctx.clone().with_search_id(&search_id);

        let machine = self.machines.create(&search_id, self.store.clone());
        let tracker = self
            .progress
            .create_tracker(&search_id, request.ufs.len())
            .await;

        let result = tokio::time::timeout(
            self.budget,
            self.run_stages(&ctx, user_id, &search_id, request),
        )
        .await;

        let outcome = match result {
            Ok(Ok(response)) => {
                machine.transition_to(SearchState::Completed, Some("notify"), json!({}));
                tracker.emit_complete().await;
                Ok(response)
            }
            Ok(Err(e)) => {
                match &e {
                    AppError::QuotaExceeded { .. } | AppError::RateLimitExceeded { .. } => {
                        machine.rate_limited(60);
                    }
                    AppError::PipelineTimeout => {
                        machine.timeout(None);
                    }
                    AppError::Validation(msg) => {
                        machine.fail("validation", msg, Some("validate"));
                    }
                    AppError::AllSourcesFailed(reason) => {
                        machine.fail("all_sources_failed", reason, Some("fetch"));
                    }
                    other => {
                        machine.fail("internal", &other.to_string(), None);
                    }
                }
                tracker.emit_error(&e.to_string()).await;
                Err(e)
            }
            Err(_) => {
                tracing::warn!(
                    search_id = %search_id,
                    budget_s = self.budget.as_secs(),
                    "search exceeded the pipeline budget"
                );
                machine.timeout(None);
                tracker.emit_error("Tempo limite excedido").await;
                Err(AppError::PipelineTimeout)
            }
        };

        self.machines.remove(&search_id);
        self.progress.remove_tracker(&search_id);
        outcome
    }

    async fn run_stages(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        search_id: &str,
        request: SearchRequest,
    ) -> Result<SearchResponse, AppError> {
        let machine = self
            .machines
            .get(search_id)
            .ok_or_else(|| anyhow::anyhow!("state machine missing for {}", search_id))?;
        let tracker = self
            .progress
            .get_tracker(search_id)
            .ok_or_else(|| anyhow::anyhow!("tracker missing for {}", search_id))?;

        // Stage 1: validate.
        machine.transition_to(SearchState::Validating, Some("validate"), json!({}));
        tracker
            .emit("validating", 5, "Validando parâmetros", json!({}))
            .await;
        request.validate()?;
        let criteria = FilterCriteria::from_request(&request)?;

        if let Some(store) = &self.store {
            let keywords = request
                .termos_busca
                .as_ref()
                .map(|t| serde_json::to_value(t).unwrap_or(serde_json::Value::Null));
            if let Err(e) = store
                .create_search_session(
                    search_id,
                    user_id,
                    request.setor_id.as_deref(),
                    &request.ufs,
                    &request.data_inicial,
                    &request.data_final,
                    keywords.as_ref(),
                )
                .await
            {
                tracing::warn!(
                    search_id = %search_id,
                    correlation_id = %ctx.correlation_id,
                    "failed to create session row: {}",
                    e
                );
            }
        }

        // Stage 2: quota check (read-only; the charge happens after
        // fetch succeeds).
        let quota_info = self.quota.check_quota(user_id).await?;
        if !quota_info.allowed {
            let limit = quota_info
                .capabilities
                .max_requests_per_month
                .unwrap_or(u32::MAX);
            return Err(AppError::QuotaExceeded {
                used: quota_info.quota_used,
                limit,
            });
        }

        // Stage 3: fetch.
        machine.transition_to(SearchState::Fetching, Some("fetch"), json!({}));
        tracker
            .emit("fetching", 10, "Consultando fontes", json!({}))
            .await;

        let fetch_request = FetchRequest {
            data_inicial: request.data_inicial.clone(),
            data_final: request.data_final.clone(),
            ufs: Some(request.uf_set()),
            modalidades: request.modalidades.clone().unwrap_or_default(),
            status: None,
        };

        let progress_tracker = tracker.clone();
        let on_source_complete: crate::consolidation::SourceCompleteCallback =
            Arc::new(move |code: &str, count: usize, error: Option<&str>| {
                let tracker = progress_tracker.clone();
                let code = code.to_string();
                let failed = error.is_some();
                tokio::spawn(async move {
                    if failed {
                        tracker
                            .emit(
                                "fetching",
                                10,
                                &format!("Fonte {} indisponível", code),
                                json!({"source": code, "degraded": true}),
                            )
                            .await;
                    } else {
                        tracker.emit_uf_complete(&code, count).await;
                    }
                });
            });

        let consolidation = self
            .consolidation
            .fetch_all(&fetch_request, Some(on_source_complete))
            .await
            .map_err(|e| AppError::AllSourcesFailed(e.to_string()))?;

        // Charge the quota atomically before leaving fetch.
        self.quota.consume_quota(user_id).await?;

        // Stage 4: filter.
        machine.transition_to(
            SearchState::Filtering,
            Some("filter"),
            json!({"raw": consolidation.records.len()}),
        );
        tracker
            .emit(
                "filtering",
                60,
                "Aplicando filtros de relevância",
                json!({"raw": consolidation.records.len()}),
            )
            .await;

        let sanctions_oracle: Option<&dyn SanctionsOracle> =
            self.sanctions.as_deref().map(|s| s as &dyn SanctionsOracle);
        let engine = FilterEngine::new(self.llm.as_ref(), sanctions_oracle);
        let total_raw = consolidation.total_after_dedup;
        let filtered = engine.apply(consolidation.records, &criteria).await;

        // Stage 5: enrich.
        machine.transition_to(SearchState::Enriching, Some("enrich"), json!({}));
        tracker
            .emit("enriching", 70, "Enriquecendo resultados", json!({}))
            .await;
        let now = Utc::now();
        let urgentes = filtered
            .bids
            .iter()
            .filter(|b| {
                b.data_encerramento
                    .map(|d| d > now && (d - now).num_days() <= URGENCY_WINDOW_DAYS)
                    .unwrap_or(false)
            })
            .count();

        // Stage 6: generate.
        machine.transition_to(SearchState::Generating, Some("generate"), json!({}));
        tracker
            .emit("generating", 85, "Gerando resumo", json!({}))
            .await;

        let valor_total: f64 = filtered.bids.iter().map(|b| b.valor_estimado).sum();
        let destaques: Vec<String> = filtered
            .bids
            .iter()
            .take(5)
            .map(|b| b.objeto.chars().take(200).collect())
            .collect();
        let context_label = criteria
            .sector_name
            .clone()
            .or_else(|| criteria.custom_terms.as_ref().map(|t| t.join(", ")))
            .unwrap_or_default();
        let resumo = self
            .llm
            .generate_summary(
                &context_label,
                filtered.bids.len(),
                valor_total,
                &destaques,
                quota_info.capabilities.max_summary_tokens,
            )
            .await;

        let excel = if quota_info.capabilities.allow_excel {
            match &self.excel {
                Some(uploader) => match uploader.upload_excel(search_id, &filtered.bids).await {
                    Ok(url) => ExcelArtifact {
                        status: "available".into(),
                        url: Some(url),
                    },
                    Err(e) => {
                        tracing::warn!(
                            search_id = %search_id,
                            "excel upload failed, marking unavailable: {}",
                            e
                        );
                        ExcelArtifact {
                            status: "temporariamente indisponível".into(),
                            url: None,
                        }
                    }
                },
                None => ExcelArtifact {
                    status: "temporariamente indisponível".into(),
                    url: None,
                },
            }
        } else {
            ExcelArtifact {
                status: "não incluído no plano".into(),
                url: None,
            }
        };

        // Stage 7: persist.
        machine.transition_to(SearchState::Persisting, Some("persist"), json!({}));
        tracker
            .emit("persisting", 95, "Salvando resultados", json!({}))
            .await;
        if let Some(store) = &self.store {
            let destaques_json = serde_json::to_value(&destaques).unwrap_or(json!([]));
            if let Err(e) = store
                .update_session_results(
                    search_id,
                    total_raw as i64,
                    filtered.bids.len() as i64,
                    valor_total,
                    resumo.as_deref(),
                    Some(&destaques_json),
                )
                .await
            {
                tracing::warn!(search_id = %search_id, "failed to persist results: {}", e);
            }
        }

        // Stage 8: notify. Handled by the caller (`run`), which emits
        // the terminal transition and the completion event.
        let sources = consolidation
            .source_results
            .iter()
            .map(|r| {
                json!({
                    "source": r.source_code,
                    "status": r.status.as_str(),
                    "records": r.record_count,
                    "duration_ms": r.duration_ms,
                    "error": r.error,
                })
            })
            .collect();

        Ok(SearchResponse {
            search_id: search_id.to_string(),
            total_raw,
            total_filtered: filtered.bids.len(),
            valor_total,
            is_partial: consolidation.is_partial,
            degradation_reason: consolidation.degradation_reason,
            sources,
            resumo_executivo: resumo,
            destaques,
            urgentes,
            excel,
            licitacoes: filtered.bids,
            filter_stats: filtered.stats,
        })
    }
}
