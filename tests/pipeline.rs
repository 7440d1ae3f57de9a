//! End-to-end pipeline tests with stubbed sources.
//!
//! These exercise the whole orchestrator (state machine, progress
//! tracker, consolidation, filter) without a database, Redis, or any
//! real upstream. The LLM arbiter runs disabled (safe defaults) so only
//! unambiguous bids survive the filter.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use bidiq::consolidation::ConsolidationService;
use bidiq::correlation::RequestContext;
use bidiq::errors::AppError;
use bidiq::llm::LlmArbiter;
use bidiq::models::procurement::{
    ProcurementFields, SourceCapability, SourceMetadata, UnifiedProcurement,
};
use bidiq::models::search::SearchRequest;
use bidiq::pipeline::SearchPipeline;
use bidiq::progress::ProgressRegistry;
use bidiq::quota::QuotaService;
use bidiq::resilience::SourceError;
use bidiq::search_state::StateMachineRegistry;
use bidiq::sources::{
    FetchRequest, ProcurementStream, SourceAdapter, SourceHealthRegistry, SourceStatus,
};

struct StubSource {
    metadata: SourceMetadata,
    bids: Vec<UnifiedProcurement>,
    delay: Duration,
    fail: bool,
}

impl StubSource {
    fn new(code: &'static str, priority: u32) -> Self {
        Self {
            metadata: SourceMetadata {
                name: code,
                code,
                base_url: "http://localhost".into(),
                capabilities: HashSet::from([SourceCapability::Pagination]),
                rate_limit_rps: 100.0,
                typical_response_ms: 10,
                priority,
            },
            bids: Vec::new(),
            delay: Duration::from_millis(0),
            fail: false,
        }
    }

    fn with_bid(mut self, bid: UnifiedProcurement) -> Self {
        self.bids.push(bid);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

#[async_trait]
impl SourceAdapter for StubSource {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    async fn health_check(&self) -> SourceStatus {
        SourceStatus::Available
    }

    fn fetch(self: Arc<Self>, _request: FetchRequest) -> ProcurementStream {
        let bids = self.bids.clone();
        let delay = self.delay;
        let fail = self.fail;
        Box::pin(
            futures::stream::once(async move {
                tokio::time::sleep(delay).await;
            })
            .flat_map(move |_| {
                let items: Vec<Result<UnifiedProcurement, SourceError>> = if fail {
                    vec![Err(SourceError::Network("upstream down".into()))]
                } else {
                    bids.clone().into_iter().map(Ok).collect()
                };
                futures::stream::iter(items)
            }),
        )
    }
}

fn bid(source: &str, objeto: &str, valor: f64, edital: &str) -> UnifiedProcurement {
    UnifiedProcurement::new(ProcurementFields {
        source_id: format!("{}-{}", source, edital),
        source_name: source.into(),
        objeto: objeto.into(),
        valor_estimado: valor,
        uf: "SP".into(),
        cnpj_orgao: "00000000000100".into(),
        numero_edital: edital.into(),
        ano: "2026".into(),
        ..Default::default()
    })
}

fn pipeline_with(sources: Vec<StubSource>, budget: Duration) -> SearchPipeline {
    let adapters: HashMap<String, Arc<dyn SourceAdapter>> = sources
        .into_iter()
        .map(|s| {
            let code = s.metadata.code.to_string();
            (code, Arc::new(s) as Arc<dyn SourceAdapter>)
        })
        .collect();

    let consolidation = Arc::new(ConsolidationService::new(
        adapters,
        Arc::new(SourceHealthRegistry::new()),
        Duration::from_secs(5),
        Duration::from_secs(10),
        true,
        None,
    ));

    SearchPipeline {
        store: None,
        quota: Arc::new(QuotaService::new(None, vec![])),
        consolidation,
        llm: Arc::new(LlmArbiter::disabled()),
        sanctions: None,
        progress: Arc::new(ProgressRegistry::new(None)),
        machines: Arc::new(StateMachineRegistry::new()),
        excel: None,
        budget,
    }
}

fn vestuario_request() -> SearchRequest {
    SearchRequest {
        ufs: vec!["SP".into()],
        data_inicial: "2026-01-01".into(),
        data_final: "2026-01-31".into(),
        setor_id: Some("vestuario".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_search_completes_end_to_end() {
    let pipeline = pipeline_with(
        vec![StubSource::new("PNCP", 1).with_bid(bid(
            "PNCP",
            "Uniformes escolares diversos para rede municipal de ensino",
            3_000_000.0,
            "10/2026",
        ))],
        Duration::from_secs(30),
    );

    let response = pipeline
        .run(&RequestContext::default(), "user-1", vestuario_request())
        .await
        .unwrap();

    assert_eq!(response.total_raw, 1);
    assert_eq!(response.total_filtered, 1);
    assert_eq!(response.valor_total, 3_000_000.0);
    assert!(!response.is_partial);
    assert!(response.resumo_executivo.is_none()); // LLM disabled
    assert_eq!(response.destaques.len(), 1);
    // Free plan carries no spreadsheet entitlement.
    assert_eq!(response.excel.status, "não incluído no plano");
    // Registries are cleaned up after the terminal state.
    assert!(pipeline.machines.is_empty());
    assert_eq!(pipeline.progress.active_count(), 0);
}

#[tokio::test]
async fn test_partial_results_reported() {
    let pipeline = pipeline_with(
        vec![
            StubSource::new("PNCP", 1).with_bid(bid(
                "PNCP",
                "Uniformes escolares para creches",
                50_000.0,
                "11/2026",
            )),
            StubSource::new("LICITAR", 3).failing(),
        ],
        Duration::from_secs(30),
    );

    let response = pipeline
        .run(&RequestContext::default(), "user-2", vestuario_request())
        .await
        .unwrap();

    assert!(response.is_partial);
    assert!(response
        .degradation_reason
        .as_ref()
        .unwrap()
        .contains("LICITAR"));
    assert_eq!(response.total_filtered, 1);
}

#[tokio::test]
async fn test_all_sources_failed_surfaces_error() {
    let pipeline = pipeline_with(
        vec![
            StubSource::new("PNCP", 1).failing(),
            StubSource::new("LICITAR", 3).failing(),
        ],
        Duration::from_secs(30),
    );

    let err = pipeline
        .run(&RequestContext::default(), "user-3", vestuario_request())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AllSourcesFailed(_)));
}

#[tokio::test]
async fn test_budget_timeout_is_terminal() {
    let pipeline = pipeline_with(
        vec![StubSource::new("PNCP", 1)
            .with_bid(bid("PNCP", "Uniformes escolares", 1_000.0, "12/2026"))
            .with_delay(Duration::from_secs(5))],
        Duration::from_millis(300),
    );

    let err = pipeline
        .run(&RequestContext::default(), "user-4", vestuario_request())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PipelineTimeout));
    assert!(pipeline.machines.is_empty());
}

#[tokio::test]
async fn test_validation_failure_short_circuits() {
    let pipeline = pipeline_with(vec![StubSource::new("PNCP", 1)], Duration::from_secs(30));

    let mut request = vestuario_request();
    request.ufs = vec!["XX".into()];
    let err = pipeline
        .run(&RequestContext::default(), "user-5", request)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn test_cross_source_dedup_keeps_priority_source() {
    // Same edital from both sources; priority 1 wins.
    let pipeline = pipeline_with(
        vec![
            StubSource::new("PNCP", 1).with_bid(bid(
                "PNCP",
                "Uniformes escolares lote único",
                80_000.0,
                "77/2026",
            )),
            StubSource::new("PORTAL_COMPRAS", 2).with_bid(bid(
                "PORTAL_COMPRAS",
                "Uniformes escolares lote único",
                80_000.0,
                "77/2026",
            )),
        ],
        Duration::from_secs(30),
    );

    let response = pipeline
        .run(&RequestContext::default(), "user-6", vestuario_request())
        .await
        .unwrap();

    assert_eq!(response.total_raw, 1);
    assert_eq!(response.licitacoes[0].source_name, "PNCP");
}

#[tokio::test]
async fn test_uncertain_bid_rejected_when_arbiter_disabled() {
    // ~2% keyword density lands in the uncertain zone; the disabled
    // arbiter answers with the safe default (reject).
    let filler = "melhorias urbanas drenagem pavimentacao ".repeat(12);
    let objeto = format!("{} incluindo uniformes para agentes de transito", filler);

    let pipeline = pipeline_with(
        vec![StubSource::new("PNCP", 1).with_bid(bid("PNCP", &objeto, 47_600_000.0, "99/2026"))],
        Duration::from_secs(30),
    );

    let response = pipeline
        .run(&RequestContext::default(), "user-7", vestuario_request())
        .await
        .unwrap();

    assert_eq!(response.total_raw, 1);
    assert_eq!(response.total_filtered, 0);
    assert_eq!(response.filter_stats.llm_rejected, 1);
}
