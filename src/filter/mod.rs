//! Layered filtering and relevance pipeline.
//!
//! Layer order: UF → modality → value range → membership filters →
//! deadline-open → keywords (with uncertain-zone LLM arbitration) →
//! synonym recovery → sanctions → zero-result relaxation → ordering.
//! The LLM arbiter and the sanctions service are consulted as oracles
//! behind narrow traits so the engine stays testable in isolation.

pub mod keywords;
pub mod synonyms;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;

use crate::errors::AppError;
use crate::models::procurement::UnifiedProcurement;
use crate::models::sanctions::SanctionsStatus;
use crate::models::search::{Ordenacao, SearchRequest};
use crate::models::sector::{get_sector, Sector};

use keywords::{match_keywords, normalize_text, PromptLevel};
use synonyms::{
    count_distinct_canonicals, find_synonym_matches, SynonymMatch, AUTO_APPROVE_SYNONYMS,
    SIMILARITY_THRESHOLD,
};

/// Below this many lexical acceptances the synonym layer also runs.
const SYNONYM_LAYER_THRESHOLD: usize = 3;

// ── Oracle seams ─────────────────────────────────────────────

/// One classification request to the LLM arbiter.
#[derive(Debug, Clone)]
pub struct ArbiterRequest {
    pub objeto: String,
    pub valor: f64,
    pub sector_name: Option<String>,
    pub custom_terms: Option<Vec<String>>,
    pub prompt_level: PromptLevel,
    pub rejection_reason: Option<String>,
    pub near_miss_info: Option<String>,
}

#[async_trait]
pub trait RelevanceArbiter: Send + Sync {
    /// Uncertain zone: is the bid primarily about the sector/terms?
    async fn primary_match(&self, request: &ArbiterRequest) -> bool;
    /// Recovery: is a rejected bid nevertheless relevant?
    async fn recovery(&self, request: &ArbiterRequest) -> bool;
}

#[async_trait]
pub trait SanctionsOracle: Send + Sync {
    /// Tri-state lookup; `Unavailable` is fail-open downstream.
    async fn status_for(&self, cnpj: &str) -> SanctionsStatus;
}

// ── Criteria and stats ───────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FilterCriteria {
    pub ufs: HashSet<String>,
    pub modalidades: Option<HashSet<u8>>,
    pub valor_min: Option<f64>,
    pub valor_max: Option<f64>,
    pub status: Option<HashSet<String>>,
    pub esferas: Option<HashSet<String>>,
    pub municipios: Option<HashSet<String>>,
    pub open_only: bool,
    pub keywords: Vec<String>,
    pub exclusions: Vec<String>,
    pub sector_id: Option<String>,
    pub sector_name: Option<String>,
    pub custom_terms: Option<Vec<String>>,
    pub min_match: usize,
    pub show_below_min_match: bool,
    pub check_sanctions: bool,
    pub allow_relaxation: bool,
    pub ordenacao: Ordenacao,
}

impl FilterCriteria {
    /// Resolve a validated search request into filter criteria. Custom
    /// terms win over the sector when both are present.
    pub fn from_request(request: &SearchRequest) -> Result<Self, AppError> {
        let custom_terms: Option<Vec<String>> = request.termos_busca.as_ref().map(|terms| {
            terms
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        });
        let has_custom = custom_terms.as_ref().map(|t| !t.is_empty()).unwrap_or(false);

        let (keywords, exclusions, sector_id, sector_name) = if has_custom {
            (
                custom_terms.clone().unwrap_or_default(),
                request.termos_exclusao.clone().unwrap_or_default(),
                None,
                None,
            )
        } else {
            let id = request
                .setor_id
                .as_deref()
                .ok_or_else(|| AppError::Validation("Informe um setor ou termos de busca".into()))?;
            let sector: &Sector = get_sector(id)
                .ok_or_else(|| AppError::Validation(format!("Setor desconhecido: {}", id)))?;
            let mut exclusions: Vec<String> =
                sector.exclusions.iter().map(|s| s.to_string()).collect();
            exclusions.extend(request.termos_exclusao.clone().unwrap_or_default());
            (
                sector.keywords.iter().map(|s| s.to_string()).collect(),
                exclusions,
                Some(sector.id.to_string()),
                Some(sector.name.to_string()),
            )
        };

        Ok(Self {
            ufs: request.uf_set(),
            modalidades: request
                .modalidades
                .as_ref()
                .map(|m| m.iter().copied().collect()),
            valor_min: request.valor_minimo,
            valor_max: request.valor_maximo,
            status: request
                .status
                .as_ref()
                .map(|s| s.iter().map(|x| normalize_text(x)).collect()),
            esferas: request
                .esferas
                .as_ref()
                .map(|s| s.iter().map(|x| normalize_text(x)).collect()),
            municipios: request
                .municipios
                .as_ref()
                .map(|s| s.iter().map(|x| normalize_text(x)).collect()),
            open_only: matches!(
                request.modo_busca,
                crate::models::search::ModoBusca::AbertasApenas
            ),
            keywords,
            exclusions,
            sector_id,
            sector_name,
            custom_terms: has_custom.then(|| custom_terms.unwrap_or_default()),
            min_match: 1,
            show_below_min_match: false,
            check_sanctions: request.check_sanctions,
            allow_relaxation: true,
            ordenacao: request.ordenacao,
        })
    }
}

/// Per-layer rejection counters plus oracle outcomes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FilterStats {
    pub input_count: usize,
    pub rejected_uf: usize,
    pub rejected_modalidade: usize,
    pub rejected_valor: usize,
    pub rejected_status: usize,
    pub rejected_esfera: usize,
    pub rejected_municipio: usize,
    pub rejected_prazo_encerrado: usize,
    pub rejected_sem_keyword: usize,
    pub rejected_exclusao: usize,
    pub hidden_by_min_match: usize,
    pub synonym_recovered: usize,
    pub llm_approved: usize,
    pub llm_rejected: usize,
    pub sanctions_dropped: usize,
    pub relaxations_applied: Vec<String>,
    pub output_count: usize,
}

#[derive(Debug)]
pub struct FilterOutcome {
    pub bids: Vec<UnifiedProcurement>,
    pub stats: FilterStats,
}

// ── Modality name table ──────────────────────────────────────

/// Official modality names per federal law, keyed by code. Codes 9 and
/// 14 never appear here; they are rejected at request validation.
pub fn modalidade_nome(code: u8) -> &'static str {
    match code {
        1 => "Leilão Eletrônico",
        2 => "Diálogo Competitivo",
        3 => "Concurso",
        4 => "Concorrência Eletrônica",
        5 => "Concorrência Presencial",
        6 => "Pregão Eletrônico",
        7 => "Pregão Presencial",
        8 => "Dispensa de Licitação",
        10 => "Manifestação de Interesse",
        11 => "Pré-qualificação",
        12 => "Credenciamento",
        13 => "Leilão Presencial",
        _ => "",
    }
}

fn modalidade_matches(record_modalidade: &str, allowed: &HashSet<u8>) -> bool {
    if record_modalidade.trim().is_empty() {
        // Missing modality is conservatively kept.
        return true;
    }
    let record_tokens: HashSet<String> = normalize_text(record_modalidade)
        .split_whitespace()
        .filter(|t| t.chars().any(|c| c.is_alphanumeric()))
        .map(|t| t.to_string())
        .collect();

    allowed.iter().any(|code| {
        let name = modalidade_nome(*code);
        if name.is_empty() {
            return false;
        }
        normalize_text(name)
            .split_whitespace()
            .all(|token| record_tokens.contains(token))
    })
}

// ── Engine ───────────────────────────────────────────────────

pub struct FilterEngine<'a> {
    arbiter: &'a dyn RelevanceArbiter,
    sanctions: Option<&'a dyn SanctionsOracle>,
}

struct Scored {
    bid: UnifiedProcurement,
    score: f64,
}

impl<'a> FilterEngine<'a> {
    pub fn new(
        arbiter: &'a dyn RelevanceArbiter,
        sanctions: Option<&'a dyn SanctionsOracle>,
    ) -> Self {
        Self { arbiter, sanctions }
    }

    /// Run the full layered pipeline over deduplicated bids.
    pub async fn apply(
        &self,
        bids: Vec<UnifiedProcurement>,
        criteria: &FilterCriteria,
    ) -> FilterOutcome {
        let input_count = bids.len();

        // Layer 1: UF. Never relaxed, so applied once up front.
        let mut stats = FilterStats {
            input_count,
            ..Default::default()
        };
        let pool: Vec<UnifiedProcurement> = bids
            .into_iter()
            .filter(|b| {
                let keep = criteria.ufs.is_empty() || criteria.ufs.contains(&b.uf);
                if !keep {
                    stats.rejected_uf += 1;
                }
                keep
            })
            .collect();
        let uf_rejected = stats.rejected_uf;

        // Layers 2–8, re-runnable under relaxation.
        let mut effective = criteria.clone();
        let (mut accepted, mut run_stats) = self.run_layers(&pool, &effective).await;

        if accepted.is_empty() && criteria.allow_relaxation {
            let relaxation_order = ["min_match", "exclusion_list", "modalidade", "value_range"];
            let mut applied = Vec::new();
            for relaxation in relaxation_order {
                match relaxation {
                    "min_match" => {
                        if effective.min_match <= 1 {
                            continue;
                        }
                        effective.min_match = 1;
                    }
                    "exclusion_list" => {
                        if effective.exclusions.is_empty() {
                            continue;
                        }
                        effective.exclusions.clear();
                    }
                    "modalidade" => {
                        if effective.modalidades.is_none() {
                            continue;
                        }
                        effective.modalidades = None;
                    }
                    "value_range" => {
                        if effective.valor_min.is_none() && effective.valor_max.is_none() {
                            continue;
                        }
                        effective.valor_min = None;
                        effective.valor_max = None;
                    }
                    _ => unreachable!(),
                }
                applied.push(relaxation.to_string());
                tracing::info!(relaxation = relaxation, "zero results, relaxing filter");

                let (bids, s) = self.run_layers(&pool, &effective).await;
                accepted = bids;
                run_stats = s;
                if !accepted.is_empty() {
                    break;
                }
            }
            run_stats.relaxations_applied = applied;
        }

        // Layer 10: ordering.
        order_bids(&mut accepted, effective.ordenacao);

        let mut stats_out = run_stats;
        stats_out.input_count = input_count;
        stats_out.rejected_uf = uf_rejected;
        stats_out.output_count = accepted.len();

        FilterOutcome {
            bids: accepted.into_iter().map(|s| s.bid).collect(),
            stats: stats_out,
        }
    }

    /// Layers 2–8 over the UF-filtered pool.
    async fn run_layers(
        &self,
        pool: &[UnifiedProcurement],
        criteria: &FilterCriteria,
    ) -> (Vec<Scored>, FilterStats) {
        let mut stats = FilterStats::default();
        let now = Utc::now();

        let mut survivors: Vec<&UnifiedProcurement> = Vec::with_capacity(pool.len());
        for bid in pool {
            // Layer 2: modality.
            if let Some(allowed) = &criteria.modalidades {
                if !modalidade_matches(&bid.modalidade, allowed) {
                    stats.rejected_modalidade += 1;
                    continue;
                }
            }
            // Layer 3: value range.
            if let Some(min) = criteria.valor_min {
                if bid.valor_estimado < min {
                    stats.rejected_valor += 1;
                    continue;
                }
            }
            if let Some(max) = criteria.valor_max {
                if bid.valor_estimado > max {
                    stats.rejected_valor += 1;
                    continue;
                }
            }
            // Layer 4: membership filters.
            if let Some(status) = &criteria.status {
                if !status.is_empty() && !status.contains(&normalize_text(&bid.situacao)) {
                    stats.rejected_status += 1;
                    continue;
                }
            }
            if let Some(esferas) = &criteria.esferas {
                if !esferas.is_empty() && !esferas.contains(&normalize_text(&bid.esfera)) {
                    stats.rejected_esfera += 1;
                    continue;
                }
            }
            if let Some(municipios) = &criteria.municipios {
                if !municipios.is_empty() && !municipios.contains(&normalize_text(&bid.municipio))
                {
                    stats.rejected_municipio += 1;
                    continue;
                }
            }
            // Layer 5: deadline-open. Missing dates are kept.
            if criteria.open_only {
                if let Some(encerramento) = bid.data_encerramento {
                    if encerramento <= now {
                        stats.rejected_prazo_encerrado += 1;
                        continue;
                    }
                }
            }
            survivors.push(bid);
        }

        // Layer 6: keywords + uncertain-zone arbitration.
        let total_terms = criteria.keywords.len().max(1);
        let mut accepted: Vec<Scored> = Vec::new();
        let mut keyword_rejected: Vec<&UnifiedProcurement> = Vec::new();
        for bid in survivors {
            let m = match_keywords(&bid.objeto, &criteria.keywords, &criteria.exclusions);

            if !m.exclusions_hit.is_empty() {
                // Exclusion hits are only recoverable through the
                // arbiter's recovery mode, never silently.
                stats.rejected_exclusao += 1;
                let request = self.arbiter_request(
                    bid,
                    criteria,
                    PromptLevel::Standard,
                    Some(format!("exclusion: {}", m.exclusions_hit.join(", "))),
                    None,
                );
                if self.arbiter.recovery(&request).await {
                    stats.rejected_exclusao -= 1;
                    stats.llm_approved += 1;
                    accepted.push(Scored {
                        bid: bid.clone(),
                        score: m.matched.len() as f64 / total_terms as f64,
                    });
                } else {
                    stats.llm_rejected += 1;
                }
                continue;
            }

            if m.matched.is_empty() {
                stats.rejected_sem_keyword += 1;
                keyword_rejected.push(bid);
                continue;
            }

            if m.matched.len() < criteria.min_match {
                if criteria.show_below_min_match {
                    accepted.push(Scored {
                        bid: bid.clone(),
                        score: m.matched.len() as f64 / total_terms as f64,
                    });
                } else {
                    stats.hidden_by_min_match += 1;
                }
                continue;
            }

            let decision = match m.uncertain_zone() {
                Some(level) => {
                    let request = self.arbiter_request(bid, criteria, level, None, None);
                    let approved = self.arbiter.primary_match(&request).await;
                    if approved {
                        stats.llm_approved += 1;
                    } else {
                        stats.llm_rejected += 1;
                    }
                    approved
                }
                None => true,
            };

            if decision {
                accepted.push(Scored {
                    bid: bid.clone(),
                    score: m.matched.len() as f64 / total_terms as f64,
                });
            }
        }

        // Layer 7: synonym recovery when the lexical layer came up short.
        if accepted.len() < SYNONYM_LAYER_THRESHOLD {
            if let Some(sector) = criteria.sector_id.as_deref().and_then(get_sector) {
                for bid in keyword_rejected {
                    let matches: Vec<SynonymMatch> =
                        find_synonym_matches(&bid.objeto, sector, SIMILARITY_THRESHOLD);
                    if matches.is_empty() {
                        continue;
                    }
                    let distinct = count_distinct_canonicals(&matches);
                    if distinct >= AUTO_APPROVE_SYNONYMS {
                        stats.synonym_recovered += 1;
                        stats.rejected_sem_keyword -= 1;
                        accepted.push(Scored {
                            bid: bid.clone(),
                            score: distinct as f64 / total_terms as f64,
                        });
                    } else {
                        let near_miss = matches
                            .iter()
                            .map(|m| format!("{} ≈ {}", m.matched_text, m.canonical))
                            .collect::<Vec<_>>()
                            .join("; ");
                        let request = self.arbiter_request(
                            bid,
                            criteria,
                            PromptLevel::Standard,
                            Some("synonym_near_miss".to_string()),
                            Some(near_miss),
                        );
                        if self.arbiter.recovery(&request).await {
                            stats.synonym_recovered += 1;
                            stats.llm_approved += 1;
                            stats.rejected_sem_keyword -= 1;
                            accepted.push(Scored {
                                bid: bid.clone(),
                                score: 1.0 / total_terms as f64,
                            });
                        } else {
                            stats.llm_rejected += 1;
                        }
                    }
                }
            }
        }

        // Layer 8: sanctions. Unavailable fails open.
        if criteria.check_sanctions {
            if let Some(oracle) = self.sanctions {
                let mut checked: HashMap<String, SanctionsStatus> = HashMap::new();
                let mut kept: Vec<Scored> = Vec::with_capacity(accepted.len());
                for scored in accepted {
                    let cnpj = scored.bid.cnpj_orgao.clone();
                    if cnpj.trim().is_empty() {
                        kept.push(scored);
                        continue;
                    }
                    let status = match checked.get(&cnpj) {
                        Some(s) => s.clone(),
                        None => {
                            let s = oracle.status_for(&cnpj).await;
                            checked.insert(cnpj.clone(), s.clone());
                            s
                        }
                    };
                    if status == SanctionsStatus::Sanctioned {
                        stats.sanctions_dropped += 1;
                        tracing::info!(
                            source_id = %scored.bid.source_id,
                            "bid disqualified: contracting agency has active sanctions"
                        );
                    } else {
                        kept.push(scored);
                    }
                }
                accepted = kept;
            }
        }

        (accepted, stats)
    }

    fn arbiter_request(
        &self,
        bid: &UnifiedProcurement,
        criteria: &FilterCriteria,
        prompt_level: PromptLevel,
        rejection_reason: Option<String>,
        near_miss_info: Option<String>,
    ) -> ArbiterRequest {
        ArbiterRequest {
            objeto: bid.objeto.clone(),
            valor: bid.valor_estimado,
            sector_name: criteria.sector_name.clone(),
            custom_terms: criteria.custom_terms.clone(),
            prompt_level,
            rejection_reason,
            near_miss_info,
        }
    }
}

// ── Ordering ─────────────────────────────────────────────────

fn order_bids(bids: &mut [Scored], ordenacao: Ordenacao) {
    use std::cmp::Ordering as O;
    match ordenacao {
        Ordenacao::Relevancia => {
            bids.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(O::Equal)
                    .then_with(|| cmp_date_desc(a.bid.data_publicacao, b.bid.data_publicacao))
            });
        }
        Ordenacao::DataDesc => {
            bids.sort_by(|a, b| cmp_date_desc(a.bid.data_publicacao, b.bid.data_publicacao));
        }
        Ordenacao::DataAsc => {
            bids.sort_by(|a, b| cmp_date_asc(a.bid.data_publicacao, b.bid.data_publicacao));
        }
        Ordenacao::ValorDesc => {
            bids.sort_by(|a, b| {
                b.bid
                    .valor_estimado
                    .partial_cmp(&a.bid.valor_estimado)
                    .unwrap_or(O::Equal)
            });
        }
        Ordenacao::ValorAsc => {
            bids.sort_by(|a, b| {
                a.bid
                    .valor_estimado
                    .partial_cmp(&b.bid.valor_estimado)
                    .unwrap_or(O::Equal)
            });
        }
        Ordenacao::PrazoProximo => {
            bids.sort_by(|a, b| cmp_date_asc(a.bid.data_encerramento, b.bid.data_encerramento));
        }
    }
}

/// Descending; records without a date sort last.
fn cmp_date_desc(
    a: Option<chrono::DateTime<Utc>>,
    b: Option<chrono::DateTime<Utc>>,
) -> std::cmp::Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
}

/// Ascending; records without a date sort last.
fn cmp_date_asc(
    a: Option<chrono::DateTime<Utc>>,
    b: Option<chrono::DateTime<Utc>>,
) -> std::cmp::Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::procurement::ProcurementFields;
    use chrono::Duration;
    use std::sync::Mutex;

    /// Scripted arbiter: records every call, answers from a queue.
    #[derive(Default)]
    struct StubArbiter {
        primary_answer: bool,
        recovery_answer: bool,
        calls: Mutex<Vec<(String, String)>>, // (mode, prompt_level)
    }

    #[async_trait]
    impl RelevanceArbiter for StubArbiter {
        async fn primary_match(&self, request: &ArbiterRequest) -> bool {
            self.calls.lock().unwrap().push((
                "primary".into(),
                request.prompt_level.as_str().into(),
            ));
            self.primary_answer
        }

        async fn recovery(&self, request: &ArbiterRequest) -> bool {
            self.calls
                .lock()
                .unwrap()
                .push(("recovery".into(), request.prompt_level.as_str().into()));
            self.recovery_answer
        }
    }

    struct StubSanctions {
        sanctioned: HashSet<String>,
        unavailable: bool,
    }

    #[async_trait]
    impl SanctionsOracle for StubSanctions {
        async fn status_for(&self, cnpj: &str) -> SanctionsStatus {
            if self.unavailable {
                SanctionsStatus::Unavailable
            } else if self.sanctioned.contains(cnpj) {
                SanctionsStatus::Sanctioned
            } else {
                SanctionsStatus::Clean
            }
        }
    }

    fn bid(objeto: &str, valor: f64, uf: &str) -> UnifiedProcurement {
        UnifiedProcurement::new(ProcurementFields {
            source_id: objeto.chars().take(12).collect(),
            source_name: "PNCP".into(),
            objeto: objeto.into(),
            valor_estimado: valor,
            uf: uf.into(),
            cnpj_orgao: "00000000000100".into(),
            numero_edital: "1".into(),
            ano: "2026".into(),
            ..Default::default()
        })
    }

    fn vestuario_criteria() -> FilterCriteria {
        let sector = get_sector("vestuario").unwrap();
        FilterCriteria {
            ufs: HashSet::from(["SP".to_string()]),
            modalidades: None,
            valor_min: None,
            valor_max: None,
            status: None,
            esferas: None,
            municipios: None,
            open_only: false,
            keywords: sector.keywords.iter().map(|s| s.to_string()).collect(),
            exclusions: sector.exclusions.iter().map(|s| s.to_string()).collect(),
            sector_id: Some("vestuario".into()),
            sector_name: Some(sector.name.to_string()),
            custom_terms: None,
            min_match: 1,
            show_below_min_match: false,
            check_sanctions: false,
            allow_relaxation: false,
            ordenacao: Ordenacao::Relevancia,
        }
    }

    /// Uncertain-zone rejection: ~2% density calls the conservative
    /// prompt; the arbiter says no; the bid is dropped.
    #[tokio::test]
    async fn test_uncertain_zone_conservative_rejection() {
        let filler = "melhorias urbanas drenagem pavimentacao ".repeat(12);
        let objeto = format!("{} incluindo uniformes para agentes de transito", filler);
        let arbiter = StubArbiter {
            primary_answer: false,
            ..Default::default()
        };
        let engine = FilterEngine::new(&arbiter, None);

        let outcome = engine
            .apply(vec![bid(&objeto, 47_600_000.0, "SP")], &vestuario_criteria())
            .await;

        assert!(outcome.bids.is_empty());
        assert_eq!(outcome.stats.llm_rejected, 1);
        let calls = arbiter.calls.lock().unwrap();
        assert_eq!(calls[0], ("primary".to_string(), "conservative".to_string()));
    }

    /// Legitimate match: high density never consults the arbiter.
    #[tokio::test]
    async fn test_high_density_accepts_without_llm() {
        let arbiter = StubArbiter {
            primary_answer: false, // would reject if consulted
            ..Default::default()
        };
        let engine = FilterEngine::new(&arbiter, None);

        let outcome = engine
            .apply(
                vec![bid(
                    "Uniformes escolares diversos para rede municipal de ensino",
                    3_000_000.0,
                    "SP",
                )],
                &vestuario_criteria(),
            )
            .await;

        assert_eq!(outcome.bids.len(), 1);
        assert!(arbiter.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_uf_filter_rejects() {
        let arbiter = StubArbiter::default();
        let engine = FilterEngine::new(&arbiter, None);
        let outcome = engine
            .apply(
                vec![bid("Uniformes escolares", 1000.0, "RJ")],
                &vestuario_criteria(),
            )
            .await;
        assert!(outcome.bids.is_empty());
        assert_eq!(outcome.stats.rejected_uf, 1);
    }

    #[tokio::test]
    async fn test_exclusion_never_accepted_without_recovery() {
        let arbiter = StubArbiter {
            recovery_answer: false,
            ..Default::default()
        };
        let engine = FilterEngine::new(&arbiter, None);
        let outcome = engine
            .apply(
                vec![bid(
                    "Aquisição de uniforme e avental hospitalar para unidade de saúde",
                    50_000.0,
                    "SP",
                )],
                &vestuario_criteria(),
            )
            .await;

        assert!(outcome.bids.is_empty());
        assert_eq!(outcome.stats.rejected_exclusao, 1);
        assert_eq!(outcome.stats.llm_rejected, 1);
        let calls = arbiter.calls.lock().unwrap();
        assert_eq!(calls[0].0, "recovery");
    }

    #[tokio::test]
    async fn test_exclusion_recovered_by_llm() {
        let arbiter = StubArbiter {
            recovery_answer: true,
            ..Default::default()
        };
        let engine = FilterEngine::new(&arbiter, None);
        let outcome = engine
            .apply(
                vec![bid(
                    "Aquisição de uniforme e avental hospitalar para unidade de saúde",
                    50_000.0,
                    "SP",
                )],
                &vestuario_criteria(),
            )
            .await;

        assert_eq!(outcome.bids.len(), 1);
        assert_eq!(outcome.stats.llm_approved, 1);
        assert_eq!(outcome.stats.rejected_exclusao, 0);
    }

    #[tokio::test]
    async fn test_synonym_auto_recovery_with_two_canonicals() {
        // "fardamento" → uniforme/farda, no direct canonical match.
        let arbiter = StubArbiter::default();
        let engine = FilterEngine::new(&arbiter, None);
        let outcome = engine
            .apply(
                vec![bid("Fornecimento de fardamento para guardas", 80_000.0, "SP")],
                &vestuario_criteria(),
            )
            .await;

        assert_eq!(outcome.bids.len(), 1, "{:?}", outcome.stats);
        assert_eq!(outcome.stats.synonym_recovered, 1);
        // Auto-recovery at ≥2 canonicals must not consult the arbiter.
        assert!(arbiter.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sanctioned_cnpj_dropped() {
        let arbiter = StubArbiter::default();
        let sanctions = StubSanctions {
            sanctioned: HashSet::from(["00000000000100".to_string()]),
            unavailable: false,
        };
        let engine = FilterEngine::new(&arbiter, Some(&sanctions));

        let mut criteria = vestuario_criteria();
        criteria.check_sanctions = true;

        let outcome = engine
            .apply(
                vec![bid("Uniformes escolares para rede municipal", 10_000.0, "SP")],
                &criteria,
            )
            .await;

        assert!(outcome.bids.is_empty());
        assert_eq!(outcome.stats.sanctions_dropped, 1);
    }

    #[tokio::test]
    async fn test_sanctions_unavailable_fails_open() {
        let arbiter = StubArbiter::default();
        let sanctions = StubSanctions {
            sanctioned: HashSet::new(),
            unavailable: true,
        };
        let engine = FilterEngine::new(&arbiter, Some(&sanctions));

        let mut criteria = vestuario_criteria();
        criteria.check_sanctions = true;

        let outcome = engine
            .apply(
                vec![bid("Uniformes escolares para rede municipal", 10_000.0, "SP")],
                &criteria,
            )
            .await;

        assert_eq!(outcome.bids.len(), 1);
        assert_eq!(outcome.stats.sanctions_dropped, 0);
    }

    #[tokio::test]
    async fn test_value_range_filter() {
        let arbiter = StubArbiter::default();
        let engine = FilterEngine::new(&arbiter, None);
        let mut criteria = vestuario_criteria();
        criteria.valor_min = Some(5_000.0);
        criteria.valor_max = Some(100_000.0);
        criteria.allow_relaxation = false;

        let outcome = engine
            .apply(
                vec![
                    bid("Uniformes escolares lote A", 1_000.0, "SP"),
                    bid("Uniformes escolares lote B", 50_000.0, "SP"),
                    bid("Uniformes escolares lote C", 500_000.0, "SP"),
                ],
                &criteria,
            )
            .await;

        assert_eq!(outcome.bids.len(), 1);
        assert_eq!(outcome.stats.rejected_valor, 2);
    }

    #[tokio::test]
    async fn test_relaxation_recovers_zero_results() {
        let arbiter = StubArbiter::default();
        let engine = FilterEngine::new(&arbiter, None);
        let mut criteria = vestuario_criteria();
        // Value range excludes everything; relaxation should clear it.
        criteria.valor_min = Some(1_000_000.0);
        criteria.allow_relaxation = true;

        let outcome = engine
            .apply(
                vec![bid("Uniformes escolares para rede municipal", 10_000.0, "SP")],
                &criteria,
            )
            .await;

        assert_eq!(outcome.bids.len(), 1);
        assert!(outcome
            .stats
            .relaxations_applied
            .contains(&"value_range".to_string()));
    }

    #[tokio::test]
    async fn test_deadline_open_filter_keeps_missing_dates() {
        let arbiter = StubArbiter::default();
        let engine = FilterEngine::new(&arbiter, None);
        let mut criteria = vestuario_criteria();
        criteria.open_only = true;
        criteria.allow_relaxation = false;

        let mut closed = bid("Uniformes escolares lote fechado", 1_000.0, "SP");
        closed.data_encerramento = Some(Utc::now() - Duration::days(1));
        let mut open = bid("Uniformes escolares lote aberto", 1_000.0, "SP");
        open.data_encerramento = Some(Utc::now() + Duration::days(5));
        let unknown = bid("Uniformes escolares lote sem data", 1_000.0, "SP");

        let outcome = engine.apply(vec![closed, open, unknown], &criteria).await;
        assert_eq!(outcome.bids.len(), 2);
        assert_eq!(outcome.stats.rejected_prazo_encerrado, 1);
    }

    #[tokio::test]
    async fn test_modalidade_filter_by_name() {
        let arbiter = StubArbiter::default();
        let engine = FilterEngine::new(&arbiter, None);
        let mut criteria = vestuario_criteria();
        criteria.modalidades = Some(HashSet::from([6u8]));
        criteria.allow_relaxation = false;

        let mut pregao = bid("Uniformes escolares via pregão", 1_000.0, "SP");
        pregao.modalidade = "Pregão Eletrônico".into();
        let mut concorrencia = bid("Uniformes escolares via concorrência", 1_000.0, "SP");
        concorrencia.modalidade = "Concorrência Eletrônica".into();

        let outcome = engine.apply(vec![pregao, concorrencia], &criteria).await;
        assert_eq!(outcome.bids.len(), 1);
        assert_eq!(outcome.stats.rejected_modalidade, 1);
    }

    #[tokio::test]
    async fn test_ordering_by_value_desc() {
        let arbiter = StubArbiter::default();
        let engine = FilterEngine::new(&arbiter, None);
        let mut criteria = vestuario_criteria();
        criteria.ordenacao = Ordenacao::ValorDesc;

        let outcome = engine
            .apply(
                vec![
                    bid("Uniformes escolares lote A", 10.0, "SP"),
                    bid("Uniformes escolares lote B", 1000.0, "SP"),
                    bid("Uniformes escolares lote C", 100.0, "SP"),
                ],
                &criteria,
            )
            .await;

        let valores: Vec<f64> = outcome.bids.iter().map(|b| b.valor_estimado).collect();
        assert_eq!(valores, vec![1000.0, 100.0, 10.0]);
    }

    #[tokio::test]
    async fn test_ordering_unparsable_dates_sort_last() {
        let arbiter = StubArbiter::default();
        let engine = FilterEngine::new(&arbiter, None);
        let mut criteria = vestuario_criteria();
        criteria.ordenacao = Ordenacao::DataDesc;

        let mut dated = bid("Uniformes escolares com data", 10.0, "SP");
        dated.data_publicacao = Some(Utc::now());
        let undated = bid("Uniformes escolares sem data", 10.0, "SP");

        let outcome = engine.apply(vec![undated, dated], &criteria).await;
        assert!(outcome.bids[0].data_publicacao.is_some());
        assert!(outcome.bids[1].data_publicacao.is_none());
    }

    #[test]
    fn test_modalidade_name_table() {
        assert_eq!(modalidade_nome(6), "Pregão Eletrônico");
        assert_eq!(modalidade_nome(9), "");
        assert_eq!(modalidade_nome(14), "");
    }

    #[test]
    fn test_criteria_from_request_custom_terms_win() {
        let request = SearchRequest {
            ufs: vec!["SP".into()],
            data_inicial: "2026-01-01".into(),
            data_final: "2026-01-31".into(),
            setor_id: Some("vestuario".into()),
            termos_busca: Some(vec!["drone".into()]),
            ..Default::default()
        };
        let criteria = FilterCriteria::from_request(&request).unwrap();
        assert_eq!(criteria.keywords, vec!["drone".to_string()]);
        assert!(criteria.sector_id.is_none());
    }

    #[test]
    fn test_criteria_from_request_unknown_sector() {
        let request = SearchRequest {
            ufs: vec!["SP".into()],
            data_inicial: "2026-01-01".into(),
            data_final: "2026-01-31".into(),
            setor_id: Some("nope".into()),
            ..Default::default()
        };
        assert!(FilterCriteria::from_request(&request).is_err());
    }
}
