//! Search request schema, validation, and the search lifecycle state set.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::errors::AppError;

/// Modality codes per federal law. 9 (Inexigibilidade) and 14
/// (Inaplicabilidade) are structurally rejected at validation time and
/// never reach the filter engine.
pub const REJECTED_MODALIDADES: &[u8] = &[9, 14];
pub const VALID_MODALIDADES: &[u8] = &[1, 2, 3, 4, 5, 6, 7, 8, 10, 11, 12, 13];

/// The 27 Brazilian UF codes, Federal District included.
pub const VALID_UFS: &[&str] = &[
    "AC", "AL", "AP", "AM", "BA", "CE", "DF", "ES", "GO", "MA", "MT", "MS", "MG", "PA", "PB",
    "PR", "PE", "PI", "RJ", "RN", "RS", "RO", "RR", "SC", "SP", "SE", "TO",
];

/// Result ordering options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ordenacao {
    #[default]
    Relevancia,
    DataDesc,
    DataAsc,
    ValorDesc,
    ValorAsc,
    PrazoProximo,
}

/// Search mode: all bids or only those whose deadline is still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModoBusca {
    #[default]
    Todas,
    AbertasApenas,
}

/// Request body for `POST /v1/buscar`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    pub search_id: Option<String>,
    pub ufs: Vec<String>,
    pub data_inicial: String,
    pub data_final: String,
    pub setor_id: Option<String>,
    pub termos_busca: Option<Vec<String>>,
    pub termos_exclusao: Option<Vec<String>>,
    pub status: Option<Vec<String>>,
    pub modalidades: Option<Vec<u8>>,
    pub valor_minimo: Option<f64>,
    pub valor_maximo: Option<f64>,
    pub esferas: Option<Vec<String>>,
    pub municipios: Option<Vec<String>>,
    #[serde(default)]
    pub ordenacao: Ordenacao,
    #[serde(default)]
    pub modo_busca: ModoBusca,
    #[serde(default = "default_true")]
    pub check_sanctions: bool,
    #[serde(default)]
    pub force_fresh: bool,
}

fn default_true() -> bool {
    true
}

impl SearchRequest {
    /// Validate the request, returning the parsed date range.
    ///
    /// All messages are user-facing Portuguese; they surface in the 422
    /// response `detail` field.
    pub fn validate(&self) -> Result<(NaiveDate, NaiveDate), AppError> {
        if self.ufs.is_empty() {
            return Err(AppError::Validation("Selecione ao menos uma UF".into()));
        }
        for uf in &self.ufs {
            let upper = uf.to_uppercase();
            if !VALID_UFS.contains(&upper.as_str()) {
                return Err(AppError::Validation(format!("UF inválida: {}", uf)));
            }
        }

        let inicio = NaiveDate::parse_from_str(&self.data_inicial, "%Y-%m-%d")
            .map_err(|_| AppError::Validation("Data inicial inválida (use YYYY-MM-DD)".into()))?;
        let fim = NaiveDate::parse_from_str(&self.data_final, "%Y-%m-%d")
            .map_err(|_| AppError::Validation("Data final inválida (use YYYY-MM-DD)".into()))?;
        if fim < inicio {
            return Err(AppError::Validation(
                "Data final anterior à data inicial".into(),
            ));
        }

        if self.setor_id.is_none()
            && self
                .termos_busca
                .as_ref()
                .map(|t| t.iter().all(|s| s.trim().is_empty()))
                .unwrap_or(true)
        {
            return Err(AppError::Validation(
                "Informe um setor ou termos de busca".into(),
            ));
        }

        if let Some(modalidades) = &self.modalidades {
            for m in modalidades {
                if REJECTED_MODALIDADES.contains(m) {
                    return Err(AppError::Validation(format!(
                        "Modalidade {} não é suportada",
                        m
                    )));
                }
                if !VALID_MODALIDADES.contains(m) {
                    return Err(AppError::Validation(format!("Modalidade inválida: {}", m)));
                }
            }
        }

        if let (Some(min), Some(max)) = (self.valor_minimo, self.valor_maximo) {
            if min > max {
                return Err(AppError::Validation(
                    "Valor mínimo maior que o valor máximo".into(),
                ));
            }
        }

        Ok((inicio, fim))
    }

    pub fn uf_set(&self) -> HashSet<String> {
        self.ufs.iter().map(|u| u.to_uppercase()).collect()
    }
}

// ── Search lifecycle ──────────────────────────────────────────

/// Closed set of search lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchState {
    Created,
    Validating,
    Fetching,
    Filtering,
    Enriching,
    Generating,
    Persisting,
    Completed,
    Failed,
    RateLimited,
    TimedOut,
}

pub const TERMINAL_STATES: &[SearchState] = &[
    SearchState::Completed,
    SearchState::Failed,
    SearchState::RateLimited,
    SearchState::TimedOut,
];

impl SearchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchState::Created => "created",
            SearchState::Validating => "validating",
            SearchState::Fetching => "fetching",
            SearchState::Filtering => "filtering",
            SearchState::Enriching => "enriching",
            SearchState::Generating => "generating",
            SearchState::Persisting => "persisting",
            SearchState::Completed => "completed",
            SearchState::Failed => "failed",
            SearchState::RateLimited => "rate_limited",
            SearchState::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        TERMINAL_STATES.contains(self)
    }

    /// Coarse progress percentage derived from the state name.
    /// Failures map to -1.
    pub fn progress_pct(&self) -> i8 {
        match self {
            SearchState::Created => 0,
            SearchState::Validating => 5,
            SearchState::Fetching => 30,
            SearchState::Filtering => 60,
            SearchState::Enriching => 70,
            SearchState::Generating => 85,
            SearchState::Persisting => 95,
            SearchState::Completed => 100,
            SearchState::Failed | SearchState::RateLimited | SearchState::TimedOut => -1,
        }
    }
}

/// The allowed transitions graph:
/// created → validating → fetching → filtering → enriching → generating
/// → persisting → completed, and any non-terminal state may jump to
/// failed / rate_limited / timed_out.
pub fn validate_transition(from: Option<SearchState>, to: SearchState) -> bool {
    use SearchState::*;
    match from {
        None => to == Created,
        Some(from) => {
            if from.is_terminal() {
                return false;
            }
            if matches!(to, Failed | RateLimited | TimedOut) {
                return true;
            }
            matches!(
                (from, to),
                (Created, Validating)
                    | (Validating, Fetching)
                    | (Fetching, Filtering)
                    | (Filtering, Enriching)
                    | (Enriching, Generating)
                    | (Generating, Persisting)
                    | (Persisting, Completed)
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> SearchRequest {
        SearchRequest {
            ufs: vec!["SP".into(), "rj".into()],
            data_inicial: "2026-01-01".into(),
            data_final: "2026-01-31".into(),
            setor_id: Some("vestuario".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(valid_request().validate().is_ok());
    }

    #[test]
    fn test_empty_ufs_rejected() {
        let mut req = valid_request();
        req.ufs.clear();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_inverted_dates_rejected() {
        let mut req = valid_request();
        req.data_inicial = "2026-02-01".into();
        req.data_final = "2026-01-01".into();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_modalidade_9_and_14_rejected() {
        for code in [9u8, 14] {
            let mut req = valid_request();
            req.modalidades = Some(vec![6, code]);
            let err = req.validate().unwrap_err();
            assert!(format!("{}", err).contains("Modalidade"));
        }
    }

    #[test]
    fn test_requires_sector_or_terms() {
        let mut req = valid_request();
        req.setor_id = None;
        req.termos_busca = Some(vec!["  ".into()]);
        assert!(req.validate().is_err());

        req.termos_busca = Some(vec!["uniforme".into()]);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_happy_path_transitions() {
        use SearchState::*;
        let chain = [
            Created, Validating, Fetching, Filtering, Enriching, Generating, Persisting, Completed,
        ];
        let mut prev: Option<SearchState> = None;
        for state in chain {
            assert!(validate_transition(prev, state), "{:?} -> {:?}", prev, state);
            prev = Some(state);
        }
    }

    #[test]
    fn test_non_terminal_can_fail() {
        assert!(validate_transition(Some(SearchState::Fetching), SearchState::Failed));
        assert!(validate_transition(Some(SearchState::Created), SearchState::RateLimited));
        assert!(validate_transition(Some(SearchState::Generating), SearchState::TimedOut));
    }

    #[test]
    fn test_terminal_states_are_final() {
        assert!(!validate_transition(Some(SearchState::Completed), SearchState::Fetching));
        assert!(!validate_transition(Some(SearchState::Failed), SearchState::Failed));
        assert!(!validate_transition(Some(SearchState::TimedOut), SearchState::Completed));
    }

    #[test]
    fn test_skipping_stages_rejected() {
        assert!(!validate_transition(Some(SearchState::Created), SearchState::Fetching));
        assert!(!validate_transition(Some(SearchState::Fetching), SearchState::Enriching));
    }

    #[test]
    fn test_progress_mapping() {
        assert_eq!(SearchState::Created.progress_pct(), 0);
        assert_eq!(SearchState::Fetching.progress_pct(), 30);
        assert_eq!(SearchState::Completed.progress_pct(), 100);
        assert_eq!(SearchState::Failed.progress_pct(), -1);
    }
}
