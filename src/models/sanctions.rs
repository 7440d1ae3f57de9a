//! Sanction records from the CEIS and CNEP federal databases.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which federal database a sanction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SanctionSource {
    #[serde(rename = "CEIS")]
    Ceis,
    #[serde(rename = "CNEP")]
    Cnep,
}

/// A single sanction entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanctionRecord {
    pub source: SanctionSource,
    pub cnpj: String,
    pub company_name: String,
    pub sanction_type: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub sanctioning_body: String,
    pub legal_basis: String,
    /// CNEP only; CEIS sanctions carry no fine.
    pub fine_amount: Option<Decimal>,
    pub is_active: bool,
}

impl SanctionRecord {
    /// A sanction is active while it has no end date or the end date is
    /// still in the future.
    pub fn compute_is_active(end_date: Option<NaiveDate>, today: NaiveDate) -> bool {
        match end_date {
            None => true,
            Some(end) => end > today,
        }
    }
}

/// Aggregated CEIS + CNEP result for one CNPJ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanctionsResult {
    pub cnpj: String,
    pub is_sanctioned: bool,
    pub sanctions: Vec<SanctionRecord>,
    pub checked_at: DateTime<Utc>,
    pub ceis_count: usize,
    pub cnep_count: usize,
    pub cache_hit: bool,
}

/// Tri-state summary surfaced to the search UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SanctionsStatus {
    Clean,
    Sanctioned,
    /// Both upstreams failed; treated as "not sanctioned" downstream.
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanctionsSummary {
    pub status: SanctionsStatus,
    pub active_count: usize,
    pub sanction_types: Vec<String>,
}
