//! Plan capability matrix.
//!
//! Display names and prices are product decisions confirmed per release;
//! the capability numbers here gate quota and rate-limit enforcement.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanId {
    Free,
    Pro,
    Premium,
    Master,
}

impl PlanId {
    pub fn from_str_or_free(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pro" => PlanId::Pro,
            "premium" => PlanId::Premium,
            "master" => PlanId::Master,
            _ => PlanId::Free,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanId::Free => "free",
            PlanId::Pro => "pro",
            PlanId::Premium => "premium",
            PlanId::Master => "master",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PlanCapabilities {
    pub display_name: &'static str,
    pub max_history_days: u32,
    pub allow_excel: bool,
    /// `None` means unlimited.
    pub max_requests_per_month: Option<u32>,
    pub max_requests_per_min: u32,
    pub max_summary_tokens: u32,
    /// Lower runs first under contention.
    pub priority: u8,
}

/// Process-wide constant capability map.
pub fn capabilities(plan: PlanId) -> PlanCapabilities {
    match plan {
        PlanId::Free => PlanCapabilities {
            display_name: "Gratuito",
            max_history_days: 7,
            allow_excel: false,
            max_requests_per_month: Some(10),
            max_requests_per_min: 5,
            max_summary_tokens: 300,
            priority: 3,
        },
        PlanId::Pro => PlanCapabilities {
            display_name: "Profissional",
            max_history_days: 90,
            allow_excel: true,
            max_requests_per_month: Some(100),
            max_requests_per_min: 10,
            max_summary_tokens: 800,
            priority: 2,
        },
        PlanId::Premium => PlanCapabilities {
            display_name: "Premium",
            max_history_days: 365,
            allow_excel: true,
            max_requests_per_month: Some(500),
            max_requests_per_min: 20,
            max_summary_tokens: 1500,
            priority: 1,
        },
        PlanId::Master => PlanCapabilities {
            display_name: "Master",
            max_history_days: 3650,
            allow_excel: true,
            max_requests_per_month: None,
            max_requests_per_min: 60,
            max_summary_tokens: 4000,
            priority: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_plan_defaults_to_free() {
        assert_eq!(PlanId::from_str_or_free("enterprise"), PlanId::Free);
        assert_eq!(PlanId::from_str_or_free("PRO"), PlanId::Pro);
    }

    #[test]
    fn test_master_is_unlimited() {
        assert!(capabilities(PlanId::Master).max_requests_per_month.is_none());
    }

    #[test]
    fn test_free_has_no_excel() {
        assert!(!capabilities(PlanId::Free).allow_excel);
        assert!(capabilities(PlanId::Pro).allow_excel);
    }
}
