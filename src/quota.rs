//! Monthly quota enforcement and plan resolution.
//!
//! The atomic check-and-increment lives in the store (a single upsert
//! statement serialized by the unique `(user_id, month_key)` row); the
//! read-then-upsert fallback is only used when that statement fails and
//! its race window is an accepted degradation. Persistence failures
//! never lock users out: quota checks fail open on the FREE plan.

use chrono::{Datelike, NaiveDate, Utc};
use serde::Serialize;

use crate::errors::AppError;
use crate::models::plan::{capabilities, PlanCapabilities, PlanId};
use crate::store::PgStore;

#[derive(Debug, Clone, Serialize)]
pub struct QuotaInfo {
    pub allowed: bool,
    pub plan_id: PlanId,
    pub plan_name: &'static str,
    pub capabilities: PlanCapabilities,
    pub quota_used: u32,
    pub quota_remaining: Option<u32>,
    pub quota_reset_date: NaiveDate,
    pub trial_expires_at: Option<chrono::DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// `YYYY-MM` in UTC.
pub fn month_key(now: chrono::DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

/// Quota resets on the 1st of the next month, 00:00Z.
pub fn quota_reset_date(now: chrono::DateTime<Utc>) -> NaiveDate {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or_else(|| now.date_naive())
}

/// Fast-path admin check against the `ADMIN_USER_IDS` env set
/// (case-insensitive UUID comparison).
pub fn is_admin_by_env(user_id: &str, admin_ids: &[String]) -> bool {
    let needle = user_id.to_lowercase();
    admin_ids.iter().any(|id| *id == needle)
}

pub fn build_quota_info(plan_id: PlanId, used: u32, allowed: bool) -> QuotaInfo {
    let caps = capabilities(plan_id);
    let now = Utc::now();
    QuotaInfo {
        allowed,
        plan_id,
        plan_name: caps.display_name,
        capabilities: caps,
        quota_used: used,
        quota_remaining: caps
            .max_requests_per_month
            .map(|max| max.saturating_sub(used)),
        quota_reset_date: quota_reset_date(now),
        trial_expires_at: None,
        error_message: None,
    }
}

pub struct QuotaService {
    /// Absent store (tests, degraded deployments) fails open.
    store: Option<PgStore>,
    admin_ids: Vec<String>,
}

impl QuotaService {
    pub fn new(store: Option<PgStore>, admin_ids: Vec<String>) -> Self {
        Self { store, admin_ids }
    }

    /// Admin/master bypass: env set first, then a profile lookup with
    /// one automatic retry after 300ms on transient store errors.
    pub async fn is_admin(&self, user_id: &str) -> bool {
        if is_admin_by_env(user_id, &self.admin_ids) {
            return true;
        }
        let Some(store) = &self.store else {
            return false;
        };

        let profile = match store.get_profile(user_id).await {
            Ok(p) => p,
            Err(first) => {
                tracing::debug!("profile lookup failed, retrying once: {}", first);
                tokio::time::sleep(std::time::Duration::from_millis(300)).await;
                match store.get_profile(user_id).await {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!("profile lookup failed after retry: {}", e);
                        return false;
                    }
                }
            }
        };

        profile
            .map(|p| {
                p.is_admin
                    || p.plan_type
                        .as_deref()
                        .map(|t| t.eq_ignore_ascii_case("master"))
                        .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    async fn resolve_plan(&self, user_id: &str) -> Result<(PlanId, Option<chrono::DateTime<Utc>>), AppError> {
        let Some(store) = &self.store else {
            return Ok((PlanId::Free, None));
        };
        match store.get_subscription(user_id).await {
            Ok(Some(sub)) => {
                let plan = PlanId::from_str_or_free(&sub.plan_id);
                if plan == PlanId::Free {
                    if let Some(expires) = sub.trial_expires_at {
                        if expires < Utc::now() {
                            return Err(AppError::TrialExpired);
                        }
                    }
                }
                Ok((plan, sub.trial_expires_at))
            }
            // Missing subscription defaults to FREE.
            Ok(None) => Ok((PlanId::Free, None)),
            Err(e) => {
                tracing::warn!("subscription lookup failed, defaulting to FREE: {}", e);
                Ok((PlanId::Free, None))
            }
        }
    }

    /// Read-only quota snapshot (no increment). Fails open with the
    /// FREE plan on persistence errors.
    pub async fn check_quota(&self, user_id: &str) -> Result<QuotaInfo, AppError> {
        if self.is_admin(user_id).await {
            return Ok(build_quota_info(PlanId::Master, 0, true));
        }

        let (plan, trial_expires_at) = self.resolve_plan(user_id).await?;
        let caps = capabilities(plan);
        let key = month_key(Utc::now());

        let Some(store) = &self.store else {
            let mut info = build_quota_info(plan, 0, true);
            info.trial_expires_at = trial_expires_at;
            return Ok(info);
        };
        let used = match store.get_quota_count(user_id, &key).await {
            Ok(count) => count as u32,
            Err(e) => {
                tracing::error!("quota read failed, failing open: {}", e);
                let mut info = build_quota_info(PlanId::Free, 0, true);
                info.error_message = Some("quota temporariamente indisponível".into());
                return Ok(info);
            }
        };

        let allowed = caps
            .max_requests_per_month
            .map(|max| used < max)
            .unwrap_or(true);
        let mut info = build_quota_info(plan, used, allowed);
        info.trial_expires_at = trial_expires_at;
        Ok(info)
    }

    /// Atomic check-and-increment. Exactly `min(max - used, burst)`
    /// concurrent calls can succeed for one user.
    pub async fn consume_quota(&self, user_id: &str) -> Result<QuotaInfo, AppError> {
        if self.is_admin(user_id).await {
            return Ok(build_quota_info(PlanId::Master, 0, true));
        }

        let (plan, trial_expires_at) = self.resolve_plan(user_id).await?;
        let caps = capabilities(plan);
        let Some(max) = caps.max_requests_per_month else {
            return Ok(build_quota_info(plan, 0, true));
        };

        let Some(store) = &self.store else {
            let mut info = build_quota_info(plan, 0, true);
            info.error_message = Some("quota temporariamente indisponível".into());
            return Ok(info);
        };

        let key = month_key(Utc::now());
        let outcome = match store
            .increment_quota_atomic(user_id, &key, max as i64)
            .await
        {
            Ok(outcome) => outcome,
            Err(first) => {
                tracing::warn!(
                    "atomic quota increment failed, using fallback upsert: {}",
                    first
                );
                match store
                    .increment_quota_fallback(user_id, &key, max as i64)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!("quota persistence down, failing open: {}", e);
                        let mut info = build_quota_info(PlanId::Free, 0, true);
                        info.error_message = Some("quota temporariamente indisponível".into());
                        return Ok(info);
                    }
                }
            }
        };

        match outcome {
            Some(new_count) => {
                let mut info = build_quota_info(plan, new_count as u32, true);
                info.trial_expires_at = trial_expires_at;
                Ok(info)
            }
            None => Err(AppError::QuotaExceeded {
                used: max,
                limit: max,
            }),
        }
    }
}
