use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// Postgres-backed store for sessions, transitions, quota and profiles.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

/// Non-terminal statuses eligible for startup recovery.
const NON_TERMINAL_STATUSES: &str =
    "('created','validating','fetching','filtering','enriching','generating','persisting')";

fn is_undefined_column(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("42703"))
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // -- Search sessions --

    #[allow(clippy::too_many_arguments)]
    pub async fn create_search_session(
        &self,
        search_id: &str,
        user_id: &str,
        sectors: Option<&str>,
        ufs: &[String],
        data_inicial: &str,
        data_final: &str,
        custom_keywords: Option<&serde_json::Value>,
    ) -> anyhow::Result<Uuid> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"INSERT INTO search_sessions
               (search_id, user_id, status, pipeline_stage, started_at, sectors, ufs, data_inicial, data_final, custom_keywords)
               VALUES ($1, $2, 'created', 'init', NOW(), $3, $4, $5, $6, $7)
               RETURNING id"#,
        )
        .bind(search_id)
        .bind(user_id)
        .bind(sectors)
        .bind(ufs)
        .bind(data_inicial)
        .bind(data_final)
        .bind(custom_keywords)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn update_session_state(
        &self,
        search_id: &str,
        status: &str,
        stage: Option<&str>,
        terminal: bool,
    ) -> anyhow::Result<()> {
        if terminal {
            sqlx::query(
                "UPDATE search_sessions SET status = $2, pipeline_stage = COALESCE($3, pipeline_stage), completed_at = NOW() WHERE search_id = $1",
            )
        } else {
            sqlx::query(
                "UPDATE search_sessions SET status = $2, pipeline_stage = COALESCE($3, pipeline_stage) WHERE search_id = $1",
            )
        }
        .bind(search_id)
        .bind(status)
        .bind(stage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_session_error(
        &self,
        search_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE search_sessions SET error_code = $2, error_message = $3 WHERE search_id = $1",
        )
        .bind(search_id)
        .bind(error_code)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_session_results(
        &self,
        search_id: &str,
        total_raw: i64,
        total_filtered: i64,
        valor_total: f64,
        resumo_executivo: Option<&str>,
        destaques: Option<&serde_json::Value>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"UPDATE search_sessions
               SET total_raw = $2, total_filtered = $3, valor_total = $4,
                   resumo_executivo = $5, destaques = $6
               WHERE search_id = $1"#,
        )
        .bind(search_id)
        .bind(total_raw)
        .bind(total_filtered)
        .bind(valor_total)
        .bind(resumo_executivo)
        .bind(destaques)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, search_id: &str) -> anyhow::Result<Option<SearchSessionRow>> {
        let row = sqlx::query_as::<_, SearchSessionRow>(
            r#"SELECT id, search_id, user_id, status, pipeline_stage, started_at, completed_at,
                      total_raw, total_filtered, valor_total, resumo_executivo,
                      error_code, error_message, created_at
               FROM search_sessions WHERE search_id = $1"#,
        )
        .bind(search_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // -- State transitions --

    pub async fn insert_transition(
        &self,
        search_id: &str,
        from_state: Option<&str>,
        to_state: &str,
        stage: Option<&str>,
        details: &serde_json::Value,
        duration_since_previous_ms: Option<i64>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO search_state_transitions
               (search_id, from_state, to_state, stage, details, duration_since_previous_ms)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(search_id)
        .bind(from_state)
        .bind(to_state)
        .bind(stage)
        .bind(details)
        .bind(duration_since_previous_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_timeline(&self, search_id: &str) -> anyhow::Result<Vec<TransitionRow>> {
        let rows = sqlx::query_as::<_, TransitionRow>(
            r#"SELECT id, search_id, from_state, to_state, stage, details,
                      duration_since_previous_ms, created_at
               FROM search_state_transitions
               WHERE search_id = $1 ORDER BY created_at ASC"#,
        )
        .bind(search_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn latest_transition(&self, search_id: &str) -> anyhow::Result<Option<TransitionRow>> {
        let row = sqlx::query_as::<_, TransitionRow>(
            r#"SELECT id, search_id, from_state, to_state, stage, details,
                      duration_since_previous_ms, created_at
               FROM search_state_transitions
               WHERE search_id = $1 ORDER BY created_at DESC LIMIT 1"#,
        )
        .bind(search_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // -- Startup recovery --

    /// Non-terminal sessions, tolerating legacy schemas: when the full
    /// query hits an undefined column (42703), fall back to the minimal
    /// `created_at`-only shape.
    pub async fn list_stale_sessions(
        &self,
        fallback_cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<StaleSessionRow>> {
        let full = sqlx::query_as::<_, StaleSessionRow>(&format!(
            "SELECT id, search_id, status, started_at, created_at FROM search_sessions WHERE status IN {}",
            NON_TERMINAL_STATUSES
        ))
        .fetch_all(&self.pool)
        .await;

        match full {
            Ok(rows) => Ok(rows),
            Err(e) if is_undefined_column(&e) => {
                tracing::warn!(
                    "search_sessions missing expected columns, using created_at-based recovery"
                );
                let minimal = sqlx::query_as::<_, MinimalSessionRow>(
                    "SELECT id, created_at FROM search_sessions WHERE created_at < $1",
                )
                .bind(fallback_cutoff)
                .fetch_all(&self.pool)
                .await?;
                Ok(minimal
                    .into_iter()
                    .map(|m| StaleSessionRow {
                        id: m.id,
                        search_id: None,
                        status: None,
                        started_at: None,
                        created_at: m.created_at,
                    })
                    .collect())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mark a stale session terminal; legacy schemas that cannot be
    /// updated get the row deleted instead.
    pub async fn finalize_stale_session(
        &self,
        id: Uuid,
        status: &str,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"UPDATE search_sessions
               SET status = $2, error_code = $3, error_message = $4, completed_at = NOW()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(status)
        .bind(error_code)
        .bind(error_message)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_undefined_column(&e) => {
                sqlx::query("DELETE FROM search_sessions WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // -- Monthly quota --

    /// Atomic check-and-increment: one statement, serialized per user by
    /// the `(user_id, month_key)` unique row. Returns the new count when
    /// the increment happened, `None` when the user is at the limit.
    pub async fn increment_quota_atomic(
        &self,
        user_id: &str,
        month_key: &str,
        max_quota: i64,
    ) -> anyhow::Result<Option<i64>> {
        let new_count = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO monthly_quota (user_id, month_key, searches_count)
               VALUES ($1, $2, 1)
               ON CONFLICT (user_id, month_key)
               DO UPDATE SET searches_count = monthly_quota.searches_count + 1
               WHERE monthly_quota.searches_count < $3
               RETURNING searches_count"#,
        )
        .bind(user_id)
        .bind(month_key)
        .bind(max_quota)
        .fetch_optional(&self.pool)
        .await?;
        Ok(new_count)
    }

    pub async fn get_quota_count(&self, user_id: &str, month_key: &str) -> anyhow::Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT searches_count FROM monthly_quota WHERE user_id = $1 AND month_key = $2",
        )
        .bind(user_id)
        .bind(month_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.unwrap_or(0))
    }

    /// Read-then-upsert fallback. The race window between the read and
    /// the write is an accepted degradation; the atomic path above is
    /// always tried first.
    pub async fn increment_quota_fallback(
        &self,
        user_id: &str,
        month_key: &str,
        max_quota: i64,
    ) -> anyhow::Result<Option<i64>> {
        let current = self.get_quota_count(user_id, month_key).await?;
        if current >= max_quota {
            return Ok(None);
        }
        let new_count = current + 1;
        sqlx::query(
            r#"INSERT INTO monthly_quota (user_id, month_key, searches_count)
               VALUES ($1, $2, $3)
               ON CONFLICT (user_id, month_key) DO UPDATE SET searches_count = $3"#,
        )
        .bind(user_id)
        .bind(month_key)
        .bind(new_count)
        .execute(&self.pool)
        .await?;
        Ok(Some(new_count))
    }

    // -- Profiles & subscriptions --

    pub async fn get_profile(&self, user_id: &str) -> anyhow::Result<Option<ProfileRow>> {
        let row = sqlx::query_as::<_, ProfileRow>(
            "SELECT user_id, is_admin, plan_type FROM profiles WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_subscription(&self, user_id: &str) -> anyhow::Result<Option<SubscriptionRow>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"SELECT user_id, plan_id, status, trial_expires_at
               FROM user_subscriptions
               WHERE user_id = $1 AND status IN ('active', 'trialing')
               ORDER BY created_at DESC LIMIT 1"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // -- OAuth tokens (sealed with the token vault) --

    pub async fn upsert_oauth_token(
        &self,
        user_id: &str,
        provider: &str,
        sealed_token: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO user_oauth_tokens (user_id, provider, sealed_token, updated_at)
               VALUES ($1, $2, $3, NOW())
               ON CONFLICT (user_id, provider)
               DO UPDATE SET sealed_token = $3, updated_at = NOW()"#,
        )
        .bind(user_id)
        .bind(provider)
        .bind(sealed_token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_oauth_token(
        &self,
        user_id: &str,
        provider: &str,
    ) -> anyhow::Result<Option<String>> {
        let token = sqlx::query_scalar::<_, String>(
            "SELECT sealed_token FROM user_oauth_tokens WHERE user_id = $1 AND provider = $2",
        )
        .bind(user_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;
        Ok(token)
    }
}

// ── Row types ────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct SearchSessionRow {
    pub id: Uuid,
    pub search_id: String,
    pub user_id: String,
    pub status: String,
    pub pipeline_stage: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_raw: Option<i64>,
    pub total_filtered: Option<i64>,
    pub valor_total: Option<f64>,
    pub resumo_executivo: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct TransitionRow {
    pub id: Uuid,
    pub search_id: String,
    pub from_state: Option<String>,
    pub to_state: String,
    pub stage: Option<String>,
    pub details: serde_json::Value,
    pub duration_since_previous_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StaleSessionRow {
    pub id: Uuid,
    pub search_id: Option<String>,
    pub status: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct MinimalSessionRow {
    id: Uuid,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProfileRow {
    pub user_id: String,
    pub is_admin: bool,
    pub plan_type: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub user_id: String,
    pub plan_id: String,
    pub status: String,
    pub trial_expires_at: Option<DateTime<Utc>>,
}
