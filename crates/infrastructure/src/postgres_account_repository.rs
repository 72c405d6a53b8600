use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetlease_application::{AccountRepository, LeaseStore};
use fleetlease_core::{AppError, AppResult};
use fleetlease_domain::{
    Account, AccountEligibility, AccountId, AccountOrdering, FarmStage, LeaseOutcome,
};
use sqlx::{FromRow, PgPool};


const ACCOUNT_COLUMNS: &str = "id, username, profile_id, stage, score, enabled, in_use, \
     usage_count, created_at, next_eligible_at, last_used_at";

/// PostgreSQL-backed account repository.
#[derive(Clone)]
pub struct PostgresAccountRepository {
    pool: PgPool,
}

impl PostgresAccountRepository {
    /// Creates an account repository with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct AccountRow {
    id: uuid::Uuid,
    username: String,
    profile_id: String,
    stage: Option<String>,
    score: i64,
    enabled: bool,
    in_use: bool,
    usage_count: i64,
    created_at: DateTime<Utc>,
    next_eligible_at: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
}

fn account_from_row(row: AccountRow) -> AppResult<Account> {
    let stage = row
        .stage
        .as_deref()
        .map(FarmStage::parse)
        .transpose()?;

    Ok(Account {
        id: AccountId::from_uuid(row.id),
        username: row.username,
        profile_id: row.profile_id,
        stage,
        score: row.score,
        enabled: row.enabled,
        in_use: row.in_use,
        usage_count: row.usage_count,
        created_at: row.created_at,
        next_eligible_at: row.next_eligible_at,
        last_used_at: row.last_used_at,
    })
}

fn order_by(ordering: AccountOrdering) -> &'static str {
    match ordering {
        AccountOrdering::OldestCreatedFirst => "created_at ASC, id ASC",
        AccountOrdering::LongestOverdueFirst => {
            "next_eligible_at ASC NULLS FIRST, created_at ASC, id ASC"
        }
    }
}

fn stage_values(eligibility: &AccountEligibility) -> Vec<String> {
    eligibility
        .stages
        .iter()
        .map(|stage| stage.as_str().to_owned())
        .collect()
}

fn candidate_values(eligibility: &AccountEligibility) -> Option<Vec<uuid::Uuid>> {
    eligibility
        .candidate_ids
        .as_ref()
        .map(|ids| ids.iter().map(AccountId::as_uuid).collect())
}

#[async_trait]
impl LeaseStore<Account> for PostgresAccountRepository {
    async fn claim_next(
        &self,
        eligibility: &AccountEligibility,
        ordering: AccountOrdering,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Account>> {
        let statement = format!(
            r#"
            UPDATE accounts
            SET in_use = TRUE, last_used_at = $1
            WHERE id = (
                SELECT id
                FROM accounts
                WHERE enabled
                  AND NOT in_use
                  AND created_at <= $2
                  AND score >= $3
                  AND stage = ANY($4)
                  AND (next_eligible_at IS NULL OR next_eligible_at <= $1)
                  AND ($5::UUID[] IS NULL OR id = ANY($5))
                ORDER BY {order}
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
              AND NOT in_use
            RETURNING {ACCOUNT_COLUMNS}
            "#,
            order = order_by(ordering),
        );

        let row = sqlx::query_as::<_, AccountRow>(statement.as_str())
            .bind(now)
            .bind(eligibility.created_before)
            .bind(eligibility.minimum_score)
            .bind(stage_values(eligibility))
            .bind(candidate_values(eligibility))
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!("failed to claim account: {error}"))
            })?;

        row.map(account_from_row).transpose()
    }

    async fn release_claim(
        &self,
        resource_id: AccountId,
        outcome: LeaseOutcome,
        next_eligible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let usage_increment: i64 = match outcome {
            LeaseOutcome::Success => 1,
            LeaseOutcome::Failure => 0,
        };

        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET
                in_use = FALSE,
                last_used_at = $2,
                next_eligible_at = $3,
                usage_count = usage_count + $4
            WHERE id = $1
              AND in_use
            "#,
        )
        .bind(resource_id.as_uuid())
        .bind(now)
        .bind(next_eligible_at)
        .bind(usage_increment)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::StoreUnavailable(format!(
                "failed to release account '{resource_id}': {error}"
            ))
        })?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "account '{resource_id}' is not marked in use"
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl AccountRepository for PostgresAccountRepository {
    async fn save_account(&self, account: Account) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
                id,
                username,
                profile_id,
                stage,
                score,
                enabled,
                in_use,
                usage_count,
                created_at,
                next_eligible_at,
                last_used_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id)
            DO UPDATE SET
                username = EXCLUDED.username,
                profile_id = EXCLUDED.profile_id,
                stage = EXCLUDED.stage,
                score = EXCLUDED.score,
                enabled = EXCLUDED.enabled,
                in_use = EXCLUDED.in_use,
                usage_count = EXCLUDED.usage_count,
                created_at = EXCLUDED.created_at,
                next_eligible_at = EXCLUDED.next_eligible_at,
                last_used_at = EXCLUDED.last_used_at
            "#,
        )
        .bind(account.id.as_uuid())
        .bind(account.username.as_str())
        .bind(account.profile_id.as_str())
        .bind(account.stage.map(|stage| stage.as_str()))
        .bind(account.score)
        .bind(account.enabled)
        .bind(account.in_use)
        .bind(account.usage_count)
        .bind(account.created_at)
        .bind(account.next_eligible_at)
        .bind(account.last_used_at)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::StoreUnavailable(format!(
                "failed to save account '{}': {error}",
                account.username
            ))
        })?;

        Ok(())
    }

    async fn find_account(&self, account_id: AccountId) -> AppResult<Option<Account>> {
        let statement = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");
        let row = sqlx::query_as::<_, AccountRow>(statement.as_str())
            .bind(account_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!(
                    "failed to find account '{account_id}': {error}"
                ))
            })?;

        row.map(account_from_row).transpose()
    }

    async fn list_fairness_window(
        &self,
        eligibility: &AccountEligibility,
        limit: usize,
    ) -> AppResult<Vec<Account>> {
        let limit = i64::try_from(limit).map_err(|error| {
            AppError::Validation(format!("invalid account window limit: {error}"))
        })?;
        let statement = format!(
            r#"
            SELECT {ACCOUNT_COLUMNS}
            FROM accounts
            WHERE enabled
              AND created_at <= $1
              AND score >= $2
              AND stage = ANY($3)
            ORDER BY created_at ASC, id ASC
            LIMIT $4
            "#
        );

        let rows = sqlx::query_as::<_, AccountRow>(statement.as_str())
            .bind(eligibility.created_before)
            .bind(eligibility.minimum_score)
            .bind(stage_values(eligibility))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!("failed to list account window: {error}"))
            })?;

        rows.into_iter().map(account_from_row).collect()
    }
}
