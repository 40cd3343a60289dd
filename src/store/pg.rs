//! PostgreSQL Storage
//!
//! Production backend. Connects with DATABASE_URL through a deadpool pool.
//!
//! The budget decrement is one conditional UPDATE (`remaining_budget >= $amount`)
//! chained with the reservation INSERT in a single statement, so concurrent
//! reservations are linearized by the row lock Postgres takes for the UPDATE.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::types::Json;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};

use super::{
    CommitOutcome, CreateExecution, NewAction, NewCampaign, NewUser, ReleaseOutcome,
    ReserveOutcome, Store,
};
use crate::config::DatabaseConfig;
use crate::types::{
    Action, ActionId, Campaign, CampaignId, CampaignStatus, Execution, ExecutionId,
    ExecutionStatus, ExecutionUpdate, HoldingRequirement, NewExecution, NewPrizeWeek,
    PendingReward, PrizeWeek, PrizeWeekId, PrizeWeekStatus, PrizeWinner, Requirements,
    Reservation, ReservationId, ReservationState, ReputationEvent, TokenAmount, User, UserId,
    WinnerStatus,
};

const CAMPAIGN_COLUMNS: &str = "id, title, token_mint, total_budget, remaining_budget, status, \
     creation_fee_paid, requirements, holder_rule, created_at";

const EXECUTION_COLUMNS: &str = "id, action_id, campaign_id, user_id, status, proof, \
     reserved_amount, reservation_id, transaction_signature, retry_count, next_attempt_at, \
     hold_until, error_message, created_at, updated_at, paid_at";

const USER_COLUMNS: &str =
    "id, wallet_address, reputation_score, status, twitter_handle, telegram_handle, created_at";

const PRIZE_WEEK_COLUMNS: &str =
    "id, week_number, start_date, end_date, total_prize_pool, status, winners, created_at";

// ============================================================================
// ROW MAPPING
// ============================================================================

fn campaign_from_row(r: &Row) -> Campaign {
    let Json(requirements): Json<Requirements> = r.get("requirements");
    let holder_rule: Option<Json<HoldingRequirement>> = r.get("holder_rule");
    Campaign {
        id: r.get("id"),
        title: r.get("title"),
        token_mint: r.get("token_mint"),
        total_budget: TokenAmount::from_sql_units(r.get("total_budget")),
        remaining_budget: TokenAmount::from_sql_units(r.get("remaining_budget")),
        status: r.get("status"),
        creation_fee_paid: r.get("creation_fee_paid"),
        requirements,
        holder_rule: holder_rule.map(|Json(rule)| rule),
        created_at: r.get("created_at"),
    }
}

fn action_from_row(r: &Row) -> Action {
    Action {
        id: r.get("id"),
        campaign_id: r.get("campaign_id"),
        kind: r.get("kind"),
        title: r.get("title"),
        url: r.get("url"),
        reward_amount: TokenAmount::from_sql_units(r.get("reward_amount")),
        max_executions: r
            .get::<_, Option<i32>>("max_executions")
            .map(|m| m.max(0) as u32),
    }
}

fn user_from_row(r: &Row) -> User {
    User {
        id: r.get("id"),
        wallet_address: r.get("wallet_address"),
        reputation_score: r.get("reputation_score"),
        status: r.get("status"),
        twitter_handle: r.get("twitter_handle"),
        telegram_handle: r.get("telegram_handle"),
        created_at: r.get("created_at"),
    }
}

fn execution_from_row(r: &Row) -> Execution {
    Execution {
        id: r.get("id"),
        action_id: r.get("action_id"),
        campaign_id: r.get("campaign_id"),
        user_id: r.get("user_id"),
        status: r.get("status"),
        proof: r.get("proof"),
        reserved_amount: TokenAmount::from_sql_units(r.get("reserved_amount")),
        reservation_id: r.get("reservation_id"),
        transaction_signature: r.get("transaction_signature"),
        retry_count: r.get::<_, i32>("retry_count").max(0) as u32,
        next_attempt_at: r.get("next_attempt_at"),
        hold_until: r.get("hold_until"),
        error_message: r.get("error_message"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        paid_at: r.get("paid_at"),
    }
}

fn reservation_from_row(r: &Row) -> Reservation {
    Reservation {
        id: r.get("id"),
        campaign_id: r.get("campaign_id"),
        amount: TokenAmount::from_sql_units(r.get("amount")),
        state: r.get("state"),
        created_at: r.get("created_at"),
    }
}

fn prize_week_from_row(r: &Row) -> PrizeWeek {
    let Json(winners): Json<Vec<PrizeWinner>> = r.get("winners");
    PrizeWeek {
        id: r.get("id"),
        week_number: r.get::<_, i32>("week_number").max(0) as u32,
        start_date: r.get("start_date"),
        end_date: r.get("end_date"),
        total_prize_pool: TokenAmount::from_sql_units(r.get("total_prize_pool")),
        status: r.get("status"),
        winners,
        created_at: r.get("created_at"),
    }
}

// ============================================================================
// PG STORAGE
// ============================================================================

#[derive(Clone)]
pub struct PgStorage {
    pool: Pool,
}

impl PgStorage {
    /// Create storage from DATABASE_URL
    pub async fn new(database_url: &str, settings: &DatabaseConfig) -> Result<Self> {
        let mut config = Config::new();
        config.url = Some(database_url.to_string());

        config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        config.pool = Some(PoolConfig {
            max_size: settings.pool_max_size,
            timeouts: deadpool_postgres::Timeouts {
                wait: Some(Duration::from_secs(settings.query_timeout_secs)),
                create: Some(Duration::from_secs(10)),
                recycle: Some(Duration::from_secs(30)),
            },
            ..Default::default()
        });

        let pool = config.create_pool(Some(Runtime::Tokio1), NoTls)?;

        // Test connection
        let client = pool.get().await?;
        client
            .execute(
                &format!("SET statement_timeout = '{}s'", settings.query_timeout_secs),
                &[],
            )
            .await?;

        info!(
            "Connected to PostgreSQL (pool_size: {}, query_timeout: {}s)",
            settings.pool_max_size, settings.query_timeout_secs
        );

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run embedded migrations
    async fn run_migrations(&self) -> Result<()> {
        let client = self.pool.get().await?;

        let exists: bool = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM information_schema.tables WHERE table_name = 'schema_migrations')",
                &[],
            )
            .await?
            .get(0);

        let has_schema = if exists {
            client
                .query_one(
                    "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = 1)",
                    &[],
                )
                .await?
                .get(0)
        } else {
            false
        };

        if !has_schema {
            let migration_sql = include_str!("../../migrations/001_schema.sql");
            client.batch_execute(migration_sql).await?;
            info!("Applied migration 001_schema");
        }

        Ok(())
    }

    async fn reservation_state(&self, id: ReservationId) -> Result<Option<ReservationState>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT state FROM budget_reservations WHERE id = $1", &[&id])
            .await?;
        Ok(row.map(|r| r.get(0)))
    }
}

#[async_trait]
impl Store for PgStorage {
    // ========================================================================
    // CAMPAIGNS
    // ========================================================================

    async fn insert_campaign(&self, campaign: NewCampaign) -> Result<Campaign> {
        let client = self.pool.get().await?;
        let budget = campaign.total_budget.to_sql_units()?;
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO campaigns (title, token_mint, total_budget, remaining_budget, status, creation_fee_paid, requirements, holder_rule)
                     VALUES ($1, $2, $3, $3, $4, $5, $6, $7)
                     RETURNING {}",
                    CAMPAIGN_COLUMNS
                ),
                &[
                    &campaign.title,
                    &campaign.token_mint,
                    &budget,
                    &campaign.status,
                    &campaign.creation_fee_paid,
                    &Json(&campaign.requirements),
                    &campaign.holder_rule.as_ref().map(Json),
                ],
            )
            .await?;
        Ok(campaign_from_row(&row))
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {} FROM campaigns WHERE id = $1", CAMPAIGN_COLUMNS),
                &[&id],
            )
            .await?;
        Ok(row.as_ref().map(campaign_from_row))
    }

    async fn count_funded_active_campaigns(&self) -> Result<u64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM campaigns WHERE status = 'active' AND creation_fee_paid",
                &[],
            )
            .await?;
        Ok(row.get::<_, i64>(0).max(0) as u64)
    }

    // ========================================================================
    // BUDGET LEDGER
    // ========================================================================

    async fn reserve_budget(
        &self,
        campaign_id: CampaignId,
        amount: TokenAmount,
        reservation_id: ReservationId,
    ) -> Result<ReserveOutcome> {
        let client = self.pool.get().await?;

        // Fail fast without touching the ledger row
        let Some(current) = client
            .query_opt(
                "SELECT status, remaining_budget FROM campaigns WHERE id = $1",
                &[&campaign_id],
            )
            .await?
        else {
            return Ok(ReserveOutcome::CampaignMissing);
        };
        match current.get::<_, CampaignStatus>(0) {
            CampaignStatus::Active => {}
            CampaignStatus::Exhausted => return Ok(ReserveOutcome::Exhausted),
            other => return Ok(ReserveOutcome::NotActive(other)),
        }

        let units = amount.to_sql_units()?;
        let reserved = client
            .query_opt(
                "WITH debit AS (
                    UPDATE campaigns
                    SET remaining_budget = remaining_budget - $2,
                        status = CASE WHEN remaining_budget - $2 = 0
                                      THEN 'exhausted'::campaign_status
                                      ELSE status END
                    WHERE id = $1 AND status = 'active' AND remaining_budget >= $2
                    RETURNING id, remaining_budget
                 ),
                 hold AS (
                    INSERT INTO budget_reservations (id, campaign_id, amount)
                    SELECT $3, id, $2 FROM debit
                    RETURNING created_at
                 )
                 SELECT debit.remaining_budget, hold.created_at FROM debit, hold",
                &[&campaign_id, &units, &reservation_id],
            )
            .await?;

        if let Some(row) = reserved {
            let remaining = TokenAmount::from_sql_units(row.get(0));
            debug!(campaign_id, %reservation_id, remaining = %remaining, "Budget reserved");
            return Ok(ReserveOutcome::Reserved {
                reservation: Reservation {
                    id: reservation_id,
                    campaign_id,
                    amount,
                    state: ReservationState::Outstanding,
                    created_at: row.get(1),
                },
                remaining,
            });
        }

        // Lost the race or not enough left; report what the row says now
        let row = client
            .query_one(
                "SELECT status, remaining_budget FROM campaigns WHERE id = $1",
                &[&campaign_id],
            )
            .await?;
        Ok(match row.get::<_, CampaignStatus>(0) {
            CampaignStatus::Exhausted => ReserveOutcome::Exhausted,
            CampaignStatus::Active => ReserveOutcome::Insufficient {
                remaining: TokenAmount::from_sql_units(row.get(1)),
            },
            other => ReserveOutcome::NotActive(other),
        })
    }

    async fn commit_reservation(&self, id: ReservationId) -> Result<CommitOutcome> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE budget_reservations SET state = 'committed', settled_at = NOW()
                 WHERE id = $1 AND state = 'outstanding'",
                &[&id],
            )
            .await?;
        if updated > 0 {
            return Ok(CommitOutcome::Committed);
        }
        Ok(match self.reservation_state(id).await? {
            Some(ReservationState::Committed) => CommitOutcome::AlreadyCommitted,
            Some(ReservationState::Released) => CommitOutcome::Released,
            // Another caller committed in between
            Some(ReservationState::Outstanding) => CommitOutcome::AlreadyCommitted,
            None => CommitOutcome::Missing,
        })
    }

    async fn release_reservation(&self, id: ReservationId) -> Result<ReleaseOutcome> {
        let client = self.pool.get().await?;
        let released = client
            .query_opt(
                "WITH freed AS (
                    UPDATE budget_reservations SET state = 'released', settled_at = NOW()
                    WHERE id = $1 AND state = 'outstanding'
                    RETURNING campaign_id, amount
                 ),
                 credit AS (
                    UPDATE campaigns c
                    SET remaining_budget = c.remaining_budget + freed.amount,
                        status = CASE WHEN c.status = 'exhausted'
                                      THEN 'active'::campaign_status
                                      ELSE c.status END
                    FROM freed
                    WHERE c.id = freed.campaign_id
                    RETURNING c.id
                 )
                 SELECT freed.amount FROM freed, credit",
                &[&id],
            )
            .await?;

        if let Some(row) = released {
            let amount = TokenAmount::from_sql_units(row.get(0));
            debug!(%id, amount = %amount, "Budget released");
            return Ok(ReleaseOutcome::Released { amount });
        }
        Ok(match self.reservation_state(id).await? {
            Some(ReservationState::Committed) => ReleaseOutcome::Committed,
            Some(_) => ReleaseOutcome::AlreadyReleased,
            None => ReleaseOutcome::Missing,
        })
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, campaign_id, amount, state, created_at FROM budget_reservations WHERE id = $1",
                &[&id],
            )
            .await?;
        Ok(row.as_ref().map(reservation_from_row))
    }

    async fn outstanding_reservations_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id, campaign_id, amount, state, created_at FROM budget_reservations
                 WHERE state = 'outstanding' AND created_at < $1
                 ORDER BY created_at
                 LIMIT $2",
                &[&cutoff, &(limit as i64)],
            )
            .await?;
        Ok(rows.iter().map(reservation_from_row).collect())
    }

    // ========================================================================
    // ACTIONS
    // ========================================================================

    async fn insert_action(&self, action: NewAction) -> Result<Action> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "INSERT INTO actions (campaign_id, kind, title, url, reward_amount, max_executions)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 RETURNING id, campaign_id, kind, title, url, reward_amount, max_executions",
                &[
                    &action.campaign_id,
                    &action.kind,
                    &action.title,
                    &action.url,
                    &action.reward_amount.to_sql_units()?,
                    &action.max_executions.map(|m| m as i32),
                ],
            )
            .await?;
        Ok(action_from_row(&row))
    }

    async fn get_action(&self, id: ActionId) -> Result<Option<Action>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, campaign_id, kind, title, url, reward_amount, max_executions
                 FROM actions WHERE id = $1",
                &[&id],
            )
            .await?;
        Ok(row.as_ref().map(action_from_row))
    }

    // ========================================================================
    // USERS & REPUTATION
    // ========================================================================

    async fn insert_user(&self, user: NewUser) -> Result<User> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO users (wallet_address, status, twitter_handle, telegram_handle)
                     VALUES ($1, $2, $3, $4)
                     RETURNING {}",
                    USER_COLUMNS
                ),
                &[
                    &user.wallet_address,
                    &user.status,
                    &user.twitter_handle,
                    &user.telegram_handle,
                ],
            )
            .await?;
        info!("Registered wallet {}", user.wallet_address);
        Ok(user_from_row(&row))
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS),
                &[&id],
            )
            .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn get_user_by_wallet(&self, wallet: &str) -> Result<Option<User>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {} FROM users WHERE wallet_address = $1", USER_COLUMNS),
                &[&wallet],
            )
            .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn link_social(
        &self,
        user_id: UserId,
        twitter_handle: Option<String>,
        telegram_handle: Option<String>,
    ) -> Result<Option<User>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE users
                     SET twitter_handle = COALESCE($2, twitter_handle),
                         telegram_handle = COALESCE($3, telegram_handle)
                     WHERE id = $1
                     RETURNING {}",
                    USER_COLUMNS
                ),
                &[&user_id, &twitter_handle, &telegram_handle],
            )
            .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn add_reputation(&self, event: ReputationEvent) -> Result<i64> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let inserted = tx
            .execute(
                "INSERT INTO reputation_events (user_id, delta, execution_id, recorded_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (execution_id) DO NOTHING",
                &[
                    &event.user_id,
                    &event.delta,
                    &event.execution_id,
                    &event.recorded_at,
                ],
            )
            .await?;

        let row = if inserted > 0 {
            tx.query_one(
                "UPDATE users SET reputation_score = reputation_score + $2
                 WHERE id = $1 RETURNING reputation_score",
                &[&event.user_id, &event.delta],
            )
            .await?
        } else {
            tx.query_one(
                "SELECT reputation_score FROM users WHERE id = $1",
                &[&event.user_id],
            )
            .await?
        };

        tx.commit().await?;
        Ok(row.get(0))
    }

    async fn reputation_deltas(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<(UserId, i64)>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT user_id, SUM(delta)::BIGINT FROM reputation_events
                 WHERE recorded_at >= $1 AND recorded_at <= $2
                 GROUP BY user_id",
                &[&start, &end],
            )
            .await?;
        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    async fn top_users_by_reputation(&self, limit: usize) -> Result<Vec<User>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM users ORDER BY reputation_score DESC, created_at ASC LIMIT $1",
                    USER_COLUMNS
                ),
                &[&(limit as i64)],
            )
            .await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    // ========================================================================
    // EXECUTIONS
    // ========================================================================

    async fn create_execution(&self, execution: NewExecution) -> Result<CreateExecution> {
        let client = self.pool.get().await?;
        let created = client
            .query_opt(
                &format!(
                    "INSERT INTO executions (action_id, campaign_id, user_id, proof, reserved_amount)
                     VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (action_id, user_id) DO NOTHING
                     RETURNING {}",
                    EXECUTION_COLUMNS
                ),
                &[
                    &execution.action_id,
                    &execution.campaign_id,
                    &execution.user_id,
                    &execution.proof,
                    &execution.reserved_amount.to_sql_units()?,
                ],
            )
            .await?;

        if let Some(row) = created {
            return Ok(CreateExecution::Created(execution_from_row(&row)));
        }

        let row = client
            .query_one(
                &format!(
                    "SELECT {} FROM executions WHERE action_id = $1 AND user_id = $2",
                    EXECUTION_COLUMNS
                ),
                &[&execution.action_id, &execution.user_id],
            )
            .await?;
        Ok(CreateExecution::Duplicate(execution_from_row(&row)))
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<Execution>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {} FROM executions WHERE id = $1", EXECUTION_COLUMNS),
                &[&id],
            )
            .await?;
        Ok(row.as_ref().map(execution_from_row))
    }

    async fn transition_execution(
        &self,
        id: ExecutionId,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        update: ExecutionUpdate,
    ) -> Result<Option<Execution>> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let Some(row) = tx
            .query_opt(
                &format!(
                    "SELECT {} FROM executions WHERE id = $1 FOR UPDATE",
                    EXECUTION_COLUMNS
                ),
                &[&id],
            )
            .await?
        else {
            return Ok(None);
        };

        let mut execution = execution_from_row(&row);
        if !from.contains(&execution.status) {
            return Ok(None);
        }
        let previous = execution.status;
        execution.apply(to, update);

        tx.execute(
            "UPDATE executions
             SET status = $2, reservation_id = $3, transaction_signature = $4, retry_count = $5,
                 next_attempt_at = $6, hold_until = $7, error_message = $8, paid_at = $9,
                 updated_at = $10
             WHERE id = $1",
            &[
                &id,
                &execution.status,
                &execution.reservation_id,
                &execution.transaction_signature,
                &(execution.retry_count as i32),
                &execution.next_attempt_at,
                &execution.hold_until,
                &execution.error_message,
                &execution.paid_at,
                &execution.updated_at,
            ],
        )
        .await?;
        tx.execute(
            "INSERT INTO execution_transitions (execution_id, from_status, to_status)
             VALUES ($1, $2, $3)",
            &[&id, &previous, &to],
        )
        .await?;
        tx.commit().await?;

        Ok(Some(execution))
    }

    async fn count_executions(
        &self,
        action_id: ActionId,
        statuses: &[ExecutionStatus],
    ) -> Result<u64> {
        let client = self.pool.get().await?;
        let statuses = statuses.to_vec();
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM executions WHERE action_id = $1 AND status = ANY($2)",
                &[&action_id, &statuses],
            )
            .await?;
        Ok(row.get::<_, i64>(0).max(0) as u64)
    }

    async fn executions_by_status(
        &self,
        status: ExecutionStatus,
        limit: usize,
    ) -> Result<Vec<Execution>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM executions WHERE status = $1 ORDER BY updated_at LIMIT $2",
                    EXECUTION_COLUMNS
                ),
                &[&status, &(limit as i64)],
            )
            .await?;
        Ok(rows.iter().map(execution_from_row).collect())
    }

    async fn execution_by_reservation(&self, id: ReservationId) -> Result<Option<Execution>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM executions WHERE reservation_id = $1",
                    EXECUTION_COLUMNS
                ),
                &[&id],
            )
            .await?;
        Ok(row.as_ref().map(execution_from_row))
    }

    async fn count_recent_executions(&self, user_id: UserId, since: DateTime<Utc>) -> Result<u64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM executions WHERE user_id = $1 AND created_at >= $2",
                &[&user_id, &since],
            )
            .await?;
        Ok(row.get::<_, i64>(0).max(0) as u64)
    }

    async fn pending_rewards(
        &self,
        user_id: UserId,
        campaign_id: Option<CampaignId>,
    ) -> Result<Vec<PendingReward>> {
        let client = self.pool.get().await?;
        let unpaid = ExecutionStatus::UNPAID.to_vec();
        let rows = client
            .query(
                "SELECT e.id, e.campaign_id, e.action_id, e.status, e.reserved_amount, c.token_mint, e.hold_until
                 FROM executions e
                 JOIN campaigns c ON c.id = e.campaign_id
                 WHERE e.user_id = $1
                   AND e.status = ANY($2)
                   AND ($3::BIGINT IS NULL OR e.campaign_id = $3)
                 ORDER BY e.id",
                &[&user_id, &unpaid, &campaign_id],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|r| PendingReward {
                execution_id: r.get(0),
                campaign_id: r.get(1),
                action_id: r.get(2),
                status: r.get(3),
                amount: TokenAmount::from_sql_units(r.get(4)),
                token_mint: r.get(5),
                hold_until: r.get(6),
            })
            .collect())
    }

    // ========================================================================
    // PRIZE WEEKS
    // ========================================================================

    async fn create_prize_week(&self, week: NewPrizeWeek) -> Result<PrizeWeek> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO prize_weeks (week_number, start_date, end_date, total_prize_pool, status, winners)
                     VALUES ($1, $2, $3, $4, 'processing', $5)
                     RETURNING {}",
                    PRIZE_WEEK_COLUMNS
                ),
                &[
                    &(week.week_number as i32),
                    &week.start_date,
                    &week.end_date,
                    &week.total_prize_pool.to_sql_units()?,
                    &Json(&week.winners),
                ],
            )
            .await?;
        info!("Created prize week #{}", week.week_number);
        Ok(prize_week_from_row(&row))
    }

    async fn get_prize_week(&self, id: PrizeWeekId) -> Result<Option<PrizeWeek>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {} FROM prize_weeks WHERE id = $1", PRIZE_WEEK_COLUMNS),
                &[&id],
            )
            .await?;
        Ok(row.as_ref().map(prize_week_from_row))
    }

    async fn latest_prize_week(&self) -> Result<Option<PrizeWeek>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM prize_weeks ORDER BY end_date DESC LIMIT 1",
                    PRIZE_WEEK_COLUMNS
                ),
                &[],
            )
            .await?;
        Ok(row.as_ref().map(prize_week_from_row))
    }

    async fn list_prize_weeks(&self, limit: usize) -> Result<Vec<PrizeWeek>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM prize_weeks ORDER BY end_date DESC LIMIT $1",
                    PRIZE_WEEK_COLUMNS
                ),
                &[&(limit as i64)],
            )
            .await?;
        Ok(rows.iter().map(prize_week_from_row).collect())
    }

    async fn update_prize_winner(
        &self,
        week_id: PrizeWeekId,
        rank: u32,
        status: WinnerStatus,
        transaction_signature: Option<String>,
        error_message: Option<String>,
    ) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT winners FROM prize_weeks WHERE id = $1 FOR UPDATE",
                &[&week_id],
            )
            .await?
            .ok_or_else(|| anyhow::anyhow!("prize week {} not found", week_id))?;
        let Json(mut winners): Json<Vec<PrizeWinner>> = row.get(0);

        let winner = winners
            .iter_mut()
            .find(|w| w.rank == rank)
            .ok_or_else(|| anyhow::anyhow!("prize week {} has no rank {}", week_id, rank))?;
        winner.status = status;
        if transaction_signature.is_some() {
            winner.transaction_signature = transaction_signature;
        }
        winner.error_message = error_message;

        tx.execute(
            "UPDATE prize_weeks SET winners = $2 WHERE id = $1",
            &[&week_id, &Json(&winners)],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn claim_prize_winner(
        &self,
        week_id: PrizeWeekId,
        rank: u32,
        from: &[WinnerStatus],
        now: DateTime<Utc>,
    ) -> Result<Option<PrizeWinner>> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        // The row lock serializes claimants of every winner in the week
        let row = tx
            .query_opt(
                "SELECT winners FROM prize_weeks WHERE id = $1 FOR UPDATE",
                &[&week_id],
            )
            .await?
            .ok_or_else(|| anyhow::anyhow!("prize week {} not found", week_id))?;
        let Json(mut winners): Json<Vec<PrizeWinner>> = row.get(0);

        let winner = winners
            .iter_mut()
            .find(|w| w.rank == rank)
            .ok_or_else(|| anyhow::anyhow!("prize week {} has no rank {}", week_id, rank))?;
        if !from.contains(&winner.status) {
            return Ok(None);
        }
        winner.status = WinnerStatus::InFlight;
        winner.attempted_at = Some(now);
        winner.error_message = None;
        let claimed = winner.clone();

        tx.execute(
            "UPDATE prize_weeks SET winners = $2 WHERE id = $1",
            &[&week_id, &Json(&winners)],
        )
        .await?;
        tx.commit().await?;
        Ok(Some(claimed))
    }

    async fn set_prize_week_status(&self, id: PrizeWeekId, status: PrizeWeekStatus) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE prize_weeks SET status = $2 WHERE id = $1",
                &[&id, &status],
            )
            .await?;
        Ok(())
    }
}
