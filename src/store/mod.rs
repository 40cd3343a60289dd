//! Persistence layer
//!
//! The engine only talks to [`Store`]. Two backends implement it:
//! [`MemoryStore`] for tests and local runs, [`PgStorage`] for production.
//!
//! Both backends enforce the two invariants the engine relies on:
//! - the campaign budget decrement is a single compare-and-set step
//! - at most one execution exists per (action, user)

mod memory;
mod pg;

pub use memory::MemoryStore;
pub use pg::PgStorage;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{
    Action, ActionId, ActionKind, Campaign, CampaignId, CampaignStatus, Execution, ExecutionId,
    ExecutionStatus, ExecutionUpdate, HoldingRequirement, NewExecution, NewPrizeWeek,
    PendingReward, PrizeWeek, PrizeWeekId, PrizeWeekStatus, PrizeWinner, Requirements,
    Reservation, ReservationId, ReputationEvent, TokenAmount, User, UserId, UserStatus, WinnerStatus,
};

/// Starting reputation of a freshly registered user
pub const DEFAULT_REPUTATION: i64 = 100;

#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub title: String,
    pub token_mint: String,
    pub total_budget: TokenAmount,
    pub status: CampaignStatus,
    pub creation_fee_paid: bool,
    pub requirements: Requirements,
    pub holder_rule: Option<HoldingRequirement>,
}

#[derive(Debug, Clone)]
pub struct NewAction {
    pub campaign_id: CampaignId,
    pub kind: ActionKind,
    pub title: String,
    pub url: String,
    pub reward_amount: TokenAmount,
    pub max_executions: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub wallet_address: String,
    pub status: UserStatus,
    pub twitter_handle: Option<String>,
    pub telegram_handle: Option<String>,
}

/// Result of the atomic budget decrement
#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    Reserved {
        reservation: Reservation,
        remaining: TokenAmount,
    },
    Insufficient {
        remaining: TokenAmount,
    },
    /// Budget already at zero; the ledger row was not touched
    Exhausted,
    NotActive(CampaignStatus),
    CampaignMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    AlreadyCommitted,
    /// The reservation was released earlier and can no longer be committed
    Released,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released { amount: TokenAmount },
    AlreadyReleased,
    /// Committed reservations are final
    Committed,
    Missing,
}

#[derive(Debug, Clone)]
pub enum CreateExecution {
    Created(Execution),
    /// The unique (action, user) slot is already taken by this row
    Duplicate(Execution),
}

#[async_trait]
pub trait Store: Send + Sync {
    // Campaigns
    async fn insert_campaign(&self, campaign: NewCampaign) -> Result<Campaign>;
    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>>;
    async fn count_funded_active_campaigns(&self) -> Result<u64>;

    // Budget ledger
    async fn reserve_budget(
        &self,
        campaign_id: CampaignId,
        amount: TokenAmount,
        reservation_id: ReservationId,
    ) -> Result<ReserveOutcome>;
    async fn commit_reservation(&self, id: ReservationId) -> Result<CommitOutcome>;
    async fn release_reservation(&self, id: ReservationId) -> Result<ReleaseOutcome>;
    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>>;
    async fn outstanding_reservations_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>>;

    // Actions
    async fn insert_action(&self, action: NewAction) -> Result<Action>;
    async fn get_action(&self, id: ActionId) -> Result<Option<Action>>;

    // Users and reputation
    async fn insert_user(&self, user: NewUser) -> Result<User>;
    async fn get_user(&self, id: UserId) -> Result<Option<User>>;
    async fn get_user_by_wallet(&self, wallet: &str) -> Result<Option<User>>;
    /// Set the user's linked social handles. `None` leaves a handle as is.
    /// Returns `None` when the user does not exist.
    async fn link_social(
        &self,
        user_id: UserId,
        twitter_handle: Option<String>,
        telegram_handle: Option<String>,
    ) -> Result<Option<User>>;
    /// Append a reputation event and apply it to the user's score.
    /// Idempotent per `execution_id`. Returns the resulting score.
    async fn add_reputation(&self, event: ReputationEvent) -> Result<i64>;
    /// Summed reputation deltas per user for events in `[start, end]`
    async fn reputation_deltas(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<(UserId, i64)>>;
    async fn top_users_by_reputation(&self, limit: usize) -> Result<Vec<User>>;

    // Executions
    async fn create_execution(&self, execution: NewExecution) -> Result<CreateExecution>;
    async fn get_execution(&self, id: ExecutionId) -> Result<Option<Execution>>;
    /// Move an execution to `to` only if its current status is in `from`.
    /// Returns the updated row, or `None` when the guard did not match.
    async fn transition_execution(
        &self,
        id: ExecutionId,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        update: ExecutionUpdate,
    ) -> Result<Option<Execution>>;
    async fn count_executions(&self, action_id: ActionId, statuses: &[ExecutionStatus])
        -> Result<u64>;
    async fn executions_by_status(
        &self,
        status: ExecutionStatus,
        limit: usize,
    ) -> Result<Vec<Execution>>;
    async fn execution_by_reservation(&self, id: ReservationId) -> Result<Option<Execution>>;
    async fn count_recent_executions(&self, user_id: UserId, since: DateTime<Utc>) -> Result<u64>;
    async fn pending_rewards(
        &self,
        user_id: UserId,
        campaign_id: Option<CampaignId>,
    ) -> Result<Vec<PendingReward>>;

    // Prize weeks
    async fn create_prize_week(&self, week: NewPrizeWeek) -> Result<PrizeWeek>;
    async fn get_prize_week(&self, id: PrizeWeekId) -> Result<Option<PrizeWeek>>;
    async fn latest_prize_week(&self) -> Result<Option<PrizeWeek>>;
    async fn list_prize_weeks(&self, limit: usize) -> Result<Vec<PrizeWeek>>;
    async fn update_prize_winner(
        &self,
        week_id: PrizeWeekId,
        rank: u32,
        status: WinnerStatus,
        transaction_signature: Option<String>,
        error_message: Option<String>,
    ) -> Result<()>;
    /// Move a winner from one of `from` to `in_flight`, stamping the attempt.
    /// `None` when the winner was in another state; the caller must not pay.
    async fn claim_prize_winner(
        &self,
        week_id: PrizeWeekId,
        rank: u32,
        from: &[WinnerStatus],
        now: DateTime<Utc>,
    ) -> Result<Option<PrizeWinner>>;
    async fn set_prize_week_status(&self, id: PrizeWeekId, status: PrizeWeekStatus) -> Result<()>;
}
