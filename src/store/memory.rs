//! In-memory store
//!
//! Each campaign row sits behind its own mutex so budget operations on
//! different campaigns never contend. Lock order is campaign row, then the
//! reservation table.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::{
    CommitOutcome, CreateExecution, NewAction, NewCampaign, NewUser, ReleaseOutcome,
    ReserveOutcome, Store, DEFAULT_REPUTATION,
};
use crate::types::{
    Action, ActionId, Campaign, CampaignId, CampaignStatus, Execution, ExecutionId,
    ExecutionStatus, ExecutionUpdate, NewExecution, NewPrizeWeek, PendingReward, PrizeWeek,
    PrizeWeekId, PrizeWeekStatus, PrizeWinner, Reservation, ReservationId, ReservationState,
    ReputationEvent, TokenAmount, User, UserId, WinnerStatus,
};

#[derive(Default)]
struct ExecutionTable {
    rows: HashMap<ExecutionId, Execution>,
    by_pair: HashMap<(ActionId, UserId), ExecutionId>,
}

pub struct MemoryStore {
    campaigns: RwLock<HashMap<CampaignId, Arc<Mutex<Campaign>>>>,
    reservations: Mutex<HashMap<ReservationId, Reservation>>,
    actions: RwLock<HashMap<ActionId, Action>>,
    users: RwLock<HashMap<UserId, User>>,
    reputation_events: Mutex<Vec<ReputationEvent>>,
    executions: RwLock<ExecutionTable>,
    prize_weeks: RwLock<BTreeMap<PrizeWeekId, PrizeWeek>>,
    next_id: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            campaigns: RwLock::new(HashMap::new()),
            reservations: Mutex::new(HashMap::new()),
            actions: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
            reputation_events: Mutex::new(Vec::new()),
            executions: RwLock::new(ExecutionTable::default()),
            prize_weeks: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn campaign_row(&self, id: CampaignId) -> Option<Arc<Mutex<Campaign>>> {
        self.campaigns.read().get(&id).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_campaign(&self, campaign: NewCampaign) -> Result<Campaign> {
        let row = Campaign {
            id: self.next_id(),
            title: campaign.title,
            token_mint: campaign.token_mint,
            total_budget: campaign.total_budget,
            remaining_budget: campaign.total_budget,
            status: campaign.status,
            creation_fee_paid: campaign.creation_fee_paid,
            requirements: campaign.requirements,
            holder_rule: campaign.holder_rule,
            created_at: Utc::now(),
        };
        self.campaigns
            .write()
            .insert(row.id, Arc::new(Mutex::new(row.clone())));
        Ok(row)
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.campaign_row(id).map(|row| row.lock().clone()))
    }

    async fn count_funded_active_campaigns(&self) -> Result<u64> {
        let campaigns = self.campaigns.read();
        Ok(campaigns
            .values()
            .filter(|row| {
                let c = row.lock();
                c.status == CampaignStatus::Active && c.creation_fee_paid
            })
            .count() as u64)
    }

    async fn reserve_budget(
        &self,
        campaign_id: CampaignId,
        amount: TokenAmount,
        reservation_id: ReservationId,
    ) -> Result<ReserveOutcome> {
        let Some(row) = self.campaign_row(campaign_id) else {
            return Ok(ReserveOutcome::CampaignMissing);
        };
        let mut campaign = row.lock();

        match campaign.status {
            CampaignStatus::Active => {}
            CampaignStatus::Exhausted => return Ok(ReserveOutcome::Exhausted),
            other => return Ok(ReserveOutcome::NotActive(other)),
        }

        let Some(remaining) = campaign.remaining_budget.checked_sub(amount) else {
            return Ok(ReserveOutcome::Insufficient {
                remaining: campaign.remaining_budget,
            });
        };

        campaign.remaining_budget = remaining;
        if remaining.is_zero() {
            campaign.status = CampaignStatus::Exhausted;
        }

        let reservation = Reservation {
            id: reservation_id,
            campaign_id,
            amount,
            state: ReservationState::Outstanding,
            created_at: Utc::now(),
        };
        self.reservations
            .lock()
            .insert(reservation_id, reservation.clone());

        debug!(campaign_id, %reservation_id, remaining = %remaining, "Budget reserved");
        Ok(ReserveOutcome::Reserved {
            reservation,
            remaining,
        })
    }

    async fn commit_reservation(&self, id: ReservationId) -> Result<CommitOutcome> {
        let mut reservations = self.reservations.lock();
        let Some(reservation) = reservations.get_mut(&id) else {
            return Ok(CommitOutcome::Missing);
        };
        Ok(match reservation.state {
            ReservationState::Outstanding => {
                reservation.state = ReservationState::Committed;
                CommitOutcome::Committed
            }
            ReservationState::Committed => CommitOutcome::AlreadyCommitted,
            ReservationState::Released => CommitOutcome::Released,
        })
    }

    async fn release_reservation(&self, id: ReservationId) -> Result<ReleaseOutcome> {
        let campaign_id = match self.reservations.lock().get(&id) {
            Some(r) => r.campaign_id,
            None => return Ok(ReleaseOutcome::Missing),
        };
        let row = self
            .campaign_row(campaign_id)
            .ok_or_else(|| anyhow!("reservation {} references missing campaign {}", id, campaign_id))?;

        let mut campaign = row.lock();
        let mut reservations = self.reservations.lock();
        let Some(reservation) = reservations.get_mut(&id) else {
            return Ok(ReleaseOutcome::Missing);
        };

        match reservation.state {
            ReservationState::Released => return Ok(ReleaseOutcome::AlreadyReleased),
            ReservationState::Committed => return Ok(ReleaseOutcome::Committed),
            ReservationState::Outstanding => {}
        }

        let restored = campaign
            .remaining_budget
            .checked_add(reservation.amount)
            .filter(|r| *r <= campaign.total_budget)
            .ok_or_else(|| anyhow!("release of {} would exceed campaign {} budget", id, campaign_id))?;

        reservation.state = ReservationState::Released;
        campaign.remaining_budget = restored;
        if campaign.status == CampaignStatus::Exhausted && !restored.is_zero() {
            campaign.status = CampaignStatus::Active;
        }

        debug!(campaign_id, %id, remaining = %restored, "Budget released");
        Ok(ReleaseOutcome::Released {
            amount: reservation.amount,
        })
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        Ok(self.reservations.lock().get(&id).cloned())
    }

    async fn outstanding_reservations_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>> {
        let reservations = self.reservations.lock();
        let mut stale: Vec<Reservation> = reservations
            .values()
            .filter(|r| r.state == ReservationState::Outstanding && r.created_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.created_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn insert_action(&self, action: NewAction) -> Result<Action> {
        if self.campaign_row(action.campaign_id).is_none() {
            anyhow::bail!("campaign {} does not exist", action.campaign_id);
        }
        let row = Action {
            id: self.next_id(),
            campaign_id: action.campaign_id,
            kind: action.kind,
            title: action.title,
            url: action.url,
            reward_amount: action.reward_amount,
            max_executions: action.max_executions,
        };
        self.actions.write().insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_action(&self, id: ActionId) -> Result<Option<Action>> {
        Ok(self.actions.read().get(&id).cloned())
    }

    async fn insert_user(&self, user: NewUser) -> Result<User> {
        let mut users = self.users.write();
        if users
            .values()
            .any(|u| u.wallet_address == user.wallet_address)
        {
            anyhow::bail!("wallet {} already registered", user.wallet_address);
        }
        let row = User {
            id: self.next_id(),
            wallet_address: user.wallet_address,
            reputation_score: DEFAULT_REPUTATION,
            status: user.status,
            twitter_handle: user.twitter_handle,
            telegram_handle: user.telegram_handle,
            created_at: Utc::now(),
        };
        users.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.users.read().get(&id).cloned())
    }

    async fn get_user_by_wallet(&self, wallet: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .read()
            .values()
            .find(|u| u.wallet_address == wallet)
            .cloned())
    }

    async fn link_social(
        &self,
        user_id: UserId,
        twitter_handle: Option<String>,
        telegram_handle: Option<String>,
    ) -> Result<Option<User>> {
        let mut users = self.users.write();
        let Some(user) = users.get_mut(&user_id) else {
            return Ok(None);
        };
        if twitter_handle.is_some() {
            user.twitter_handle = twitter_handle;
        }
        if telegram_handle.is_some() {
            user.telegram_handle = telegram_handle;
        }
        Ok(Some(user.clone()))
    }

    async fn add_reputation(&self, event: ReputationEvent) -> Result<i64> {
        let mut events = self.reputation_events.lock();
        let mut users = self.users.write();
        let user = users
            .get_mut(&event.user_id)
            .ok_or_else(|| anyhow!("user {} not found", event.user_id))?;

        let duplicate = event.execution_id.is_some()
            && events.iter().any(|e| e.execution_id == event.execution_id);
        if !duplicate {
            user.reputation_score += event.delta;
            events.push(event);
        }
        Ok(user.reputation_score)
    }

    async fn reputation_deltas(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<(UserId, i64)>> {
        let events = self.reputation_events.lock();
        let mut totals: HashMap<UserId, i64> = HashMap::new();
        for event in events
            .iter()
            .filter(|e| e.recorded_at >= start && e.recorded_at <= end)
        {
            *totals.entry(event.user_id).or_default() += event.delta;
        }
        Ok(totals.into_iter().collect())
    }

    async fn top_users_by_reputation(&self, limit: usize) -> Result<Vec<User>> {
        let mut users: Vec<User> = self.users.read().values().cloned().collect();
        users.sort_by(|a, b| {
            b.reputation_score
                .cmp(&a.reputation_score)
                .then(a.created_at.cmp(&b.created_at))
        });
        users.truncate(limit);
        Ok(users)
    }

    async fn create_execution(&self, execution: NewExecution) -> Result<CreateExecution> {
        let mut table = self.executions.write();
        let key = (execution.action_id, execution.user_id);
        if let Some(existing) = table.by_pair.get(&key).and_then(|id| table.rows.get(id)) {
            return Ok(CreateExecution::Duplicate(existing.clone()));
        }

        let now = Utc::now();
        let row = Execution {
            id: self.next_id(),
            action_id: execution.action_id,
            campaign_id: execution.campaign_id,
            user_id: execution.user_id,
            status: ExecutionStatus::Pending,
            proof: execution.proof,
            reserved_amount: execution.reserved_amount,
            reservation_id: None,
            transaction_signature: None,
            retry_count: 0,
            next_attempt_at: None,
            hold_until: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            paid_at: None,
        };
        table.by_pair.insert(key, row.id);
        table.rows.insert(row.id, row.clone());
        Ok(CreateExecution::Created(row))
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<Execution>> {
        Ok(self.executions.read().rows.get(&id).cloned())
    }

    async fn transition_execution(
        &self,
        id: ExecutionId,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        update: ExecutionUpdate,
    ) -> Result<Option<Execution>> {
        let mut table = self.executions.write();
        let Some(row) = table.rows.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&row.status) {
            return Ok(None);
        }
        row.apply(to, update);
        Ok(Some(row.clone()))
    }

    async fn count_executions(
        &self,
        action_id: ActionId,
        statuses: &[ExecutionStatus],
    ) -> Result<u64> {
        Ok(self
            .executions
            .read()
            .rows
            .values()
            .filter(|e| e.action_id == action_id && statuses.contains(&e.status))
            .count() as u64)
    }

    async fn executions_by_status(
        &self,
        status: ExecutionStatus,
        limit: usize,
    ) -> Result<Vec<Execution>> {
        let mut rows: Vec<Execution> = self
            .executions
            .read()
            .rows
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.updated_at);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn execution_by_reservation(&self, id: ReservationId) -> Result<Option<Execution>> {
        Ok(self
            .executions
            .read()
            .rows
            .values()
            .find(|e| e.reservation_id == Some(id))
            .cloned())
    }

    async fn count_recent_executions(&self, user_id: UserId, since: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .executions
            .read()
            .rows
            .values()
            .filter(|e| e.user_id == user_id && e.created_at >= since)
            .count() as u64)
    }

    async fn pending_rewards(
        &self,
        user_id: UserId,
        campaign_id: Option<CampaignId>,
    ) -> Result<Vec<PendingReward>> {
        let rows: Vec<Execution> = self
            .executions
            .read()
            .rows
            .values()
            .filter(|e| {
                e.user_id == user_id
                    && ExecutionStatus::UNPAID.contains(&e.status)
                    && campaign_id.map_or(true, |c| c == e.campaign_id)
            })
            .cloned()
            .collect();

        let mut rewards = Vec::with_capacity(rows.len());
        for e in rows {
            let token_mint = self
                .campaign_row(e.campaign_id)
                .map(|c| c.lock().token_mint.clone())
                .unwrap_or_default();
            rewards.push(PendingReward {
                execution_id: e.id,
                campaign_id: e.campaign_id,
                action_id: e.action_id,
                status: e.status,
                amount: e.reserved_amount,
                token_mint,
                hold_until: e.hold_until,
            });
        }
        rewards.sort_by_key(|r| r.execution_id);
        Ok(rewards)
    }

    async fn create_prize_week(&self, week: NewPrizeWeek) -> Result<PrizeWeek> {
        let mut weeks = self.prize_weeks.write();
        if weeks.values().any(|w| w.week_number == week.week_number) {
            anyhow::bail!("prize week #{} already exists", week.week_number);
        }
        let row = PrizeWeek {
            id: self.next_id(),
            week_number: week.week_number,
            start_date: week.start_date,
            end_date: week.end_date,
            total_prize_pool: week.total_prize_pool,
            status: PrizeWeekStatus::Processing,
            winners: week.winners,
            created_at: Utc::now(),
        };
        weeks.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_prize_week(&self, id: PrizeWeekId) -> Result<Option<PrizeWeek>> {
        Ok(self.prize_weeks.read().get(&id).cloned())
    }

    async fn latest_prize_week(&self) -> Result<Option<PrizeWeek>> {
        Ok(self
            .prize_weeks
            .read()
            .values()
            .max_by_key(|w| w.end_date)
            .cloned())
    }

    async fn list_prize_weeks(&self, limit: usize) -> Result<Vec<PrizeWeek>> {
        let mut weeks: Vec<PrizeWeek> = self.prize_weeks.read().values().cloned().collect();
        weeks.sort_by(|a, b| b.end_date.cmp(&a.end_date));
        weeks.truncate(limit);
        Ok(weeks)
    }

    async fn update_prize_winner(
        &self,
        week_id: PrizeWeekId,
        rank: u32,
        status: WinnerStatus,
        transaction_signature: Option<String>,
        error_message: Option<String>,
    ) -> Result<()> {
        let mut weeks = self.prize_weeks.write();
        let week = weeks
            .get_mut(&week_id)
            .ok_or_else(|| anyhow!("prize week {} not found", week_id))?;
        let winner = week
            .winners
            .iter_mut()
            .find(|w| w.rank == rank)
            .ok_or_else(|| anyhow!("prize week {} has no rank {}", week_id, rank))?;
        winner.status = status;
        if transaction_signature.is_some() {
            winner.transaction_signature = transaction_signature;
        }
        winner.error_message = error_message;
        Ok(())
    }

    async fn claim_prize_winner(
        &self,
        week_id: PrizeWeekId,
        rank: u32,
        from: &[WinnerStatus],
        now: DateTime<Utc>,
    ) -> Result<Option<PrizeWinner>> {
        let mut weeks = self.prize_weeks.write();
        let week = weeks
            .get_mut(&week_id)
            .ok_or_else(|| anyhow!("prize week {} not found", week_id))?;
        let winner = week
            .winners
            .iter_mut()
            .find(|w| w.rank == rank)
            .ok_or_else(|| anyhow!("prize week {} has no rank {}", week_id, rank))?;
        if !from.contains(&winner.status) {
            return Ok(None);
        }
        winner.status = WinnerStatus::InFlight;
        winner.attempted_at = Some(now);
        winner.error_message = None;
        Ok(Some(winner.clone()))
    }

    async fn set_prize_week_status(&self, id: PrizeWeekId, status: PrizeWeekStatus) -> Result<()> {
        let mut weeks = self.prize_weeks.write();
        let week = weeks
            .get_mut(&id)
            .ok_or_else(|| anyhow!("prize week {} not found", id))?;
        week.status = status;
        Ok(())
    }
}
