//! Weekly prize distribution
//!
//! Weeks run Monday 00:00 UTC to Sunday 23:59:59.999 UTC. When a week has
//! ended, its reputation gains are ranked, the prize pool is split by rank,
//! and the winners list is stored before any payout is sent. Rankings and
//! amounts are never recomputed afterwards; retries only re-drive winners
//! that are not paid yet.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use tracing::{info, warn};

use crate::config::PrizeConfig;
use crate::error::{RewardError, Result};
use crate::payout::{PayoutOutcome, PayoutProcessor};
use crate::reputation::{split_pool, ReputationScorer};
use crate::store::Store;
use crate::types::{
    NewPrizeWeek, PrizeWeek, PrizeWeekId, PrizeWeekStatus, PrizeWinner, TokenAmount, WinnerStatus,
};

/// Recent weeks scanned for winners left in flight
const RECONCILE_WEEKS: usize = 8;

/// Start and end of the most recent week that has fully ended at `now`
pub fn last_completed_week(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let days_from_monday = now.weekday().num_days_from_monday() as i64;
    let monday = now.date_naive() - Duration::days(days_from_monday);
    let this_week_start = Utc.from_utc_datetime(&monday.and_time(NaiveTime::MIN));
    (
        this_week_start - Duration::days(7),
        this_week_start - Duration::milliseconds(1),
    )
}

/// Pool = funded active campaigns x creation fee x rewards percent
pub fn prize_pool(funded_campaigns: u64, config: &PrizeConfig) -> TokenAmount {
    config
        .creation_fee
        .checked_mul(funded_campaigns)
        .map(|fees| fees.share_bps(config.rewards_percent.saturating_mul(100)))
        .unwrap_or(TokenAmount::ZERO)
}

pub struct PrizeDistributor {
    store: Arc<dyn Store>,
    payouts: Arc<PayoutProcessor>,
    scorer: ReputationScorer,
    config: PrizeConfig,
    prize_mint: String,
}

impl PrizeDistributor {
    pub fn new(
        store: Arc<dyn Store>,
        payouts: Arc<PayoutProcessor>,
        config: PrizeConfig,
        prize_mint: String,
    ) -> Self {
        Self {
            scorer: ReputationScorer::new(config.points_per_paid_action),
            store,
            payouts,
            config,
            prize_mint,
        }
    }

    /// Close the last completed week if it has not been closed yet
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<Option<PrizeWeek>> {
        let (start, end) = last_completed_week(now);
        let latest = self.store.latest_prize_week().await?;

        let week_number = match &latest {
            Some(week) if week.end_date >= end => return Ok(None),
            Some(week) => week.week_number + 1,
            None => 1,
        };

        self.close_week(week_number, start, end).await.map(Some)
    }

    /// Rank the period, freeze the winners list, then pay it
    pub async fn close_week(
        &self,
        week_number: u32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<PrizeWeek> {
        let deltas = self.store.reputation_deltas(start, end).await?;
        let mut users = Vec::with_capacity(deltas.len());
        for (user_id, _) in &deltas {
            if let Some(user) = self.store.get_user(*user_id).await? {
                users.push(user);
            }
        }
        let ranked = self
            .scorer
            .rank(&deltas, &users, self.config.rank_shares_bps.len());

        let funded = self.store.count_funded_active_campaigns().await?;
        let pool = prize_pool(funded, &self.config);
        let amounts = split_pool(pool, &self.config.rank_shares_bps);

        let winners: Vec<PrizeWinner> = ranked
            .into_iter()
            .zip(amounts)
            .filter(|(_, amount)| !amount.is_zero())
            .map(|(ranked, prize_amount)| PrizeWinner {
                user_id: ranked.user_id,
                wallet_address: ranked.wallet_address,
                rank: ranked.rank,
                prize_amount,
                reputation_delta: ranked.reputation_delta,
                status: WinnerStatus::Pending,
                transaction_signature: None,
                error_message: None,
                attempted_at: None,
            })
            .collect();

        let week = self
            .store
            .create_prize_week(NewPrizeWeek {
                week_number,
                start_date: start,
                end_date: end,
                total_prize_pool: pool,
                winners,
            })
            .await?;
        info!(
            week = week.id,
            week_number,
            pool = %pool,
            winners = week.winners.len(),
            "Prize week closed"
        );

        self.pay_week(week.id).await
    }

    /// Re-drive every winner of a week that is not paid yet
    pub async fn retry_week(&self, week_id: PrizeWeekId) -> Result<PrizeWeek> {
        let week = self.load(week_id).await?;
        if week.status == PrizeWeekStatus::Completed {
            return Ok(week);
        }
        self.store
            .set_prize_week_status(week_id, PrizeWeekStatus::Processing)
            .await?;
        info!(week = week_id, "Retrying prize week");
        self.pay_week(week_id).await
    }

    /// Re-drive a single winner, leaving the others untouched
    pub async fn retry_winner(&self, week_id: PrizeWeekId, rank: u32) -> Result<PrizeWeek> {
        let week = self.load(week_id).await?;
        let winner = week
            .winners
            .iter()
            .find(|w| w.rank == rank)
            .ok_or_else(|| RewardError::NotFound(format!("rank {} in prize week {}", rank, week_id)))?;

        if winner.status != WinnerStatus::Paid {
            info!(week = week_id, rank, "Retrying prize winner");
            self.payouts
                .pay_prize_winner(week_id, winner, &self.prize_mint)
                .await?;
        }
        self.finalize(week_id).await
    }

    /// Settle winners left `in_flight` by an interrupted payer, then
    /// re-finalize their weeks. Returns the number of winners settled.
    pub async fn reconcile_in_flight(&self, now: DateTime<Utc>) -> Result<usize> {
        let weeks = self.store.list_prize_weeks(RECONCILE_WEEKS).await?;
        let mut settled = 0;
        for week in weeks {
            let mut touched = false;
            for winner in week.winners.iter().filter(|w| w.status == WinnerStatus::InFlight) {
                if self
                    .payouts
                    .reconcile_prize_winner(week.id, winner, now)
                    .await?
                {
                    settled += 1;
                    touched = true;
                }
            }
            if touched {
                self.finalize(week.id).await?;
            }
        }
        Ok(settled)
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<PrizeWeek>> {
        Ok(self.store.list_prize_weeks(limit).await?)
    }

    async fn pay_week(&self, week_id: PrizeWeekId) -> Result<PrizeWeek> {
        let week = self.load(week_id).await?;

        // Sequential: one hot wallet, ordered by rank
        for winner in week.winners.iter().filter(|w| w.status != WinnerStatus::Paid) {
            match self
                .payouts
                .pay_prize_winner(week_id, winner, &self.prize_mint)
                .await?
            {
                PayoutOutcome::Paid(_) => {}
                PayoutOutcome::Retryable(reason) | PayoutOutcome::Fatal(reason) => {
                    warn!(week = week_id, rank = winner.rank, "Winner left unpaid: {}", reason);
                }
            }
        }

        self.finalize(week_id).await
    }

    /// `completed` when every winner is paid, `processing` while a transfer
    /// is in flight, otherwise `failed`
    async fn finalize(&self, week_id: PrizeWeekId) -> Result<PrizeWeek> {
        let mut week = self.load(week_id).await?;
        let status = if week.winners.iter().all(|w| w.status == WinnerStatus::Paid) {
            PrizeWeekStatus::Completed
        } else if week.winners.iter().any(|w| w.status == WinnerStatus::InFlight) {
            PrizeWeekStatus::Processing
        } else {
            PrizeWeekStatus::Failed
        };
        if week.status != status {
            self.store.set_prize_week_status(week_id, status).await?;
            week.status = status;
        }
        info!(week = week_id, status = ?status, "Prize week finalized");
        Ok(week)
    }

    async fn load(&self, week_id: PrizeWeekId) -> Result<PrizeWeek> {
        self.store
            .get_prize_week(week_id)
            .await?
            .ok_or_else(|| RewardError::NotFound(format!("prize week {}", week_id)))
    }
}
