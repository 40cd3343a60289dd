//! Periodic sweeps
//!
//! Each sweep is an idempotent pass over a bounded batch of rows, run on its
//! own interval by `tokio::spawn`. A pass that fails is logged and the next
//! tick tries again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SweepConfig;
use crate::error::Result;
use crate::ledger::BudgetLedger;
use crate::payout::{PayoutProcessor, RetrySweepReport};
use crate::prizes::PrizeDistributor;
use crate::store::Store;
use crate::types::ExecutionStatus;
use crate::verification::VerificationEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    /// `waiting` executions whose holding window ended
    Holding,
    /// `ready` executions whose backoff elapsed, and stale in-flight transfers
    Retry,
    /// Outstanding reservations nothing will settle
    Cleanup,
    /// Weekly prize closure, and stale in-flight prize transfers
    Prize,
}

impl SweepKind {
    pub const ALL: [SweepKind; 4] = [
        SweepKind::Holding,
        SweepKind::Retry,
        SweepKind::Cleanup,
        SweepKind::Prize,
    ];
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub released: usize,
    pub committed: usize,
}

pub struct Sweeps {
    store: Arc<dyn Store>,
    ledger: BudgetLedger,
    verification: Arc<VerificationEngine>,
    payouts: Arc<PayoutProcessor>,
    prizes: Arc<PrizeDistributor>,
    config: SweepConfig,
}

impl Sweeps {
    pub fn new(
        store: Arc<dyn Store>,
        verification: Arc<VerificationEngine>,
        payouts: Arc<PayoutProcessor>,
        prizes: Arc<PrizeDistributor>,
        config: SweepConfig,
    ) -> Self {
        Self {
            ledger: BudgetLedger::new(store.clone()),
            store,
            verification,
            payouts,
            prizes,
            config,
        }
    }

    fn interval(&self, kind: SweepKind) -> Duration {
        let secs = match kind {
            SweepKind::Holding => self.config.holding_interval_secs,
            SweepKind::Retry => self.config.retry_interval_secs,
            SweepKind::Cleanup => self.config.cleanup_interval_secs,
            SweepKind::Prize => self.config.prize_interval_secs,
        };
        Duration::from_secs(secs.max(1))
    }

    /// Start one background loop per sweep
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        SweepKind::ALL
            .into_iter()
            .map(|kind| {
                let sweeps = Arc::clone(self);
                let every = self.interval(kind);
                info!("Background {:?} sweep started (every {} seconds)", kind, every.as_secs());
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(every);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        interval.tick().await;
                        if let Err(e) = sweeps.run_once(kind, Utc::now()).await {
                            error!("{:?} sweep failed: {}", kind, e);
                        }
                    }
                })
            })
            .collect()
    }

    pub async fn run_once(&self, kind: SweepKind, now: DateTime<Utc>) -> Result<()> {
        let batch = self.config.batch_size;
        match kind {
            SweepKind::Holding => {
                self.verification.recheck_waiting(now, batch).await?;
            }
            SweepKind::Retry => {
                let report = self.payouts.retry_due(now, batch).await?;
                if report != RetrySweepReport::default() {
                    info!(
                        paid = report.paid,
                        retrying = report.retrying,
                        failed = report.failed,
                        reconciled = report.reconciled,
                        "Payout retry sweep complete"
                    );
                }
            }
            SweepKind::Cleanup => {
                self.cleanup_reservations(now).await?;
            }
            SweepKind::Prize => {
                let settled = self.prizes.reconcile_in_flight(now).await?;
                if settled > 0 {
                    info!(settled, "Reconciled in-flight prize transfers");
                }
                if let Some(week) = self.prizes.run_due(now).await? {
                    info!(
                        week = week.id,
                        week_number = week.week_number,
                        status = ?week.status,
                        "Weekly prizes processed"
                    );
                }
            }
        }
        Ok(())
    }

    /// Settle reservations older than the grace period whose execution will
    /// never settle them: released when the execution ended without payment
    /// or never recorded the reservation, committed when it was paid.
    pub async fn cleanup_reservations(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let cutoff = now - chrono::Duration::seconds(self.config.reservation_grace_secs as i64);
        let stale = self
            .store
            .outstanding_reservations_before(cutoff, self.config.batch_size)
            .await?;

        let mut report = CleanupReport::default();
        for reservation in stale {
            let owner = self.store.execution_by_reservation(reservation.id).await?;
            let status = owner.as_ref().map(|e| e.status);
            match status {
                None
                | Some(ExecutionStatus::Pending)
                | Some(ExecutionStatus::Rejected)
                | Some(ExecutionStatus::Failed) => {
                    let amount = self.ledger.release(reservation.id).await?;
                    warn!(
                        reservation_id = %reservation.id,
                        campaign_id = reservation.campaign_id,
                        amount = %amount,
                        "Released orphaned reservation"
                    );
                    report.released += 1;
                }
                Some(ExecutionStatus::Paid) => {
                    self.ledger.commit(reservation.id).await?;
                    report.committed += 1;
                }
                Some(other) => {
                    debug!(reservation_id = %reservation.id, status = %other, "Reservation still in use");
                }
            }
        }

        if report != CleanupReport::default() {
            info!(
                released = report.released,
                committed = report.committed,
                "Reservation cleanup complete"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::reputation::ReputationScorer;
    use crate::store::{CreateExecution, MemoryStore, NewAction, NewCampaign, NewUser};
    use crate::testing::{FakeChain, FakeSocial};
    use crate::types::{
        ActionKind, CampaignStatus, ExecutionUpdate, NewExecution, ReservationState, Requirements,
        TokenAmount, UserStatus,
    };

    fn sweeps(store: Arc<MemoryStore>) -> Sweeps {
        let config = Config::default();
        let chain = Arc::new(FakeChain::new());
        let verification = Arc::new(VerificationEngine::new(
            store.clone(),
            chain.clone(),
            Arc::new(FakeSocial::new()),
            &config.verification,
            None,
        ));
        let payouts = Arc::new(PayoutProcessor::new(
            store.clone(),
            chain,
            ReputationScorer::new(config.prizes.points_per_paid_action),
            config.payout.clone(),
            Duration::from_secs(5),
        ));
        let prizes = Arc::new(PrizeDistributor::new(
            store.clone(),
            payouts.clone(),
            config.prizes.clone(),
            config.ledger.prize_mint.clone(),
        ));
        Sweeps::new(store, verification, payouts, prizes, config.sweeps)
    }

    #[tokio::test]
    async fn test_orphaned_reservation_released_after_grace() {
        let store = Arc::new(MemoryStore::new());
        let campaign = store
            .insert_campaign(NewCampaign {
                title: "Launch".to_string(),
                token_mint: "mint".to_string(),
                total_budget: TokenAmount::from_tokens(50),
                status: CampaignStatus::Active,
                creation_fee_paid: true,
                requirements: Requirements::default(),
                holder_rule: None,
            })
            .await
            .unwrap();
        let ledger = BudgetLedger::new(store.clone());
        ledger
            .reserve(campaign.id, TokenAmount::from_tokens(20))
            .await
            .unwrap();

        let sweeps = sweeps(store.clone());

        // Within the grace period nothing happens
        let report = sweeps.cleanup_reservations(Utc::now()).await.unwrap();
        assert_eq!(report, CleanupReport::default());

        let later = Utc::now() + chrono::Duration::hours(2);
        let report = sweeps.cleanup_reservations(later).await.unwrap();
        assert_eq!(report.released, 1);
        assert_eq!(
            ledger.remaining(campaign.id).await.unwrap(),
            TokenAmount::from_tokens(50)
        );
    }

    #[tokio::test]
    async fn test_reservation_of_paid_execution_is_committed() {
        let store = Arc::new(MemoryStore::new());
        let campaign = store
            .insert_campaign(NewCampaign {
                title: "Launch".to_string(),
                token_mint: "mint".to_string(),
                total_budget: TokenAmount::from_tokens(50),
                status: CampaignStatus::Active,
                creation_fee_paid: true,
                requirements: Requirements::default(),
                holder_rule: None,
            })
            .await
            .unwrap();
        let action = store
            .insert_action(NewAction {
                campaign_id: campaign.id,
                kind: ActionKind::Website,
                title: "Visit".to_string(),
                url: "https://example.com".to_string(),
                reward_amount: TokenAmount::from_tokens(20),
                max_executions: None,
            })
            .await
            .unwrap();
        let user = store
            .insert_user(NewUser {
                wallet_address: "4Nd1mBQtrMJVYVfKf2PJy9NZUZdTAsp7D4xWLs4gDB4T".to_string(),
                status: UserStatus::Active,
                twitter_handle: None,
                telegram_handle: None,
            })
            .await
            .unwrap();
        let CreateExecution::Created(execution) = store
            .create_execution(NewExecution {
                action_id: action.id,
                campaign_id: campaign.id,
                user_id: user.id,
                proof: None,
                reserved_amount: action.reward_amount,
            })
            .await
            .unwrap()
        else {
            panic!("execution already existed");
        };
        let ledger = BudgetLedger::new(store.clone());
        let reservation = ledger
            .reserve(campaign.id, action.reward_amount)
            .await
            .unwrap();

        // Paid, but the payer stopped before committing
        store
            .transition_execution(
                execution.id,
                &[ExecutionStatus::Pending],
                ExecutionStatus::Paid,
                ExecutionUpdate {
                    reservation_id: Some(Some(reservation.id)),
                    transaction_signature: Some("sig-1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        let sweeps = sweeps(store.clone());
        let later = Utc::now() + chrono::Duration::hours(2);
        let report = sweeps.cleanup_reservations(later).await.unwrap();
        assert_eq!(
            report,
            CleanupReport {
                released: 0,
                committed: 1,
            }
        );

        let settled = store.get_reservation(reservation.id).await.unwrap().unwrap();
        assert_eq!(settled.state, ReservationState::Committed);
        assert_eq!(
            ledger.remaining(campaign.id).await.unwrap(),
            TokenAmount::from_tokens(30)
        );

        // Nothing left outstanding on the next pass
        let report = sweeps.cleanup_reservations(later).await.unwrap();
        assert_eq!(report, CleanupReport::default());
    }
}
