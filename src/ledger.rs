//! Budget ledger
//!
//! Owns the remaining budget of every campaign. Callers never write the
//! budget directly; they reserve, then commit or release. The decrement is
//! delegated to the store as one compare-and-set step.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{RewardError, Result};
use crate::store::{CommitOutcome, ReleaseOutcome, ReserveOutcome, Store};
use crate::types::{CampaignId, CampaignStatus, Reservation, ReservationId, TokenAmount};

#[derive(Clone)]
pub struct BudgetLedger {
    store: Arc<dyn Store>,
}

impl BudgetLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Hold `amount` of the campaign's budget.
    ///
    /// Fails with `InsufficientBudget` without mutation when the remaining
    /// budget is too small, and with `CampaignExhausted` when it is already zero.
    pub async fn reserve(&self, campaign_id: CampaignId, amount: TokenAmount) -> Result<Reservation> {
        if amount.is_zero() {
            return Err(RewardError::Validation(
                "reservation amount must be positive".to_string(),
            ));
        }

        let reservation_id = Uuid::new_v4();
        match self
            .store
            .reserve_budget(campaign_id, amount, reservation_id)
            .await?
        {
            ReserveOutcome::Reserved {
                reservation,
                remaining,
            } => {
                debug!(
                    campaign_id,
                    reservation_id = %reservation.id,
                    amount = %amount,
                    remaining = %remaining,
                    "Reserved budget"
                );
                Ok(reservation)
            }
            ReserveOutcome::Insufficient { remaining } => Err(RewardError::InsufficientBudget {
                requested: amount,
                remaining,
            }),
            ReserveOutcome::Exhausted => Err(RewardError::CampaignExhausted(campaign_id)),
            ReserveOutcome::NotActive(status) => Err(RewardError::Validation(format!(
                "campaign {} is {}",
                campaign_id,
                status_label(status)
            ))),
            ReserveOutcome::CampaignMissing => {
                Err(RewardError::NotFound(format!("campaign {}", campaign_id)))
            }
        }
    }

    /// Finalize a reservation. Committing twice is a no-op.
    pub async fn commit(&self, reservation_id: ReservationId) -> Result<()> {
        match self.store.commit_reservation(reservation_id).await? {
            CommitOutcome::Committed => {
                debug!(%reservation_id, "Committed reservation");
                Ok(())
            }
            CommitOutcome::AlreadyCommitted => Ok(()),
            CommitOutcome::Released => Err(RewardError::Validation(format!(
                "reservation {} was already released",
                reservation_id
            ))),
            CommitOutcome::Missing => Err(RewardError::NotFound(format!(
                "reservation {}",
                reservation_id
            ))),
        }
    }

    /// Return a reservation's amount to its campaign. Idempotent.
    ///
    /// Returns the amount actually restored by this call.
    pub async fn release(&self, reservation_id: ReservationId) -> Result<TokenAmount> {
        match self.store.release_reservation(reservation_id).await? {
            ReleaseOutcome::Released { amount } => {
                debug!(%reservation_id, amount = %amount, "Released reservation");
                Ok(amount)
            }
            ReleaseOutcome::AlreadyReleased => Ok(TokenAmount::ZERO),
            ReleaseOutcome::Committed => {
                warn!(%reservation_id, "Refusing to release a committed reservation");
                Err(RewardError::Validation(format!(
                    "reservation {} is already committed",
                    reservation_id
                )))
            }
            ReleaseOutcome::Missing => Err(RewardError::NotFound(format!(
                "reservation {}",
                reservation_id
            ))),
        }
    }

    pub async fn remaining(&self, campaign_id: CampaignId) -> Result<TokenAmount> {
        self.store
            .get_campaign(campaign_id)
            .await?
            .map(|c| c.remaining_budget)
            .ok_or_else(|| RewardError::NotFound(format!("campaign {}", campaign_id)))
    }
}

fn status_label(status: CampaignStatus) -> &'static str {
    match status {
        CampaignStatus::Draft => "not launched yet",
        CampaignStatus::Active => "active",
        CampaignStatus::Paused => "paused",
        CampaignStatus::Exhausted => "exhausted",
        CampaignStatus::Closed => "closed",
    }
}
