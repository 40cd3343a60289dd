//! Payout processor
//!
//! Drives a verified execution to an on-chain transfer exactly once.
//!
//! An execution is moved `ready|verified -> holding` before the transfer is
//! sent; only the caller that wins that transition sends. Every transfer
//! carries a stable reference derived from its idempotency key, so an
//! ambiguous failure is resolved by looking the transfer up before resending.
//! Prize winners are made exclusive the same way, by a `pending|failed ->
//! in_flight` claim on the winner.
//!
//! Transient failures go back to `ready` with exponential backoff until
//! `max_retries`; permanent failures release the reservation and end `failed`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::auth;
use crate::config::PayoutConfig;
use crate::error::{RewardError, Result};
use crate::ledger::BudgetLedger;
use crate::reputation::ReputationScorer;
use crate::store::Store;
use crate::types::{
    Execution, ExecutionId, ExecutionStatus, ExecutionUpdate, PrizeWeekId, PrizeWinner,
    TokenAmount, WinnerStatus,
};

// ============================================================================
// TRANSFER COLLABORATOR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Idempotency reference recorded with the transfer
    pub reference: String,
    pub destination: String,
    pub mint: String,
    pub amount: TokenAmount,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// Network, RPC timeout or node congestion
    #[error("{0}")]
    Transient(String),
    /// Invalid destination, insufficient platform funds and the like
    #[error("{0}")]
    Permanent(String),
}

#[async_trait]
pub trait TransferSender: Send + Sync {
    /// Send a transfer and return its signature
    async fn send_transfer(&self, request: &TransferRequest) -> std::result::Result<String, TransferError>;

    /// Signature of a confirmed transfer carrying `reference`, if any
    async fn lookup_transfer(&self, reference: &str) -> std::result::Result<Option<String>, TransferError>;
}

// ============================================================================
// OUTCOMES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutOutcome {
    Paid(String),
    Retryable(String),
    Fatal(String),
}

/// Per-request outcome as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClaimOutcome {
    Success { signature: String },
    Pending { reason: String },
    Rejected { code: String, reason: String },
}

impl From<PayoutOutcome> for ClaimOutcome {
    fn from(outcome: PayoutOutcome) -> Self {
        match outcome {
            PayoutOutcome::Paid(signature) => ClaimOutcome::Success { signature },
            PayoutOutcome::Retryable(reason) => ClaimOutcome::Pending { reason },
            PayoutOutcome::Fatal(reason) => ClaimOutcome::Rejected {
                code: "fatal_payout".to_string(),
                reason,
            },
        }
    }
}

impl From<&RewardError> for ClaimOutcome {
    fn from(err: &RewardError) -> Self {
        if err.is_retryable() {
            ClaimOutcome::Pending {
                reason: err.to_string(),
            }
        } else {
            ClaimOutcome::Rejected {
                code: err.code().to_string(),
                reason: err.to_string(),
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimItem {
    pub execution_id: ExecutionId,
    #[serde(flatten)]
    pub outcome: ClaimOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySweepReport {
    pub paid: usize,
    pub retrying: usize,
    pub failed: usize,
    pub reconciled: usize,
}

// ============================================================================
// PROCESSOR
// ============================================================================

pub struct PayoutProcessor {
    store: Arc<dyn Store>,
    ledger: BudgetLedger,
    transfers: Arc<dyn TransferSender>,
    scorer: ReputationScorer,
    config: PayoutConfig,
    call_timeout: Duration,
}

impl PayoutProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        transfers: Arc<dyn TransferSender>,
        scorer: ReputationScorer,
        config: PayoutConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger: BudgetLedger::new(store.clone()),
            store,
            transfers,
            scorer,
            config,
            call_timeout,
        }
    }

    /// Pay one execution. Calling it again after success returns the
    /// recorded signature without sending anything.
    pub async fn payout(&self, execution_id: ExecutionId) -> Result<PayoutOutcome> {
        let execution = self.load(execution_id).await?;

        match execution.status {
            ExecutionStatus::Paid => return Ok(paid_outcome(&execution)),
            ExecutionStatus::Failed => {
                return Ok(PayoutOutcome::Fatal(
                    execution
                        .error_message
                        .unwrap_or_else(|| "payout failed".to_string()),
                ))
            }
            ExecutionStatus::Holding => {
                return Ok(PayoutOutcome::Retryable(
                    "payout already in progress".to_string(),
                ))
            }
            ExecutionStatus::Verified | ExecutionStatus::Ready => {}
            other => {
                return Err(RewardError::Validation(format!(
                    "execution {} is {} and cannot be paid",
                    execution_id, other
                )))
            }
        }

        let from = execution.status;
        let claimed = self
            .store
            .transition_execution(
                execution_id,
                &[ExecutionStatus::Verified, ExecutionStatus::Ready],
                ExecutionStatus::Holding,
                ExecutionUpdate::default(),
            )
            .await?;
        let Some(execution) = claimed else {
            // Someone else got there first
            let current = self.load(execution_id).await?;
            return Ok(match current.status {
                ExecutionStatus::Paid => paid_outcome(&current),
                ExecutionStatus::Failed => PayoutOutcome::Fatal(
                    current
                        .error_message
                        .unwrap_or_else(|| "payout failed".to_string()),
                ),
                _ => PayoutOutcome::Retryable("payout already in progress".to_string()),
            });
        };
        info!(
            execution_id,
            from = %from,
            to = %ExecutionStatus::Holding,
            "Sending payout"
        );

        match self.send(&execution).await {
            Ok(signature) => self.complete(execution, signature).await,
            Err(TransferError::Transient(reason)) => self.retry_later(execution, reason).await,
            Err(TransferError::Permanent(reason)) => self.fail(execution, reason).await,
        }
    }

    /// Pay several executions owned by `wallet`. Each item stands alone.
    pub async fn claim(&self, wallet: &str, execution_ids: &[ExecutionId]) -> Result<Vec<ClaimItem>> {
        if !auth::is_valid_wallet_address(wallet) {
            return Err(RewardError::Validation(format!(
                "invalid wallet address '{}'",
                wallet
            )));
        }
        let user = self
            .store
            .get_user_by_wallet(wallet)
            .await?
            .ok_or_else(|| RewardError::NotFound(format!("user with wallet {}", wallet)))?;

        // Items are independent; the holding transition keeps each one exclusive
        let items = execution_ids.iter().map(|&execution_id| {
            let user_id = user.id;
            async move {
                let result = match self.store.get_execution(execution_id).await {
                    Ok(Some(e)) if e.user_id == user_id => self.payout(execution_id).await,
                    Ok(_) => Err(RewardError::NotFound(format!("execution {}", execution_id))),
                    Err(e) => Err(RewardError::Storage(e)),
                };
                let outcome = match result {
                    Ok(outcome) => ClaimOutcome::from(outcome),
                    Err(e) => {
                        warn!(execution_id, "Claim item failed: {}", e);
                        ClaimOutcome::from(&e)
                    }
                };
                ClaimItem {
                    execution_id,
                    outcome,
                }
            }
        });
        Ok(join_all(items).await)
    }

    /// Admin re-drive of a failed execution: reserve again, reset retries, pay
    pub async fn admin_retry(&self, execution_id: ExecutionId) -> Result<PayoutOutcome> {
        let execution = self.load(execution_id).await?;
        match execution.status {
            ExecutionStatus::Failed => {}
            ExecutionStatus::Verified | ExecutionStatus::Ready | ExecutionStatus::Paid => {
                return self.payout(execution_id).await
            }
            other => {
                return Err(RewardError::Validation(format!(
                    "execution {} is {} and cannot be retried",
                    execution_id, other
                )))
            }
        }

        let reservation = self
            .ledger
            .reserve(execution.campaign_id, execution.reserved_amount)
            .await?;
        let reset = self
            .store
            .transition_execution(
                execution_id,
                &[ExecutionStatus::Failed],
                ExecutionStatus::Ready,
                ExecutionUpdate {
                    reservation_id: Some(Some(reservation.id)),
                    retry_count: Some(0),
                    next_attempt_at: Some(None),
                    error_message: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        if reset.is_none() {
            self.ledger.release(reservation.id).await?;
            return Ok(PayoutOutcome::Retryable(
                "execution changed while retrying".to_string(),
            ));
        }
        info!(
            execution_id,
            reservation_id = %reservation.id,
            from = %ExecutionStatus::Failed,
            to = %ExecutionStatus::Ready,
            "Admin retry"
        );
        self.payout(execution_id).await
    }

    /// Re-drive `ready` executions whose backoff has elapsed
    pub async fn retry_due(&self, now: DateTime<Utc>, limit: usize) -> Result<RetrySweepReport> {
        let mut report = RetrySweepReport::default();
        let ready = self
            .store
            .executions_by_status(ExecutionStatus::Ready, limit)
            .await?;

        for execution in ready {
            let due = matches!(execution.next_attempt_at, Some(at) if at <= now);
            if !due {
                continue;
            }
            match self.payout(execution.id).await {
                Ok(PayoutOutcome::Paid(_)) => report.paid += 1,
                Ok(PayoutOutcome::Retryable(_)) => report.retrying += 1,
                Ok(PayoutOutcome::Fatal(_)) => report.failed += 1,
                Err(e) => {
                    warn!(execution_id = execution.id, "Retry skipped: {}", e);
                    report.retrying += 1;
                }
            }
        }

        report.reconciled = self.reconcile_in_flight(now, limit).await?;
        Ok(report)
    }

    /// Resolve executions stuck in `holding` past the grace period.
    ///
    /// A transfer found by reference completes the payout; otherwise the
    /// execution goes back to `ready` for an immediate retry.
    pub async fn reconcile_in_flight(&self, now: DateTime<Utc>, limit: usize) -> Result<usize> {
        let grace = chrono::Duration::seconds(self.config.in_flight_grace_secs as i64);
        let holding = self
            .store
            .executions_by_status(ExecutionStatus::Holding, limit)
            .await?;

        let mut reconciled = 0;
        for execution in holding {
            if execution.updated_at + grace > now {
                continue;
            }
            let reference = auth::payout_reference(&execution.id.to_string());
            match self.lookup(&reference).await {
                Ok(Some(signature)) => {
                    info!(execution_id = execution.id, "Found in-flight transfer on chain");
                    self.complete(execution, signature).await?;
                }
                Ok(None) => {
                    let requeued = self
                        .store
                        .transition_execution(
                            execution.id,
                            &[ExecutionStatus::Holding],
                            ExecutionStatus::Ready,
                            ExecutionUpdate {
                                retry_count: Some(execution.retry_count + 1),
                                next_attempt_at: Some(Some(now)),
                                error_message: Some(Some("transfer not confirmed".to_string())),
                                ..Default::default()
                            },
                        )
                        .await?;
                    if requeued.is_some() {
                        warn!(
                            execution_id = execution.id,
                            from = %ExecutionStatus::Holding,
                            to = %ExecutionStatus::Ready,
                            "In-flight transfer not found, requeued"
                        );
                    }
                }
                Err(e) => {
                    warn!(execution_id = execution.id, "Transfer lookup failed: {}", e);
                    continue;
                }
            }
            reconciled += 1;
        }
        Ok(reconciled)
    }

    /// Pay one prize winner. Winners already paid are returned unchanged.
    ///
    /// The winner is moved `pending|failed -> in_flight` first; a caller that
    /// loses that transition sends nothing.
    pub async fn pay_prize_winner(
        &self,
        week_id: PrizeWeekId,
        winner: &PrizeWinner,
        mint: &str,
    ) -> Result<PayoutOutcome> {
        if winner.status == WinnerStatus::Paid {
            if let Some(signature) = &winner.transaction_signature {
                return Ok(PayoutOutcome::Paid(signature.clone()));
            }
        }

        let claimed = self
            .store
            .claim_prize_winner(
                week_id,
                winner.rank,
                &[WinnerStatus::Pending, WinnerStatus::Failed],
                Utc::now(),
            )
            .await?;
        let Some(winner) = claimed else {
            let current = self.load_winner(week_id, winner.rank).await?;
            return Ok(match (current.status, current.transaction_signature) {
                (WinnerStatus::Paid, Some(signature)) => PayoutOutcome::Paid(signature),
                _ => PayoutOutcome::Retryable("prize payout already in progress".to_string()),
            });
        };
        info!(
            week = week_id,
            rank = winner.rank,
            to = ?WinnerStatus::InFlight,
            "Sending prize payout"
        );

        let reference = auth::payout_reference(&winner.payout_key(week_id));
        let landed = match self.lookup(&reference).await {
            Ok(found) => found,
            Err(TransferError::Transient(reason)) => {
                return self
                    .record_winner_failure(week_id, &winner, PayoutOutcome::Retryable(reason))
                    .await
            }
            Err(TransferError::Permanent(reason)) => {
                return self
                    .record_winner_failure(week_id, &winner, PayoutOutcome::Fatal(reason))
                    .await
            }
        };

        let result = match landed {
            Some(signature) => Ok(signature),
            None => {
                let request = TransferRequest {
                    reference,
                    destination: winner.wallet_address.clone(),
                    mint: mint.to_string(),
                    amount: winner.prize_amount,
                };
                self.send_request(&request).await
            }
        };

        match result {
            Ok(signature) => self.record_winner_paid(week_id, &winner, signature).await,
            Err(TransferError::Transient(reason)) => {
                self.record_winner_failure(week_id, &winner, PayoutOutcome::Retryable(reason))
                    .await
            }
            Err(TransferError::Permanent(reason)) => {
                self.record_winner_failure(week_id, &winner, PayoutOutcome::Fatal(reason))
                    .await
            }
        }
    }

    /// Resolve a winner left `in_flight` past the grace period by looking its
    /// transfer up. Returns whether the winner was settled.
    pub async fn reconcile_prize_winner(
        &self,
        week_id: PrizeWeekId,
        winner: &PrizeWinner,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if winner.status != WinnerStatus::InFlight {
            return Ok(false);
        }
        let grace = chrono::Duration::seconds(self.config.in_flight_grace_secs as i64);
        if matches!(winner.attempted_at, Some(at) if at + grace > now) {
            return Ok(false);
        }

        let reference = auth::payout_reference(&winner.payout_key(week_id));
        match self.lookup(&reference).await {
            Ok(Some(signature)) => {
                info!(week = week_id, rank = winner.rank, "Found in-flight prize transfer on chain");
                self.record_winner_paid(week_id, winner, signature).await?;
            }
            Ok(None) => {
                self.record_winner_failure(
                    week_id,
                    winner,
                    PayoutOutcome::Retryable("transfer not confirmed".to_string()),
                )
                .await?;
            }
            Err(e) => {
                warn!(week = week_id, rank = winner.rank, "Prize transfer lookup failed: {}", e);
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn record_winner_paid(
        &self,
        week_id: PrizeWeekId,
        winner: &PrizeWinner,
        signature: String,
    ) -> Result<PayoutOutcome> {
        self.store
            .update_prize_winner(
                week_id,
                winner.rank,
                WinnerStatus::Paid,
                Some(signature.clone()),
                None,
            )
            .await?;
        info!(week = week_id, rank = winner.rank, signature = %signature, "Prize paid");
        Ok(PayoutOutcome::Paid(signature))
    }

    async fn record_winner_failure(
        &self,
        week_id: PrizeWeekId,
        winner: &PrizeWinner,
        outcome: PayoutOutcome,
    ) -> Result<PayoutOutcome> {
        let reason = match &outcome {
            PayoutOutcome::Retryable(r) | PayoutOutcome::Fatal(r) => r.clone(),
            PayoutOutcome::Paid(_) => return Ok(outcome),
        };
        error!(week = week_id, rank = winner.rank, "Prize payout failed: {}", reason);
        self.store
            .update_prize_winner(week_id, winner.rank, WinnerStatus::Failed, None, Some(reason))
            .await?;
        Ok(outcome)
    }

    async fn load_winner(&self, week_id: PrizeWeekId, rank: u32) -> Result<PrizeWinner> {
        self.store
            .get_prize_week(week_id)
            .await?
            .and_then(|week| week.winners.into_iter().find(|w| w.rank == rank))
            .ok_or_else(|| RewardError::NotFound(format!("rank {} in prize week {}", rank, week_id)))
    }

    async fn load(&self, execution_id: ExecutionId) -> Result<Execution> {
        self.store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| RewardError::NotFound(format!("execution {}", execution_id)))
    }

    async fn send(&self, execution: &Execution) -> std::result::Result<String, TransferError> {
        let reference = auth::payout_reference(&execution.id.to_string());

        // Any earlier attempt, including one before an admin retry, may have
        // landed despite reporting failure
        if let Some(signature) = self.lookup(&reference).await? {
            info!(execution_id = execution.id, "Transfer already on chain");
            return Ok(signature);
        }
        // Requeued with the transfer state unknown; now known not to exist
        if execution.retry_count >= self.config.max_retries {
            return Err(TransferError::Permanent(format!(
                "gave up after {} attempts",
                execution.retry_count
            )));
        }

        let user = self
            .store
            .get_user(execution.user_id)
            .await
            .map_err(|e| TransferError::Transient(format!("user lookup: {:#}", e)))?
            .ok_or_else(|| TransferError::Permanent(format!("user {} not found", execution.user_id)))?;
        let campaign = self
            .store
            .get_campaign(execution.campaign_id)
            .await
            .map_err(|e| TransferError::Transient(format!("campaign lookup: {:#}", e)))?
            .ok_or_else(|| {
                TransferError::Permanent(format!("campaign {} not found", execution.campaign_id))
            })?;

        let request = TransferRequest {
            reference,
            destination: user.wallet_address,
            mint: campaign.token_mint,
            amount: execution.reserved_amount,
        };
        self.send_request(&request).await
    }

    async fn send_request(&self, request: &TransferRequest) -> std::result::Result<String, TransferError> {
        match tokio::time::timeout(self.call_timeout, self.transfers.send_transfer(request)).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Transient("transfer timed out".to_string())),
        }
    }

    async fn lookup(&self, reference: &str) -> std::result::Result<Option<String>, TransferError> {
        match tokio::time::timeout(self.call_timeout, self.transfers.lookup_transfer(reference)).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Transient("transfer lookup timed out".to_string())),
        }
    }

    async fn complete(&self, execution: Execution, signature: String) -> Result<PayoutOutcome> {
        let now = Utc::now();
        let paid = self
            .store
            .transition_execution(
                execution.id,
                &[ExecutionStatus::Holding],
                ExecutionStatus::Paid,
                ExecutionUpdate {
                    transaction_signature: Some(signature.clone()),
                    next_attempt_at: Some(None),
                    error_message: Some(None),
                    paid_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;

        let Some(paid) = paid else {
            let current = self.load(execution.id).await?;
            return Ok(paid_outcome(&current));
        };
        info!(
            execution_id = paid.id,
            signature = %signature,
            from = %ExecutionStatus::Holding,
            to = %ExecutionStatus::Paid,
            "Payout complete"
        );

        if let Some(reservation_id) = paid.reservation_id {
            self.ledger.commit(reservation_id).await?;
        }
        let score = self
            .store
            .add_reputation(self.scorer.paid_action_event(paid.user_id, paid.id, now))
            .await?;
        info!(user_id = paid.user_id, reputation = score, "Reputation updated");

        Ok(PayoutOutcome::Paid(signature))
    }

    async fn retry_later(&self, execution: Execution, reason: String) -> Result<PayoutOutcome> {
        let attempts = execution.retry_count + 1;
        if attempts >= self.config.max_retries {
            // The reservation is only released once the transfer is known not to exist
            let reference = auth::payout_reference(&execution.id.to_string());
            match self.lookup(&reference).await {
                Ok(Some(signature)) => {
                    info!(execution_id = execution.id, "Transfer found on chain before giving up");
                    return self.complete(execution, signature).await;
                }
                Ok(None) => {
                    return self
                        .fail(
                            execution,
                            format!("{} (gave up after {} attempts)", reason, attempts),
                        )
                        .await;
                }
                Err(e) => {
                    warn!(
                        execution_id = execution.id,
                        "Transfer state unknown after {} attempts, keeping reservation: {}",
                        attempts,
                        e
                    );
                }
            }
        }

        let next_attempt_at = Utc::now() + self.backoff(attempts);
        self.store
            .transition_execution(
                execution.id,
                &[ExecutionStatus::Holding],
                ExecutionStatus::Ready,
                ExecutionUpdate {
                    retry_count: Some(attempts),
                    next_attempt_at: Some(Some(next_attempt_at)),
                    error_message: Some(Some(reason.clone())),
                    ..Default::default()
                },
            )
            .await?;
        warn!(
            execution_id = execution.id,
            retry_count = attempts,
            next_attempt_at = %next_attempt_at,
            from = %ExecutionStatus::Holding,
            to = %ExecutionStatus::Ready,
            "Transient payout failure: {}",
            reason
        );
        Ok(PayoutOutcome::Retryable(reason))
    }

    async fn fail(&self, execution: Execution, reason: String) -> Result<PayoutOutcome> {
        let failed = self
            .store
            .transition_execution(
                execution.id,
                &[ExecutionStatus::Holding],
                ExecutionStatus::Failed,
                ExecutionUpdate {
                    next_attempt_at: Some(None),
                    error_message: Some(Some(reason.clone())),
                    ..Default::default()
                },
            )
            .await?;
        error!(
            execution_id = execution.id,
            from = %ExecutionStatus::Holding,
            to = %ExecutionStatus::Failed,
            "Payout failed permanently: {}",
            reason
        );
        if let Some(reservation_id) = failed.and_then(|f| f.reservation_id) {
            self.ledger.release(reservation_id).await?;
        }
        Ok(PayoutOutcome::Fatal(reason))
    }

    /// `base * 2^(attempt-1)` capped at `backoff_max_secs`, plus up to 20% jitter
    fn backoff(&self, attempt: u32) -> chrono::Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let secs = self
            .config
            .backoff_base_secs
            .saturating_mul(1u64 << exp)
            .min(self.config.backoff_max_secs);
        let jitter = rand::thread_rng().gen_range(0..=secs / 5);
        chrono::Duration::seconds((secs + jitter) as i64)
    }
}

fn paid_outcome(execution: &Execution) -> PayoutOutcome {
    match &execution.transaction_signature {
        Some(signature) => PayoutOutcome::Paid(signature.clone()),
        None => PayoutOutcome::Retryable("payout already in progress".to_string()),
    }
}
