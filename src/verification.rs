//! Verification engine
//!
//! Turns an action attempt into a verified execution:
//!
//! 1. claim the unique (action, user) slot
//! 2. enforce the action's execution cap
//! 3. run eligibility rules
//! 4. verify the proof with the strategy registered for the action kind
//! 5. reserve the reward from the campaign budget
//! 6. persist `verified`, or `waiting` for holding actions
//!
//! A failed external lookup leaves the execution `pending`. A later verify
//! call may resume it once `pending_resume_after_secs` has passed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth;
use crate::config::VerificationConfig;
use crate::eligibility::{
    call_external, ChainReader, Eligibility, EligibilityChecker, Engagement, SocialVerifier,
};
use crate::error::{IneligibleReason, RewardError, Result};
use crate::ledger::BudgetLedger;
use crate::store::{CreateExecution, NewUser, Store};
use crate::types::{
    Action, ActionId, ActionKind, Campaign, CampaignStatus, Execution, ExecutionStatus,
    ExecutionUpdate, HoldingRequirement, NewExecution, User, UserStatus,
};

const MAX_PROOF_LEN: usize = 2048;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub action_id: ActionId,
    pub user_wallet: String,
    #[serde(default)]
    pub proof: Option<String>,
}

// ============================================================================
// PROOF STRATEGIES
// ============================================================================

pub struct ProofContext<'a> {
    pub action: &'a Action,
    pub campaign: &'a Campaign,
    pub user: &'a User,
    pub proof: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofVerdict {
    Confirmed,
    /// Confirmed now, but the condition must hold until the window ends
    Hold(HoldingRequirement),
    Rejected(IneligibleReason),
}

#[async_trait]
pub trait ProofStrategy: Send + Sync {
    async fn verify(&self, ctx: &ProofContext<'_>) -> Result<ProofVerdict>;
}

fn not_found(detail: impl Into<String>) -> ProofVerdict {
    ProofVerdict::Rejected(IneligibleReason::ProofNotFound {
        detail: detail.into(),
    })
}

struct VisitReceipt {
    secret: Option<String>,
}

#[async_trait]
impl ProofStrategy for VisitReceipt {
    async fn verify(&self, ctx: &ProofContext<'_>) -> Result<ProofVerdict> {
        let Some(secret) = self.secret.as_deref() else {
            return Ok(not_found("website visits cannot be verified right now"));
        };
        let Some(receipt) = ctx.proof else {
            return Ok(not_found("visit receipt missing"));
        };
        if auth::verify_visit_receipt(secret, ctx.action.id, &ctx.user.wallet_address, receipt) {
            Ok(ProofVerdict::Confirmed)
        } else {
            Ok(not_found("visit receipt does not match this action"))
        }
    }
}

struct SocialEngagement {
    social: Arc<dyn SocialVerifier>,
    engagement: Engagement,
    timeout: std::time::Duration,
}

#[async_trait]
impl ProofStrategy for SocialEngagement {
    async fn verify(&self, ctx: &ProofContext<'_>) -> Result<ProofVerdict> {
        let handle = match self.engagement {
            Engagement::ChannelMember => ctx.user.telegram_handle.as_deref(),
            _ => ctx.user.twitter_handle.as_deref(),
        };
        let Some(handle) = handle else {
            return Ok(ProofVerdict::Rejected(IneligibleReason::SocialNotLinked));
        };

        let target = ctx.action.target();
        if target.is_empty() {
            return Err(RewardError::Validation(format!(
                "action {} has no target in its url",
                ctx.action.id
            )));
        }

        let engaged = call_external(
            self.timeout,
            "social engagement lookup",
            self.social.has_engaged(self.engagement, handle, target),
        )
        .await?;

        if engaged {
            Ok(ProofVerdict::Confirmed)
        } else {
            Ok(not_found(format!("no {:?} found for @{}", self.engagement, handle)))
        }
    }
}

struct TokenHolding {
    chain: Arc<dyn ChainReader>,
    timeout: std::time::Duration,
}

#[async_trait]
impl ProofStrategy for TokenHolding {
    async fn verify(&self, ctx: &ProofContext<'_>) -> Result<ProofVerdict> {
        let Some(rule) = ctx.campaign.holder_rule else {
            return Err(RewardError::Validation(format!(
                "campaign {} has no holding rule",
                ctx.campaign.id
            )));
        };
        let actual = call_external(
            self.timeout,
            "token balance lookup",
            self.chain
                .balance(&ctx.user.wallet_address, Some(ctx.campaign.token_mint.as_str())),
        )
        .await?;

        if actual < rule.amount {
            return Ok(ProofVerdict::Rejected(IneligibleReason::InsufficientBalance {
                required: rule.amount,
                actual,
            }));
        }
        Ok(ProofVerdict::Hold(rule))
    }
}

/// One strategy per action kind
pub type StrategyTable = HashMap<ActionKind, Arc<dyn ProofStrategy>>;

pub fn strategy_table(
    chain: Arc<dyn ChainReader>,
    social: Arc<dyn SocialVerifier>,
    receipt_secret: Option<String>,
    timeout: std::time::Duration,
) -> StrategyTable {
    let social_strategy = |engagement: Engagement| -> Arc<dyn ProofStrategy> {
        Arc::new(SocialEngagement {
            social: social.clone(),
            engagement,
            timeout,
        })
    };

    let mut table: StrategyTable = HashMap::new();
    table.insert(
        ActionKind::Website,
        Arc::new(VisitReceipt {
            secret: receipt_secret,
        }),
    );
    table.insert(ActionKind::Telegram, social_strategy(Engagement::ChannelMember));
    table.insert(ActionKind::TwitterFollow, social_strategy(Engagement::Follow));
    table.insert(ActionKind::TwitterRetweet, social_strategy(Engagement::Retweet));
    table.insert(ActionKind::TwitterLike, social_strategy(Engagement::Like));
    table.insert(ActionKind::TwitterComment, social_strategy(Engagement::Comment));
    table.insert(
        ActionKind::TokenHolding,
        Arc::new(TokenHolding { chain, timeout }),
    );
    table
}

// ============================================================================
// ENGINE
// ============================================================================

/// Result of one pass over `waiting` executions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HoldingSweepReport {
    pub ready: usize,
    pub rejected: usize,
    pub skipped: usize,
}

pub struct VerificationEngine {
    store: Arc<dyn Store>,
    ledger: BudgetLedger,
    eligibility: EligibilityChecker,
    strategies: StrategyTable,
    chain: Arc<dyn ChainReader>,
    pending_resume_after: chrono::Duration,
    timeout: std::time::Duration,
}

impl VerificationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainReader>,
        social: Arc<dyn SocialVerifier>,
        config: &VerificationConfig,
        receipt_secret: Option<String>,
    ) -> Self {
        let timeout = config.external_timeout();
        Self {
            ledger: BudgetLedger::new(store.clone()),
            eligibility: EligibilityChecker::new(
                store.clone(),
                chain.clone(),
                social.clone(),
                config,
            ),
            strategies: strategy_table(chain.clone(), social, receipt_secret, timeout),
            store,
            chain,
            pending_resume_after: chrono::Duration::seconds(
                config.pending_resume_after_secs.min(i64::MAX as u64) as i64,
            ),
            timeout,
        }
    }

    pub async fn verify(&self, request: VerifyRequest) -> Result<Execution> {
        if !auth::is_valid_wallet_address(&request.user_wallet) {
            return Err(RewardError::Validation(format!(
                "invalid wallet address '{}'",
                request.user_wallet
            )));
        }
        if request.proof.as_ref().is_some_and(|p| p.len() > MAX_PROOF_LEN) {
            return Err(RewardError::Validation("proof is too long".to_string()));
        }

        let action = self
            .store
            .get_action(request.action_id)
            .await?
            .ok_or_else(|| RewardError::NotFound(format!("action {}", request.action_id)))?;
        let campaign = self
            .store
            .get_campaign(action.campaign_id)
            .await?
            .ok_or_else(|| RewardError::NotFound(format!("campaign {}", action.campaign_id)))?;
        if !matches!(
            campaign.status,
            CampaignStatus::Active | CampaignStatus::Exhausted
        ) {
            return Err(RewardError::Validation(format!(
                "campaign {} is not accepting actions",
                campaign.id
            )));
        }
        let user = self.get_or_register_user(&request.user_wallet).await?;

        // Step 1: the unique (action, user) slot
        let execution = self.claim_slot(&action, &user, request.proof.clone()).await?;

        // Step 2: execution cap
        if let Some(cap) = action.max_executions {
            let counted = self
                .store
                .count_executions(action.id, &ExecutionStatus::COUNTED)
                .await?;
            if counted >= cap as u64 {
                self.reject(&execution, "Action has reached its execution cap")
                    .await?;
                return Err(RewardError::ActionExhausted(action.id));
            }
        }

        // Step 3: eligibility
        if let Eligibility::Ineligible(reason) = self.eligibility.check(&user, &campaign).await? {
            self.reject(&execution, &reason.to_string()).await?;
            return Err(RewardError::Ineligible(reason));
        }

        // Step 4: proof
        let strategy = self.strategies.get(&action.kind).ok_or_else(|| {
            RewardError::Validation(format!("no verification strategy for {:?}", action.kind))
        })?;
        let verdict = strategy
            .verify(&ProofContext {
                action: &action,
                campaign: &campaign,
                user: &user,
                proof: request.proof.as_deref(),
            })
            .await?;
        let hold = match verdict {
            ProofVerdict::Confirmed => None,
            ProofVerdict::Hold(rule) => Some(rule),
            ProofVerdict::Rejected(reason) => {
                self.reject(&execution, &reason.to_string()).await?;
                return Err(RewardError::Ineligible(reason));
            }
        };

        // Step 5: budget
        let reservation = match self.ledger.reserve(campaign.id, action.reward_amount).await {
            Ok(reservation) => reservation,
            Err(e @ (RewardError::InsufficientBudget { .. } | RewardError::CampaignExhausted(_))) => {
                self.reject(&execution, &IneligibleReason::BudgetExhausted.to_string())
                    .await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        // Step 6: persist
        let (to, hold_until) = match hold {
            Some(rule) => (
                ExecutionStatus::Waiting,
                Some(Utc::now() + chrono::Duration::days(rule.days as i64)),
            ),
            None => (ExecutionStatus::Verified, None),
        };
        let update = ExecutionUpdate {
            reservation_id: Some(Some(reservation.id)),
            hold_until: Some(hold_until),
            error_message: Some(None),
            ..Default::default()
        };

        match self
            .store
            .transition_execution(execution.id, &[ExecutionStatus::Pending], to, update)
            .await?
        {
            Some(verified) => {
                info!(
                    execution_id = verified.id,
                    campaign_id = campaign.id,
                    reservation_id = %reservation.id,
                    from = %ExecutionStatus::Pending,
                    to = %to,
                    "Execution verified"
                );
                self.enforce_cap_after_commit(&action, verified).await
            }
            None => {
                // A concurrent resume finished first
                self.ledger.release(reservation.id).await?;
                Err(RewardError::AlreadyExecuted {
                    execution_id: execution.id,
                })
            }
        }
    }

    /// Re-evaluate `waiting` executions whose holding window has ended
    pub async fn recheck_waiting(&self, now: DateTime<Utc>, limit: usize) -> Result<HoldingSweepReport> {
        let mut report = HoldingSweepReport::default();
        let waiting = self
            .store
            .executions_by_status(ExecutionStatus::Waiting, limit)
            .await?;

        for execution in waiting {
            if execution.hold_until.is_some_and(|until| until > now) {
                continue;
            }
            match self.recheck_one(&execution).await {
                Ok(true) => report.ready += 1,
                Ok(false) => report.rejected += 1,
                Err(e) => {
                    warn!(execution_id = execution.id, "Holding re-check skipped: {}", e);
                    report.skipped += 1;
                }
            }
        }

        if report.ready + report.rejected > 0 {
            info!(
                ready = report.ready,
                rejected = report.rejected,
                "Holding sweep complete"
            );
        }
        Ok(report)
    }

    /// Returns whether the holding condition held
    async fn recheck_one(&self, execution: &Execution) -> Result<bool> {
        let campaign = self
            .store
            .get_campaign(execution.campaign_id)
            .await?
            .ok_or_else(|| RewardError::NotFound(format!("campaign {}", execution.campaign_id)))?;
        let user = self
            .store
            .get_user(execution.user_id)
            .await?
            .ok_or_else(|| RewardError::NotFound(format!("user {}", execution.user_id)))?;
        let rule = campaign.holder_rule.ok_or_else(|| {
            RewardError::Validation(format!("campaign {} has no holding rule", campaign.id))
        })?;

        let actual = call_external(
            self.timeout,
            "token balance lookup",
            self.chain
                .balance(&user.wallet_address, Some(campaign.token_mint.as_str())),
        )
        .await?;

        if actual >= rule.amount {
            let moved = self
                .store
                .transition_execution(
                    execution.id,
                    &[ExecutionStatus::Waiting],
                    ExecutionStatus::Ready,
                    ExecutionUpdate::default(),
                )
                .await?;
            if moved.is_some() {
                info!(
                    execution_id = execution.id,
                    from = %ExecutionStatus::Waiting,
                    to = %ExecutionStatus::Ready,
                    "Holding period satisfied"
                );
            }
            return Ok(true);
        }

        let reason = IneligibleReason::HoldingBroken {
            required: rule.amount,
            actual,
        };
        let moved = self
            .store
            .transition_execution(
                execution.id,
                &[ExecutionStatus::Waiting],
                ExecutionStatus::Rejected,
                ExecutionUpdate {
                    error_message: Some(Some(reason.to_string())),
                    ..Default::default()
                },
            )
            .await?;
        if let Some(rejected) = moved {
            info!(
                execution_id = rejected.id,
                from = %ExecutionStatus::Waiting,
                to = %ExecutionStatus::Rejected,
                "Holding requirement broken"
            );
            if let Some(reservation_id) = rejected.reservation_id {
                self.ledger.release(reservation_id).await?;
            }
        }
        Ok(false)
    }

    /// Look a wallet up, registering it with the default reputation if new
    pub async fn get_or_register_user(&self, wallet: &str) -> Result<User> {
        if let Some(user) = self.store.get_user_by_wallet(wallet).await? {
            return Ok(user);
        }
        let registered = self
            .store
            .insert_user(NewUser {
                wallet_address: wallet.to_string(),
                status: UserStatus::Active,
                twitter_handle: None,
                telegram_handle: None,
            })
            .await;
        match registered {
            Ok(user) => Ok(user),
            // Lost a registration race on the unique wallet
            Err(e) => self
                .store
                .get_user_by_wallet(wallet)
                .await?
                .ok_or(RewardError::Storage(e)),
        }
    }

    async fn claim_slot(&self, action: &Action, user: &User, proof: Option<String>) -> Result<Execution> {
        let created = self
            .store
            .create_execution(NewExecution {
                action_id: action.id,
                campaign_id: action.campaign_id,
                user_id: user.id,
                proof,
                reserved_amount: action.reward_amount,
            })
            .await?;

        let existing = match created {
            CreateExecution::Created(execution) => {
                debug!(execution_id = execution.id, action_id = action.id, "Execution created");
                return Ok(execution);
            }
            CreateExecution::Duplicate(existing) => existing,
        };

        let stale = Utc::now() - self.pending_resume_after;
        if existing.status != ExecutionStatus::Pending || existing.updated_at > stale {
            return Err(RewardError::AlreadyExecuted {
                execution_id: existing.id,
            });
        }

        // An earlier attempt stopped at an external timeout; take it over
        let resumed = self
            .store
            .transition_execution(
                existing.id,
                &[ExecutionStatus::Pending],
                ExecutionStatus::Pending,
                ExecutionUpdate::default(),
            )
            .await?
            .ok_or(RewardError::AlreadyExecuted {
                execution_id: existing.id,
            })?;
        info!(execution_id = resumed.id, "Resuming stalled verification");
        Ok(resumed)
    }

    async fn reject(&self, execution: &Execution, message: &str) -> Result<()> {
        let moved = self
            .store
            .transition_execution(
                execution.id,
                &[ExecutionStatus::Pending],
                ExecutionStatus::Rejected,
                ExecutionUpdate {
                    error_message: Some(Some(message.to_string())),
                    ..Default::default()
                },
            )
            .await?;
        if moved.is_some() {
            info!(
                execution_id = execution.id,
                from = %ExecutionStatus::Pending,
                to = %ExecutionStatus::Rejected,
                reason = message,
                "Execution rejected"
            );
        }
        Ok(())
    }

    /// Concurrent verifies may both pass the cap pre-check; the later one backs out
    async fn enforce_cap_after_commit(&self, action: &Action, execution: Execution) -> Result<Execution> {
        let Some(cap) = action.max_executions else {
            return Ok(execution);
        };
        let counted = self
            .store
            .count_executions(action.id, &ExecutionStatus::COUNTED)
            .await?;
        if counted <= cap as u64 {
            return Ok(execution);
        }

        let backed_out = self
            .store
            .transition_execution(
                execution.id,
                &[ExecutionStatus::Verified, ExecutionStatus::Waiting],
                ExecutionStatus::Rejected,
                ExecutionUpdate {
                    error_message: Some(Some("Action has reached its execution cap".to_string())),
                    ..Default::default()
                },
            )
            .await?;
        if let Some(rejected) = backed_out {
            warn!(execution_id = rejected.id, action_id = action.id, "Execution cap overshoot, backing out");
            if let Some(reservation_id) = rejected.reservation_id {
                self.ledger.release(reservation_id).await?;
            }
        }
        Err(RewardError::ActionExhausted(action.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::{MemoryStore, NewAction, NewCampaign};
    use crate::testing::{FakeChain, FakeSocial};
    use crate::types::{Requirements, TokenAmount};

    const WALLET: &str = "4Nd1mBQtrMJVYVfKf2PJy9NZUZdTAsp7D4xWLs4gDB4T";

    struct Fixture {
        store: Arc<MemoryStore>,
        chain: Arc<FakeChain>,
        social: Arc<FakeSocial>,
        engine: VerificationEngine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(FakeChain::new());
        let social = Arc::new(FakeSocial::new());
        let engine = VerificationEngine::new(
            store.clone(),
            chain.clone(),
            social.clone(),
            &Config::default().verification,
            Some("receipt-secret".to_string()),
        );
        Fixture {
            store,
            chain,
            social,
            engine,
        }
    }

    async fn action(
        store: &MemoryStore,
        kind: ActionKind,
        url: &str,
        holder_rule: Option<HoldingRequirement>,
    ) -> Action {
        let campaign = store
            .insert_campaign(NewCampaign {
                title: "Launch".to_string(),
                token_mint: "mint".to_string(),
                total_budget: TokenAmount::from_tokens(100),
                status: CampaignStatus::Active,
                creation_fee_paid: true,
                requirements: Requirements::default(),
                holder_rule,
            })
            .await
            .unwrap();
        store
            .insert_action(NewAction {
                campaign_id: campaign.id,
                kind,
                title: "Do it".to_string(),
                url: url.to_string(),
                reward_amount: TokenAmount::from_tokens(10),
                max_executions: None,
            })
            .await
            .unwrap()
    }

    fn request(action_id: ActionId, proof: Option<String>) -> VerifyRequest {
        VerifyRequest {
            action_id,
            user_wallet: WALLET.to_string(),
            proof,
        }
    }

    #[tokio::test]
    async fn test_website_receipt_verifies_and_reserves() {
        let f = fixture();
        let a = action(&f.store, ActionKind::Website, "https://example.com", None).await;
        let receipt = auth::visit_receipt("receipt-secret", a.id, WALLET);

        let execution = f.engine.verify(request(a.id, Some(receipt))).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Verified);
        assert!(execution.reservation_id.is_some());

        let campaign = f.store.get_campaign(a.campaign_id).await.unwrap().unwrap();
        assert_eq!(campaign.remaining_budget, TokenAmount::from_tokens(90));
    }

    #[tokio::test]
    async fn test_bad_receipt_is_rejected_without_reservation() {
        let f = fixture();
        let a = action(&f.store, ActionKind::Website, "https://example.com", None).await;

        let err = f
            .engine
            .verify(request(a.id, Some("deadbeef".to_string())))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RewardError::Ineligible(IneligibleReason::ProofNotFound { .. })
        ));
        let campaign = f.store.get_campaign(a.campaign_id).await.unwrap().unwrap();
        assert_eq!(campaign.remaining_budget, TokenAmount::from_tokens(100));

        let again = f.engine.verify(request(a.id, None)).await.unwrap_err();
        assert!(matches!(again, RewardError::AlreadyExecuted { .. }));
    }

    #[tokio::test]
    async fn test_twitter_follow_uses_url_target() {
        let f = fixture();
        let a = action(&f.store, ActionKind::TwitterFollow, "https://x.com/projectx", None).await;
        let user = f.engine.get_or_register_user(WALLET).await.unwrap();
        assert!(user.twitter_handle.is_none());

        let err = f.engine.verify(request(a.id, None)).await.unwrap_err();
        assert!(matches!(
            err,
            RewardError::Ineligible(IneligibleReason::SocialNotLinked)
        ));
        assert_eq!(f.social.engagement_lookups(), 0);
    }

    #[tokio::test]
    async fn test_linked_twitter_handle_verifies_follow() {
        let f = fixture();
        let a = action(&f.store, ActionKind::TwitterFollow, "https://x.com/projectx", None).await;
        let user = f.engine.get_or_register_user(WALLET).await.unwrap();
        f.store
            .link_social(user.id, Some("alice".to_string()), None)
            .await
            .unwrap()
            .unwrap();
        f.social.engage(Engagement::Follow, "alice", "projectx");

        let execution = f.engine.verify(request(a.id, None)).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Verified);
        assert_eq!(f.social.engagement_lookups(), 1);
    }

    #[tokio::test]
    async fn test_holding_action_waits_then_becomes_ready() {
        let f = fixture();
        let rule = HoldingRequirement {
            amount: TokenAmount::from_tokens(5),
            days: 7,
        };
        let a = action(&f.store, ActionKind::TokenHolding, "https://example.com", Some(rule)).await;
        f.chain.set_balance(WALLET, Some("mint"), TokenAmount::from_tokens(6));

        let execution = f.engine.verify(request(a.id, None)).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Waiting);
        assert!(execution.hold_until.is_some());

        // Window still open
        let report = f.engine.recheck_waiting(Utc::now(), 10).await.unwrap();
        assert_eq!(report, HoldingSweepReport::default());

        let later = Utc::now() + chrono::Duration::days(8);
        let report = f.engine.recheck_waiting(later, 10).await.unwrap();
        assert_eq!(report.ready, 1);
        let row = f.store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Ready);
    }

    #[tokio::test]
    async fn test_broken_holding_releases_budget() {
        let f = fixture();
        let rule = HoldingRequirement {
            amount: TokenAmount::from_tokens(5),
            days: 1,
        };
        let a = action(&f.store, ActionKind::TokenHolding, "https://example.com", Some(rule)).await;
        f.chain.set_balance(WALLET, Some("mint"), TokenAmount::from_tokens(5));
        let execution = f.engine.verify(request(a.id, None)).await.unwrap();

        f.chain.set_balance(WALLET, Some("mint"), TokenAmount::from_tokens(1));
        let later = Utc::now() + chrono::Duration::days(2);
        let report = f.engine.recheck_waiting(later, 10).await.unwrap();
        assert_eq!(report.rejected, 1);

        let row = f.store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Rejected);
        let campaign = f.store.get_campaign(a.campaign_id).await.unwrap().unwrap();
        assert_eq!(campaign.remaining_budget, TokenAmount::from_tokens(100));
    }

    #[tokio::test]
    async fn test_external_timeout_leaves_pending() {
        let f = fixture();
        let a = action(&f.store, ActionKind::TwitterLike, "https://x.com/p/status/99", None).await;
        f.store
            .insert_user(NewUser {
                wallet_address: WALLET.to_string(),
                status: UserStatus::Active,
                twitter_handle: Some("alice".to_string()),
                telegram_handle: None,
            })
            .await
            .unwrap();
        f.social.fail_lookups(true);

        let err = f.engine.verify(request(a.id, None)).await.unwrap_err();
        assert!(err.is_retryable());

        let user = f.store.get_user_by_wallet(WALLET).await.unwrap().unwrap();
        let pending = f.store.pending_rewards(user.id, None).await.unwrap();
        assert!(pending.is_empty());

        // Too soon to resume
        let err = f.engine.verify(request(a.id, None)).await.unwrap_err();
        assert!(matches!(err, RewardError::AlreadyExecuted { .. }));
    }

    #[tokio::test]
    async fn test_cap_overshoot_is_backed_out_and_released() {
        let f = fixture();
        let campaign = f
            .store
            .insert_campaign(NewCampaign {
                title: "Launch".to_string(),
                token_mint: "mint".to_string(),
                total_budget: TokenAmount::from_tokens(100),
                status: CampaignStatus::Active,
                creation_fee_paid: true,
                requirements: Requirements {
                    min_balance: Some(TokenAmount::from_tokens(1)),
                    ..Default::default()
                },
                holder_rule: None,
            })
            .await
            .unwrap();
        let a = f
            .store
            .insert_action(NewAction {
                campaign_id: campaign.id,
                kind: ActionKind::Website,
                title: "Visit".to_string(),
                url: "https://example.com".to_string(),
                reward_amount: TokenAmount::from_tokens(10),
                max_executions: Some(1),
            })
            .await
            .unwrap();

        let other = bs58::encode([7u8; 32]).into_string();
        for wallet in [WALLET, other.as_str()] {
            f.chain.set_balance(wallet, None, TokenAmount::from_tokens(5));
        }
        // Both verifies pass the cap pre-check before either persists
        f.chain
            .set_read_delay(Some(std::time::Duration::from_millis(50)));

        let first = VerifyRequest {
            action_id: a.id,
            user_wallet: WALLET.to_string(),
            proof: Some(auth::visit_receipt("receipt-secret", a.id, WALLET)),
        };
        let second = VerifyRequest {
            action_id: a.id,
            user_wallet: other.clone(),
            proof: Some(auth::visit_receipt("receipt-secret", a.id, &other)),
        };
        let (first, second) = tokio::join!(f.engine.verify(first), f.engine.verify(second));

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(RewardError::ActionExhausted(id)) if *id == a.id)));

        let counted = f
            .store
            .count_executions(a.id, &ExecutionStatus::COUNTED)
            .await
            .unwrap();
        assert_eq!(counted, 1);
        let rejected = f
            .store
            .executions_by_status(ExecutionStatus::Rejected, 10)
            .await
            .unwrap();
        assert_eq!(rejected.len(), 1);
        let campaign = f.store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.remaining_budget, TokenAmount::from_tokens(90));
    }

    #[test]
    fn test_every_kind_has_a_strategy() {
        let table = strategy_table(
            Arc::new(FakeChain::new()),
            Arc::new(FakeSocial::new()),
            None,
            std::time::Duration::from_secs(1),
        );
        for kind in ActionKind::ALL {
            assert!(table.contains_key(&kind), "{:?} missing", kind);
        }
    }
}
