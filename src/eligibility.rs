//! Eligibility rules
//!
//! Checks run in a fixed order, local ones first, and stop at the first
//! failure:
//!
//! 1. account status
//! 2. minimum reputation
//! 3. rapid-claim guard
//! 4. wallet balance (chain)
//! 5. wallet age (chain)
//! 6. social account age and followers (social API)
//! 7. multi-day average holding (chain history)
//!
//! Missing balance history is never treated as eligible.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::VerificationConfig;
use crate::error::{IneligibleReason, RewardError, Result};
use crate::store::Store;
use crate::types::{Campaign, TokenAmount, User, UserStatus};

/// On-chain reads used by eligibility and holding checks
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Balance of `wallet`; `mint = None` reads the native balance
    async fn balance(&self, wallet: &str, mint: Option<&str>) -> anyhow::Result<TokenAmount>;

    /// Days since the wallet's first transaction
    async fn wallet_age_days(&self, wallet: &str) -> anyhow::Result<u32>;

    /// End-of-day balances for the trailing `days`, oldest first.
    /// A `None` entry is a day with no snapshot.
    async fn daily_balances(
        &self,
        wallet: &str,
        mint: Option<&str>,
        days: u32,
    ) -> anyhow::Result<Vec<Option<TokenAmount>>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialAccount {
    pub handle: String,
    pub account_age_days: u32,
    pub followers: u32,
}

/// Engagement a social proof can attest to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engagement {
    Follow,
    Retweet,
    Like,
    Comment,
    ChannelMember,
}

#[async_trait]
pub trait SocialVerifier: Send + Sync {
    async fn account(&self, handle: &str) -> anyhow::Result<Option<SocialAccount>>;

    /// Whether `handle` performed `engagement` on `target`
    async fn has_engaged(
        &self,
        engagement: Engagement,
        handle: &str,
        target: &str,
    ) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Ineligible(IneligibleReason),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// Await an external call under a deadline, mapping failures to retryable errors
pub(crate) async fn call_external<T, F>(timeout: Duration, what: &str, call: F) -> Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(RewardError::External(format!("{}: {:#}", what, e))),
        Err(_) => Err(RewardError::Timeout(what.to_string())),
    }
}

pub struct EligibilityChecker {
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainReader>,
    social: Arc<dyn SocialVerifier>,
    min_reputation: i64,
    rate_limit_per_minute: u32,
    timeout: Duration,
}

impl EligibilityChecker {
    pub fn new(
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainReader>,
        social: Arc<dyn SocialVerifier>,
        config: &VerificationConfig,
    ) -> Self {
        Self {
            store,
            chain,
            social,
            min_reputation: config.min_reputation,
            rate_limit_per_minute: config.rate_limit_per_minute,
            timeout: config.external_timeout(),
        }
    }

    pub async fn check(&self, user: &User, campaign: &Campaign) -> Result<Eligibility> {
        let verdict = self.evaluate(user, campaign).await?;
        if let Eligibility::Ineligible(reason) = &verdict {
            debug!(
                user_id = user.id,
                campaign_id = campaign.id,
                reason = %reason,
                "User not eligible"
            );
        }
        Ok(verdict)
    }

    async fn evaluate(&self, user: &User, campaign: &Campaign) -> Result<Eligibility> {
        use Eligibility::Ineligible;

        if user.status != UserStatus::Active {
            return Ok(Ineligible(IneligibleReason::Blocked));
        }

        if user.reputation_score < self.min_reputation {
            return Ok(Ineligible(IneligibleReason::LowReputation {
                required: self.min_reputation,
                actual: user.reputation_score,
            }));
        }

        let since = Utc::now() - chrono::Duration::seconds(60);
        let attempts = self.store.count_recent_executions(user.id, since).await?;
        if attempts > self.rate_limit_per_minute as u64 {
            return Ok(Ineligible(IneligibleReason::RateLimited {
                attempts: attempts.min(u32::MAX as u64) as u32,
            }));
        }

        let rules = &campaign.requirements;
        let wallet = user.wallet_address.as_str();

        if let Some(required) = rules.min_balance {
            let actual = call_external(
                self.timeout,
                "wallet balance lookup",
                self.chain.balance(wallet, None),
            )
            .await?;
            if actual < required {
                return Ok(Ineligible(IneligibleReason::InsufficientBalance { required, actual }));
            }
        }

        if let Some(required_days) = rules.min_wallet_age_days {
            let actual_days = call_external(
                self.timeout,
                "wallet age lookup",
                self.chain.wallet_age_days(wallet),
            )
            .await?;
            if actual_days < required_days {
                return Ok(Ineligible(IneligibleReason::WalletTooNew {
                    required_days,
                    actual_days,
                }));
            }
        }

        if rules.min_social_account_age_days.is_some() || rules.min_followers.is_some() {
            let Some(handle) = user.twitter_handle.as_deref() else {
                return Ok(Ineligible(IneligibleReason::SocialNotLinked));
            };
            let Some(account) =
                call_external(self.timeout, "social account lookup", self.social.account(handle))
                    .await?
            else {
                return Ok(Ineligible(IneligibleReason::SocialNotLinked));
            };

            if let Some(required_days) = rules.min_social_account_age_days {
                if account.account_age_days < required_days {
                    return Ok(Ineligible(IneligibleReason::SocialAccountTooNew {
                        required_days,
                        actual_days: account.account_age_days,
                    }));
                }
            }
            if let Some(required) = rules.min_followers {
                if account.followers < required {
                    return Ok(Ineligible(IneligibleReason::NotEnoughFollowers {
                        required,
                        actual: account.followers,
                    }));
                }
            }
        }

        if let Some(rule) = rules.min_average_holding {
            let history = call_external(
                self.timeout,
                "balance history lookup",
                self.chain.daily_balances(wallet, None, rule.days),
            )
            .await?;

            let observed: Vec<TokenAmount> = history.iter().flatten().copied().collect();
            if rule.days == 0 || observed.len() < rule.days as usize {
                return Ok(Ineligible(IneligibleReason::HoldingHistoryIncomplete {
                    required_days: rule.days,
                    observed_days: observed.len() as u32,
                }));
            }

            let average = TokenAmount::average(&observed);
            if average < rule.amount {
                return Ok(Ineligible(IneligibleReason::HoldingTooLow {
                    required: rule.amount,
                    average,
                    days: rule.days,
                }));
            }
        }

        Ok(Eligibility::Eligible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::{MemoryStore, NewCampaign, NewUser};
    use crate::testing::{FakeChain, FakeSocial};
    use crate::types::{CampaignStatus, HoldingRequirement, Requirements};

    const WALLET: &str = "4Nd1mBQtrMJVYVfKf2PJy9NZUZdTAsp7D4xWLs4gDB4T";

    struct Fixture {
        store: Arc<MemoryStore>,
        chain: Arc<FakeChain>,
        social: Arc<FakeSocial>,
        checker: EligibilityChecker,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(FakeChain::new());
        let social = Arc::new(FakeSocial::new());
        let checker = EligibilityChecker::new(
            store.clone(),
            chain.clone(),
            social.clone(),
            &Config::default().verification,
        );
        Fixture {
            store,
            chain,
            social,
            checker,
        }
    }

    async fn campaign(store: &MemoryStore, requirements: Requirements) -> Campaign {
        store
            .insert_campaign(NewCampaign {
                title: "Airdrop".to_string(),
                token_mint: "mint".to_string(),
                total_budget: TokenAmount::from_tokens(100),
                status: CampaignStatus::Active,
                creation_fee_paid: true,
                requirements,
                holder_rule: None,
            })
            .await
            .unwrap()
    }

    async fn user(store: &MemoryStore, twitter: Option<&str>) -> User {
        store
            .insert_user(NewUser {
                wallet_address: WALLET.to_string(),
                status: UserStatus::Active,
                twitter_handle: twitter.map(str::to_string),
                telegram_handle: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_blocked_user_short_circuits_before_chain() {
        let f = fixture();
        let c = campaign(
            &f.store,
            Requirements {
                min_balance: Some(TokenAmount::from_tokens(1)),
                ..Default::default()
            },
        )
        .await;
        let mut u = user(&f.store, None).await;
        u.status = UserStatus::Suspended;

        let verdict = f.checker.check(&u, &c).await.unwrap();
        assert_eq!(verdict, Eligibility::Ineligible(IneligibleReason::Blocked));
        assert_eq!(f.chain.balance_reads(), 0);
    }

    #[tokio::test]
    async fn test_balance_checked_before_wallet_age() {
        let f = fixture();
        f.chain.set_balance(WALLET, None, "0.5".parse().unwrap());
        f.chain.set_wallet_age(WALLET, 1);
        let c = campaign(
            &f.store,
            Requirements {
                min_balance: Some(TokenAmount::from_tokens(1)),
                min_wallet_age_days: Some(30),
                ..Default::default()
            },
        )
        .await;
        let u = user(&f.store, None).await;

        let verdict = f.checker.check(&u, &c).await.unwrap();
        assert!(matches!(
            verdict,
            Eligibility::Ineligible(IneligibleReason::InsufficientBalance { .. })
        ));
    }

    #[tokio::test]
    async fn test_social_thresholds() {
        let f = fixture();
        f.social.set_account("alice", 400, 12);
        let c = campaign(
            &f.store,
            Requirements {
                min_social_account_age_days: Some(90),
                min_followers: Some(50),
                ..Default::default()
            },
        )
        .await;

        let unlinked = user(&f.store, None).await;
        assert_eq!(
            f.checker.check(&unlinked, &c).await.unwrap(),
            Eligibility::Ineligible(IneligibleReason::SocialNotLinked)
        );

        let mut linked = unlinked.clone();
        linked.twitter_handle = Some("alice".to_string());
        assert_eq!(
            f.checker.check(&linked, &c).await.unwrap(),
            Eligibility::Ineligible(IneligibleReason::NotEnoughFollowers {
                required: 50,
                actual: 12
            })
        );
    }

    #[tokio::test]
    async fn test_incomplete_history_fails_closed() {
        let f = fixture();
        let rule = HoldingRequirement {
            amount: TokenAmount::from_tokens(1),
            days: 3,
        };
        f.chain.set_history(
            WALLET,
            None,
            vec![Some(TokenAmount::from_tokens(5)), None, Some(TokenAmount::from_tokens(5))],
        );
        let c = campaign(
            &f.store,
            Requirements {
                min_average_holding: Some(rule),
                ..Default::default()
            },
        )
        .await;
        let u = user(&f.store, None).await;

        assert_eq!(
            f.checker.check(&u, &c).await.unwrap(),
            Eligibility::Ineligible(IneligibleReason::HoldingHistoryIncomplete {
                required_days: 3,
                observed_days: 2
            })
        );

        f.chain.set_history(
            WALLET,
            None,
            vec![
                Some(TokenAmount::from_tokens(2)),
                Some(TokenAmount::ZERO),
                Some(TokenAmount::from_tokens(2)),
            ],
        );
        assert!(f.checker.check(&u, &c).await.unwrap().is_eligible());
    }

    #[tokio::test]
    async fn test_low_reputation() {
        let f = fixture();
        let c = campaign(&f.store, Requirements::default()).await;
        let mut u = user(&f.store, None).await;
        u.reputation_score = 10;
        assert!(matches!(
            f.checker.check(&u, &c).await.unwrap(),
            Eligibility::Ineligible(IneligibleReason::LowReputation { required: 50, .. })
        ));
    }

    #[tokio::test]
    async fn test_chain_failure_is_retryable() {
        let f = fixture();
        f.chain.fail_reads(true);
        let c = campaign(
            &f.store,
            Requirements {
                min_wallet_age_days: Some(1),
                ..Default::default()
            },
        )
        .await;
        let u = user(&f.store, None).await;
        let err = f.checker.check(&u, &c).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
