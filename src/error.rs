//! Error taxonomy for the reward engine

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TokenAmount;

/// Why a user failed an eligibility rule. Rendered verbatim to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum IneligibleReason {
    Blocked,
    LowReputation { required: i64, actual: i64 },
    RateLimited { attempts: u32 },
    InsufficientBalance { required: TokenAmount, actual: TokenAmount },
    WalletTooNew { required_days: u32, actual_days: u32 },
    SocialNotLinked,
    SocialAccountTooNew { required_days: u32, actual_days: u32 },
    NotEnoughFollowers { required: u32, actual: u32 },
    HoldingHistoryIncomplete { required_days: u32, observed_days: u32 },
    HoldingTooLow { required: TokenAmount, average: TokenAmount, days: u32 },
    ProofNotFound { detail: String },
    HoldingBroken { required: TokenAmount, actual: TokenAmount },
    BudgetExhausted,
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IneligibleReason::Blocked => write!(f, "Account is not active"),
            IneligibleReason::LowReputation { required, actual } => write!(
                f,
                "Reputation too low: {} required, you have {}",
                required, actual
            ),
            IneligibleReason::RateLimited { attempts } => write!(
                f,
                "Too many claims in the last minute ({}). Slow down and try again",
                attempts
            ),
            IneligibleReason::InsufficientBalance { required, actual } => write!(
                f,
                "Minimum balance of {} required. Your current balance is {}",
                required, actual
            ),
            IneligibleReason::WalletTooNew {
                required_days,
                actual_days,
            } => write!(
                f,
                "Wallet must be at least {} days old. It is currently {} days old",
                required_days, actual_days
            ),
            IneligibleReason::SocialNotLinked => {
                write!(f, "Link your social account in settings first")
            }
            IneligibleReason::SocialAccountTooNew {
                required_days,
                actual_days,
            } => write!(
                f,
                "Social account must be at least {} days old. It is currently {} days old",
                required_days, actual_days
            ),
            IneligibleReason::NotEnoughFollowers { required, actual } => write!(
                f,
                "At least {} followers required. You have {}",
                required, actual
            ),
            IneligibleReason::HoldingHistoryIncomplete {
                required_days,
                observed_days,
            } => write!(
                f,
                "Balance history incomplete: {} of {} days observed. Try again later",
                observed_days, required_days
            ),
            IneligibleReason::HoldingTooLow {
                required,
                average,
                days,
            } => write!(
                f,
                "Average balance over {} days must be at least {}. Yours is {}",
                days, required, average
            ),
            IneligibleReason::ProofNotFound { detail } => {
                write!(f, "Action not verified: {}", detail)
            }
            IneligibleReason::HoldingBroken { required, actual } => write!(
                f,
                "Holding requirement broken: {} required, balance dropped to {}",
                required, actual
            ),
            IneligibleReason::BudgetExhausted => write!(f, "Campaign budget is exhausted"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RewardError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not eligible: {0}")]
    Ineligible(IneligibleReason),

    #[error("Insufficient campaign budget: {requested} requested, {remaining} remaining")]
    InsufficientBudget {
        requested: TokenAmount,
        remaining: TokenAmount,
    },

    #[error("Campaign {0} budget is exhausted")]
    CampaignExhausted(i64),

    #[error("Action {0} has reached its execution cap")]
    ActionExhausted(i64),

    #[error("Action already executed by this wallet")]
    AlreadyExecuted { execution_id: i64 },

    #[error("Payout temporarily failed: {0}")]
    TransientPayout(String),

    #[error("Payout failed: {0}")]
    FatalPayout(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("External service timed out: {0}")]
    Timeout(String),

    #[error("External service unavailable: {0}")]
    External(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl RewardError {
    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RewardError::TransientPayout(_)
                | RewardError::Timeout(_)
                | RewardError::External(_)
                | RewardError::Storage(_)
        )
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            RewardError::Validation(_) => "validation",
            RewardError::Ineligible(_) => "ineligible",
            RewardError::InsufficientBudget { .. } => "insufficient_budget",
            RewardError::CampaignExhausted(_) => "campaign_exhausted",
            RewardError::ActionExhausted(_) => "action_exhausted",
            RewardError::AlreadyExecuted { .. } => "already_executed",
            RewardError::TransientPayout(_) => "transient_payout",
            RewardError::FatalPayout(_) => "fatal_payout",
            RewardError::NotFound(_) => "not_found",
            RewardError::Timeout(_) => "timeout",
            RewardError::External(_) => "external_unavailable",
            RewardError::Storage(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, RewardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RewardError::TransientPayout("rpc timeout".into()).is_retryable());
        assert!(RewardError::Timeout("social api".into()).is_retryable());
        assert!(!RewardError::FatalPayout("bad destination".into()).is_retryable());
        assert!(!RewardError::ActionExhausted(1).is_retryable());
        assert!(!RewardError::Ineligible(IneligibleReason::Blocked).is_retryable());
    }

    #[test]
    fn test_reason_messages_are_specific() {
        let reason = IneligibleReason::NotEnoughFollowers {
            required: 50,
            actual: 3,
        };
        assert_eq!(reason.to_string(), "At least 50 followers required. You have 3");

        let reason = IneligibleReason::InsufficientBalance {
            required: TokenAmount::from_tokens(1),
            actual: "0.25".parse().unwrap(),
        };
        assert!(reason.to_string().contains("0.25"));
    }

    #[test]
    fn test_reason_serializes_with_code() {
        let json = serde_json::to_value(IneligibleReason::Blocked).unwrap();
        assert_eq!(json["code"], "blocked");
    }
}
