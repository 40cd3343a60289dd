//! Action Rewards - verify campaign actions and pay token rewards exactly once
//!
//! Campaigns fund a token budget and publish actions (visit a site, follow an
//! account, hold a token). Users perform an action, the engine verifies it and
//! pays the reward from the campaign budget.
//!
//! # How it works
//!
//! 1. A verify request claims the unique (action, user) execution slot
//! 2. Eligibility rules and the action's proof strategy run against the user
//! 3. The reward is reserved from the campaign budget in one atomic step
//! 4. Payouts send a transfer carrying a stable reference, so retries and
//!    lost responses never pay twice
//! 5. Every paid action adds reputation; each week the top gainers share a
//!    prize pool funded by campaign creation fees
//!
//! # Guarantees
//!
//! - A campaign's remaining budget never goes negative
//! - One execution per (action, user), one transfer per execution
//! - Weekly winners are frozen when the week closes

pub mod auth;
pub mod chain;
pub mod config;
pub mod eligibility;
pub mod error;
pub mod ledger;
pub mod payout;
pub mod prizes;
pub mod reputation;
pub mod server;
pub mod social;
pub mod store;
pub mod sweeps;
pub mod testing;
pub mod types;
pub mod verification;

pub use chain::LedgerClient;
pub use config::Config;
pub use eligibility::{ChainReader, Eligibility, EligibilityChecker, SocialVerifier};
pub use error::{IneligibleReason, RewardError};
pub use ledger::BudgetLedger;
pub use payout::{ClaimOutcome, PayoutOutcome, PayoutProcessor, TransferError, TransferSender};
pub use prizes::PrizeDistributor;
pub use reputation::ReputationScorer;
pub use social::SocialClient;
pub use store::{MemoryStore, PgStorage, Store};
pub use sweeps::Sweeps;
pub use verification::{VerificationEngine, VerifyRequest};
