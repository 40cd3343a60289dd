//! Core data model
//!
//! Campaigns own their actions and budget; executions are the audit ledger
//! of every claim attempt; prize weeks own their frozen winners list.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use postgres_types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type CampaignId = i64;
pub type ActionId = i64;
pub type ExecutionId = i64;
pub type UserId = i64;
pub type PrizeWeekId = i64;
pub type ReservationId = Uuid;

/// Number of fractional digits carried by [`TokenAmount`]
pub const TOKEN_DECIMALS: u32 = 9;
const BASE_UNIT: u64 = 1_000_000_000;

// ============================================================================
// FIXED-POINT AMOUNT
// ============================================================================

/// Fixed-point token amount stored as integer base units (9 decimals).
///
/// Serialized as a decimal string so clients never see float rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TokenAmount(u64);

impl TokenAmount {
    pub const ZERO: Self = Self(0);
    /// Largest amount a BIGINT column can hold
    pub const MAX: Self = Self(i64::MAX as u64);

    pub fn from_base_units(units: u64) -> Self {
        Self(units)
    }

    pub fn from_tokens(tokens: u64) -> Self {
        Self(tokens.saturating_mul(BASE_UNIT))
    }

    pub fn base_units(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(&self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(&self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_sub(&self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Multiply by a basis-point share (10_000 = 100%), rounding down.
    pub fn share_bps(&self, bps: u32) -> Self {
        Self(((self.0 as u128 * bps as u128) / 10_000) as u64)
    }

    pub fn checked_mul(&self, factor: u64) -> Option<Self> {
        self.0.checked_mul(factor).map(Self)
    }

    /// Average of a set of amounts, rounding down. Empty input yields zero.
    pub fn average(amounts: &[TokenAmount]) -> Self {
        if amounts.is_empty() {
            return Self::ZERO;
        }
        let sum: u128 = amounts.iter().map(|a| a.0 as u128).sum();
        Self((sum / amounts.len() as u128) as u64)
    }

    /// Base units as a signed value for SQL BIGINT columns
    pub fn to_sql_units(&self) -> Result<i64, AmountOverflow> {
        i64::try_from(self.0).map_err(|_| AmountOverflow(*self))
    }

    pub fn from_sql_units(units: i64) -> Self {
        Self(units.max(0) as u64)
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / BASE_UNIT;
        let frac = self.0 % BASE_UNIT;
        if frac == 0 {
            write!(f, "{}", whole)
        } else {
            let digits = format!("{:09}", frac);
            write!(f, "{}.{}", whole, digits.trim_end_matches('0'))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid token amount '{0}'")]
pub struct ParseAmountError(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("token amount {0} exceeds the storable maximum")]
pub struct AmountOverflow(pub TokenAmount);

impl FromStr for TokenAmount {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseAmountError(s.to_string());
        let s = s.trim();
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(err());
        }
        if frac.len() > TOKEN_DECIMALS as usize {
            return Err(err());
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(err());
        }
        let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| err())? };
        let frac_units: u64 = if frac.is_empty() {
            0
        } else {
            let padded = format!("{:0<width$}", frac, width = TOKEN_DECIMALS as usize);
            padded.parse().map_err(|_| err())?
        };
        whole
            .checked_mul(BASE_UNIT)
            .and_then(|w| w.checked_add(frac_units))
            .map(Self)
            .filter(|amount| *amount <= Self::MAX)
            .ok_or_else(err)
    }
}

impl TryFrom<String> for TokenAmount {
    type Error = ParseAmountError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TokenAmount> for String {
    fn from(value: TokenAmount) -> Self {
        value.to_string()
    }
}

// ============================================================================
// CAMPAIGNS & ACTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "snake_case")]
#[postgres(name = "campaign_status")]
pub enum CampaignStatus {
    #[postgres(name = "draft")]
    Draft,
    #[postgres(name = "active")]
    Active,
    #[postgres(name = "paused")]
    Paused,
    #[postgres(name = "exhausted")]
    Exhausted,
    #[postgres(name = "closed")]
    Closed,
}

/// Balance that must be sustained for a number of consecutive days
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldingRequirement {
    pub amount: TokenAmount,
    pub days: u32,
}

/// Anti-bot requirements a user must meet to participate in a campaign
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    /// Minimum native wallet balance
    #[serde(default)]
    pub min_balance: Option<TokenAmount>,
    #[serde(default)]
    pub min_wallet_age_days: Option<u32>,
    /// Minimum age of the linked social account
    #[serde(default)]
    pub min_social_account_age_days: Option<u32>,
    #[serde(default)]
    pub min_followers: Option<u32>,
    /// Average daily balance over the trailing `days`
    #[serde(default)]
    pub min_average_holding: Option<HoldingRequirement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub title: String,
    /// Mint of the reward token paid out by this campaign
    pub token_mint: String,
    pub total_budget: TokenAmount,
    pub remaining_budget: TokenAmount,
    pub status: CampaignStatus,
    pub creation_fee_paid: bool,
    pub requirements: Requirements,
    /// Holding rule for `token_holding` actions
    pub holder_rule: Option<HoldingRequirement>,
    pub created_at: DateTime<Utc>,
}

/// Verification kinds. Each variant has exactly one verification strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "snake_case")]
#[postgres(name = "action_kind")]
pub enum ActionKind {
    #[postgres(name = "website")]
    Website,
    #[postgres(name = "telegram")]
    Telegram,
    #[postgres(name = "twitter_follow")]
    TwitterFollow,
    #[postgres(name = "twitter_retweet")]
    TwitterRetweet,
    #[postgres(name = "twitter_like")]
    TwitterLike,
    #[postgres(name = "twitter_comment")]
    TwitterComment,
    #[postgres(name = "token_holding")]
    TokenHolding,
}

impl ActionKind {
    pub const ALL: [ActionKind; 7] = [
        ActionKind::Website,
        ActionKind::Telegram,
        ActionKind::TwitterFollow,
        ActionKind::TwitterRetweet,
        ActionKind::TwitterLike,
        ActionKind::TwitterComment,
        ActionKind::TokenHolding,
    ];

    pub fn is_twitter(&self) -> bool {
        matches!(
            self,
            ActionKind::TwitterFollow
                | ActionKind::TwitterRetweet
                | ActionKind::TwitterLike
                | ActionKind::TwitterComment
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub campaign_id: CampaignId,
    pub kind: ActionKind,
    pub title: String,
    pub url: String,
    pub reward_amount: TokenAmount,
    pub max_executions: Option<u32>,
}

impl Action {
    /// Target identifier encoded as the last path segment of the action URL
    pub fn target(&self) -> &str {
        self.url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }
}

// ============================================================================
// EXECUTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "snake_case")]
#[postgres(name = "execution_status")]
pub enum ExecutionStatus {
    #[postgres(name = "pending")]
    Pending,
    #[postgres(name = "verified")]
    Verified,
    #[postgres(name = "rejected")]
    Rejected,
    #[postgres(name = "waiting")]
    Waiting,
    /// Transfer in flight; exactly one payer owns the execution
    #[postgres(name = "holding")]
    Holding,
    #[postgres(name = "ready")]
    Ready,
    #[postgres(name = "paid")]
    Paid,
    #[postgres(name = "failed")]
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Rejected | ExecutionStatus::Paid)
    }

    pub fn is_payable(&self) -> bool {
        matches!(self, ExecutionStatus::Verified | ExecutionStatus::Ready)
    }

    /// Statuses that hold (or consumed) a budget reservation and count
    /// against an action's execution cap
    pub const COUNTED: [ExecutionStatus; 5] = [
        ExecutionStatus::Verified,
        ExecutionStatus::Waiting,
        ExecutionStatus::Holding,
        ExecutionStatus::Ready,
        ExecutionStatus::Paid,
    ];

    /// Statuses shown to a user as rewards still owed
    pub const UNPAID: [ExecutionStatus; 4] = [
        ExecutionStatus::Verified,
        ExecutionStatus::Waiting,
        ExecutionStatus::Holding,
        ExecutionStatus::Ready,
    ];
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Verified => "verified",
            ExecutionStatus::Rejected => "rejected",
            ExecutionStatus::Waiting => "waiting",
            ExecutionStatus::Holding => "holding",
            ExecutionStatus::Ready => "ready",
            ExecutionStatus::Paid => "paid",
            ExecutionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub action_id: ActionId,
    pub campaign_id: CampaignId,
    pub user_id: UserId,
    pub status: ExecutionStatus,
    pub proof: Option<String>,
    pub reserved_amount: TokenAmount,
    pub reservation_id: Option<ReservationId>,
    pub transaction_signature: Option<String>,
    pub retry_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// End of the holding window for `waiting` executions
    pub hold_until: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// Apply a status transition and its accompanying field changes
    pub fn apply(&mut self, to: ExecutionStatus, update: ExecutionUpdate) {
        self.status = to;
        if let Some(reservation_id) = update.reservation_id {
            self.reservation_id = reservation_id;
        }
        if let Some(signature) = update.transaction_signature {
            self.transaction_signature = Some(signature);
        }
        if let Some(retry_count) = update.retry_count {
            self.retry_count = retry_count;
        }
        if let Some(next_attempt_at) = update.next_attempt_at {
            self.next_attempt_at = next_attempt_at;
        }
        if let Some(hold_until) = update.hold_until {
            self.hold_until = hold_until;
        }
        if let Some(error_message) = update.error_message {
            self.error_message = error_message;
        }
        if let Some(paid_at) = update.paid_at {
            self.paid_at = Some(paid_at);
        }
        self.updated_at = Utc::now();
    }
}

/// Insert payload for a fresh execution row
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub action_id: ActionId,
    pub campaign_id: CampaignId,
    pub user_id: UserId,
    pub proof: Option<String>,
    pub reserved_amount: TokenAmount,
}

/// Field changes applied together with a status transition.
///
/// `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct ExecutionUpdate {
    pub reservation_id: Option<Option<ReservationId>>,
    pub transaction_signature: Option<String>,
    pub retry_count: Option<u32>,
    pub next_attempt_at: Option<Option<DateTime<Utc>>>,
    pub hold_until: Option<Option<DateTime<Utc>>>,
    pub error_message: Option<Option<String>>,
    pub paid_at: Option<DateTime<Utc>>,
}

// ============================================================================
// BUDGET RESERVATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "snake_case")]
#[postgres(name = "reservation_state")]
pub enum ReservationState {
    #[postgres(name = "outstanding")]
    Outstanding,
    #[postgres(name = "committed")]
    Committed,
    #[postgres(name = "released")]
    Released,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub campaign_id: CampaignId,
    pub amount: TokenAmount,
    pub state: ReservationState,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// USERS & REPUTATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "snake_case")]
#[postgres(name = "user_status")]
pub enum UserStatus {
    #[postgres(name = "active")]
    Active,
    #[postgres(name = "suspended")]
    Suspended,
    #[postgres(name = "blocked")]
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub wallet_address: String,
    pub reputation_score: i64,
    pub status: UserStatus,
    pub twitter_handle: Option<String>,
    pub telegram_handle: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only record of a reputation change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationEvent {
    pub user_id: UserId,
    pub delta: i64,
    pub execution_id: Option<ExecutionId>,
    pub recorded_at: DateTime<Utc>,
}

// ============================================================================
// PRIZE WEEKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "snake_case")]
#[postgres(name = "prize_week_status")]
pub enum PrizeWeekStatus {
    #[postgres(name = "open")]
    Open,
    #[postgres(name = "processing")]
    Processing,
    #[postgres(name = "completed")]
    Completed,
    #[postgres(name = "failed")]
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinnerStatus {
    Pending,
    /// A transfer is in flight; only the claimant may send
    InFlight,
    Paid,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrizeWinner {
    pub user_id: UserId,
    pub wallet_address: String,
    pub rank: u32,
    pub prize_amount: TokenAmount,
    pub reputation_delta: i64,
    pub status: WinnerStatus,
    pub transaction_signature: Option<String>,
    pub error_message: Option<String>,
    /// When the current transfer attempt was claimed
    #[serde(default)]
    pub attempted_at: Option<DateTime<Utc>>,
}

impl PrizeWinner {
    /// Stable idempotency key for this winner's transfer
    pub fn payout_key(&self, week_id: PrizeWeekId) -> String {
        format!("prize:{}:{}", week_id, self.rank)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrizeWeek {
    pub id: PrizeWeekId,
    pub week_number: u32,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub total_prize_pool: TokenAmount,
    pub status: PrizeWeekStatus,
    pub winners: Vec<PrizeWinner>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a closed week
#[derive(Debug, Clone)]
pub struct NewPrizeWeek {
    pub week_number: u32,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub total_prize_pool: TokenAmount,
    pub winners: Vec<PrizeWinner>,
}

/// A reward still owed to a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingReward {
    pub execution_id: ExecutionId,
    pub campaign_id: CampaignId,
    pub action_id: ActionId,
    pub status: ExecutionStatus,
    pub amount: TokenAmount,
    pub token_mint: String,
    pub hold_until: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_parse_and_display() {
        let a: TokenAmount = "12.5".parse().unwrap();
        assert_eq!(a.base_units(), 12_500_000_000);
        assert_eq!(a.to_string(), "12.5");
        assert_eq!(TokenAmount::from_tokens(100).to_string(), "100");
        assert_eq!("0.000000001".parse::<TokenAmount>().unwrap().base_units(), 1);
    }

    #[test]
    fn test_amount_rejects_garbage() {
        assert!("".parse::<TokenAmount>().is_err());
        assert!("-1".parse::<TokenAmount>().is_err());
        assert!("1.0000000001".parse::<TokenAmount>().is_err());
        assert!("1e9".parse::<TokenAmount>().is_err());
    }

    #[test]
    fn test_amount_bounded_by_bigint() {
        // i64::MAX base units parses, one more does not
        assert_eq!(
            "9223372036.854775807".parse::<TokenAmount>().unwrap(),
            TokenAmount::MAX
        );
        assert!("9223372036.854775808".parse::<TokenAmount>().is_err());
        assert!("18000000000".parse::<TokenAmount>().is_err());

        assert_eq!(TokenAmount::MAX.to_sql_units(), Ok(i64::MAX));
        let too_big = TokenAmount::from_base_units(i64::MAX as u64 + 1);
        assert_eq!(too_big.to_sql_units(), Err(AmountOverflow(too_big)));
    }

    #[test]
    fn test_amount_serde_as_string() {
        let a = TokenAmount::from_tokens(10);
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"10\"");
        let back: TokenAmount = serde_json::from_str("\"0.25\"").unwrap();
        assert_eq!(back.base_units(), 250_000_000);
    }

    #[test]
    fn test_share_bps_rounds_down() {
        let pool = TokenAmount::from_base_units(101);
        assert_eq!(pool.share_bps(5_000).base_units(), 50);
        assert_eq!(pool.share_bps(10_000).base_units(), 101);
    }

    #[test]
    fn test_average() {
        let values = [TokenAmount::from_tokens(1), TokenAmount::from_tokens(3)];
        assert_eq!(TokenAmount::average(&values), TokenAmount::from_tokens(2));
        assert_eq!(TokenAmount::average(&[]), TokenAmount::ZERO);
    }

    #[test]
    fn test_action_target() {
        let action = Action {
            id: 1,
            campaign_id: 1,
            kind: ActionKind::TwitterFollow,
            title: "Follow".to_string(),
            url: "https://x.com/dropy_sol/".to_string(),
            reward_amount: TokenAmount::from_tokens(1),
            max_executions: None,
        };
        assert_eq!(action.target(), "dropy_sol");
    }
}
