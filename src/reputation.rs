//! Reputation scoring
//!
//! Pure functions only. Reputation grows when an execution is paid:
//! - each paid action is worth `points_per_paid_action`
//! - a user's score is the registration default plus the sum of their events
//! - weekly rankings use the deltas accrued inside the week
//!
//! Ties are broken by earliest registration, then by user id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::DEFAULT_REPUTATION;
use crate::types::{ExecutionId, ReputationEvent, TokenAmount, User, UserId};

/// A user's standing in one leaderboard period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedUser {
    pub rank: u32,
    pub user_id: UserId,
    pub wallet_address: String,
    pub reputation_delta: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct ReputationScorer {
    points_per_paid_action: i64,
}

impl ReputationScorer {
    pub fn new(points_per_paid_action: i64) -> Self {
        Self {
            points_per_paid_action,
        }
    }

    pub fn points_per_paid_action(&self) -> i64 {
        self.points_per_paid_action
    }

    /// Event recorded when an execution reaches `paid`
    pub fn paid_action_event(
        &self,
        user_id: UserId,
        execution_id: ExecutionId,
        at: DateTime<Utc>,
    ) -> ReputationEvent {
        ReputationEvent {
            user_id,
            delta: self.points_per_paid_action,
            execution_id: Some(execution_id),
            recorded_at: at,
        }
    }

    /// Trust score from a user's full event history
    pub fn trust_score(&self, history: &[ReputationEvent]) -> i64 {
        history
            .iter()
            .fold(DEFAULT_REPUTATION, |score, e| score.saturating_add(e.delta))
    }

    /// Rank users by the reputation they gained in a period.
    ///
    /// `deltas` pairs a user with their summed delta; users without a positive
    /// delta or without a matching row in `users` are left out.
    pub fn rank(&self, deltas: &[(UserId, i64)], users: &[User], limit: usize) -> Vec<RankedUser> {
        let mut candidates: Vec<(&User, i64)> = deltas
            .iter()
            .filter(|(_, delta)| *delta > 0)
            .filter_map(|(user_id, delta)| {
                users
                    .iter()
                    .find(|u| u.id == *user_id)
                    .map(|user| (user, *delta))
            })
            .collect();

        candidates.sort_by(|(a, da), (b, db)| {
            db.cmp(da)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        candidates
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(i, (user, delta))| RankedUser {
                rank: (i + 1) as u32,
                user_id: user.id,
                wallet_address: user.wallet_address.clone(),
                reputation_delta: delta,
            })
            .collect()
    }
}

/// Split a prize pool by per-rank basis points.
///
/// Rounding dust stays in the pool; the sum never exceeds `pool`.
pub fn split_pool(pool: TokenAmount, rank_shares_bps: &[u32]) -> Vec<TokenAmount> {
    rank_shares_bps
        .iter()
        .map(|bps| pool.share_bps(*bps))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserStatus;
    use chrono::Duration;

    fn user(id: UserId, registered_days_ago: i64) -> User {
        User {
            id,
            wallet_address: format!("wallet-{}", id),
            reputation_score: DEFAULT_REPUTATION,
            status: UserStatus::Active,
            twitter_handle: None,
            telegram_handle: None,
            created_at: Utc::now() - Duration::days(registered_days_ago),
        }
    }

    #[test]
    fn test_trust_score_starts_at_default() {
        let scorer = ReputationScorer::new(10);
        assert_eq!(scorer.trust_score(&[]), DEFAULT_REPUTATION);

        let now = Utc::now();
        let history = vec![
            scorer.paid_action_event(1, 1, now),
            scorer.paid_action_event(1, 2, now),
        ];
        assert_eq!(scorer.trust_score(&history), DEFAULT_REPUTATION + 20);
    }

    #[test]
    fn test_rank_orders_by_delta_then_registration() {
        let scorer = ReputationScorer::new(10);
        let users = vec![user(1, 5), user(2, 30), user(3, 10), user(4, 1)];
        let deltas = vec![(1, 20), (2, 20), (3, 50), (4, 0)];

        let ranked = scorer.rank(&deltas, &users, 3);
        let order: Vec<UserId> = ranked.iter().map(|r| r.user_id).collect();
        // user 2 registered before user 1
        assert_eq!(order, vec![3, 2, 1]);
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[2].rank, 3);
    }

    #[test]
    fn test_rank_skips_unknown_and_non_positive() {
        let scorer = ReputationScorer::new(10);
        let users = vec![user(1, 5)];
        let ranked = scorer.rank(&[(1, -10), (9, 40)], &users, 3);
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_split_pool_never_exceeds_pool() {
        let pool = TokenAmount::from_base_units(1_000_000_001);
        let shares = split_pool(pool, &[5000, 3000, 2000]);
        let total = shares
            .iter()
            .fold(TokenAmount::ZERO, |acc, s| acc.checked_add(*s).unwrap());
        assert!(total <= pool);
        assert_eq!(shares[0], TokenAmount::from_base_units(500_000_000));
    }
}
