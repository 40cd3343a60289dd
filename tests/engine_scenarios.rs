//! End-to-end scenarios against the in-memory store and scripted fakes

use std::sync::Arc;
use std::time::Duration;

use action_rewards::auth::visit_receipt;
use action_rewards::config::Config;
use action_rewards::store::{MemoryStore, NewAction, NewCampaign, NewUser, Store};
use action_rewards::testing::{FakeChain, FakeSocial};
use action_rewards::types::{
    ActionId, ActionKind, CampaignId, CampaignStatus, ExecutionStatus, PrizeWeek,
    PrizeWeekStatus, ReputationEvent, Requirements, TokenAmount, User, UserStatus, WinnerStatus,
};
use action_rewards::{
    BudgetLedger, PayoutOutcome, PayoutProcessor, PrizeDistributor, ReputationScorer,
    RewardError, TransferError, VerificationEngine, VerifyRequest,
};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use tokio_test::{assert_err, assert_ok};

const SECRET: &str = "scenario-secret";

struct Harness {
    store: Arc<MemoryStore>,
    chain: Arc<FakeChain>,
    ledger: BudgetLedger,
    verification: Arc<VerificationEngine>,
    payouts: Arc<PayoutProcessor>,
    prizes: PrizeDistributor,
}

impl Harness {
    fn new() -> Self {
        let config = Config::default();
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(FakeChain::new());
        let verification = Arc::new(VerificationEngine::new(
            store.clone(),
            chain.clone(),
            Arc::new(FakeSocial::new()),
            &config.verification,
            Some(SECRET.to_string()),
        ));
        let payouts = Arc::new(PayoutProcessor::new(
            store.clone(),
            chain.clone(),
            ReputationScorer::new(config.prizes.points_per_paid_action),
            config.payout.clone(),
            Duration::from_secs(5),
        ));
        let prizes = PrizeDistributor::new(
            store.clone(),
            payouts.clone(),
            config.prizes.clone(),
            config.ledger.prize_mint.clone(),
        );
        Self {
            ledger: BudgetLedger::new(store.clone()),
            store,
            chain,
            verification,
            payouts,
            prizes,
        }
    }

    async fn campaign(&self, budget: u64) -> CampaignId {
        self.store
            .insert_campaign(NewCampaign {
                title: "Scenario".to_string(),
                token_mint: "RewardMint".to_string(),
                total_budget: TokenAmount::from_tokens(budget),
                status: CampaignStatus::Active,
                creation_fee_paid: true,
                requirements: Requirements::default(),
                holder_rule: None,
            })
            .await
            .unwrap()
            .id
    }

    async fn website_action(&self, campaign_id: CampaignId, reward: u64, cap: Option<u32>) -> ActionId {
        self.store
            .insert_action(NewAction {
                campaign_id,
                kind: ActionKind::Website,
                title: "Visit the site".to_string(),
                url: "https://example.com/launch".to_string(),
                reward_amount: TokenAmount::from_tokens(reward),
                max_executions: cap,
            })
            .await
            .unwrap()
            .id
    }

    fn request(&self, action_id: ActionId, wallet: &str) -> VerifyRequest {
        VerifyRequest {
            action_id,
            user_wallet: wallet.to_string(),
            proof: Some(visit_receipt(SECRET, action_id, wallet)),
        }
    }
}

impl Harness {
    /// Close the week of 2024-05-06 for three ranked users. Rank 1 is paid
    /// first and its transfer fails with `rank_one`, if given.
    async fn prize_week_after(&self, rank_one: Option<TransferError>) -> (PrizeWeek, Vec<User>) {
        for _ in 0..3 {
            self.campaign(1_000).await;
        }

        let start = Utc.with_ymd_and_hms(2024, 5, 6, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 5, 13, 0, 0, 0).unwrap() - ChronoDuration::milliseconds(1);
        let inside = start + ChronoDuration::days(2);

        let mut users = Vec::new();
        for (seed, delta) in [(21u8, 50i64), (22, 30), (23, 20)] {
            let user = self
                .store
                .insert_user(NewUser {
                    wallet_address: wallet(seed),
                    status: UserStatus::Active,
                    twitter_handle: None,
                    telegram_handle: None,
                })
                .await
                .unwrap();
            self.store
                .add_reputation(ReputationEvent {
                    user_id: user.id,
                    delta,
                    execution_id: None,
                    recorded_at: inside,
                })
                .await
                .unwrap();
            users.push(user);
        }

        self.chain.fail_next_transfers(rank_one.into_iter().collect());
        let week = self.prizes.close_week(1, start, end).await.unwrap();
        (week, users)
    }

    fn destinations(&self) -> Vec<String> {
        self.chain
            .sent_transfers()
            .into_iter()
            .map(|t| t.destination)
            .collect()
    }
}

/// Deterministic valid wallet address
fn wallet(seed: u8) -> String {
    bs58::encode([seed; 32]).into_string()
}

#[tokio::test]
async fn test_execution_cap_stops_sixth_claim() {
    let h = Harness::new();
    let campaign = h.campaign(100).await;
    let action = h.website_action(campaign, 10, Some(5)).await;

    for seed in 1..=5 {
        let execution = assert_ok!(h.verification.verify(h.request(action, &wallet(seed))).await);
        assert_eq!(execution.status, ExecutionStatus::Verified);
    }

    let err = assert_err!(h.verification.verify(h.request(action, &wallet(6))).await);
    assert!(matches!(err, RewardError::ActionExhausted(id) if id == action));
    assert_eq!(
        h.ledger.remaining(campaign).await.unwrap(),
        TokenAmount::from_tokens(50)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_verify_of_same_pair_creates_one_execution() {
    let h = Harness::new();
    let campaign = h.campaign(100).await;
    let action = h.website_action(campaign, 10, None).await;
    let wallet = wallet(7);

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let engine = h.verification.clone();
            let request = h.request(action, &wallet);
            tokio::spawn(async move { engine.verify(request).await })
        })
        .collect();

    let mut succeeded = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(RewardError::AlreadyExecuted { .. }) => duplicates += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!((succeeded, duplicates), (1, 1));
    assert_eq!(
        h.ledger.remaining(campaign).await.unwrap(),
        TokenAmount::from_tokens(90)
    );
}

#[tokio::test]
async fn test_transient_failures_then_success() {
    let h = Harness::new();
    let campaign = h.campaign(100).await;
    let action = h.website_action(campaign, 10, None).await;
    let execution = h
        .verification
        .verify(h.request(action, &wallet(3)))
        .await
        .unwrap();

    h.chain.fail_next_transfers(vec![
        TransferError::Transient("blockhash expired".to_string()),
        TransferError::Transient("node behind".to_string()),
        TransferError::Transient("rate limited".to_string()),
    ]);

    let first = h.payouts.payout(execution.id).await.unwrap();
    assert!(matches!(first, PayoutOutcome::Retryable(_)));

    // Each sweep runs far enough ahead for any backoff to have elapsed
    let mut now = Utc::now();
    for _ in 0..3 {
        now += ChronoDuration::hours(2);
        h.payouts.retry_due(now, 100).await.unwrap();
    }

    let paid = h.store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(paid.status, ExecutionStatus::Paid);
    assert_eq!(paid.retry_count, 3);
    assert_eq!(h.chain.transfers_sent(), 1);
    assert_eq!(
        h.ledger.remaining(campaign).await.unwrap(),
        TokenAmount::from_tokens(90)
    );
}

#[tokio::test]
async fn test_double_payout_sends_one_transfer() {
    let h = Harness::new();
    let campaign = h.campaign(100).await;
    let action = h.website_action(campaign, 10, None).await;
    let execution = h
        .verification
        .verify(h.request(action, &wallet(4)))
        .await
        .unwrap();

    let first = h.payouts.payout(execution.id).await.unwrap();
    let second = h.payouts.payout(execution.id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(h.chain.transfers_sent(), 1);
}

#[tokio::test]
async fn test_prize_week_with_failed_winner_is_retried_alone() {
    let h = Harness::new();
    let (week, users) = h
        .prize_week_after(Some(TransferError::Permanent("account frozen".to_string())))
        .await;
    assert_eq!(week.status, PrizeWeekStatus::Failed);
    assert_eq!(week.total_prize_pool, TokenAmount::from_tokens(12_000));
    assert_eq!(week.winners.len(), 3);
    assert_eq!(week.winners[0].user_id, users[0].id);
    assert_eq!(week.winners[0].prize_amount, TokenAmount::from_tokens(6_000));
    assert_eq!(week.winners[0].status, WinnerStatus::Failed);
    assert_eq!(week.winners[1].status, WinnerStatus::Paid);
    assert_eq!(week.winners[2].status, WinnerStatus::Paid);
    assert_eq!(h.chain.transfers_sent(), 2);

    let week = h.prizes.retry_winner(week.id, 1).await.unwrap();
    assert_eq!(week.status, PrizeWeekStatus::Completed);
    assert!(week.winners.iter().all(|w| w.status == WinnerStatus::Paid));
    assert_eq!(h.chain.transfers_sent(), 3);
    assert_eq!(h.destinations(), vec![wallet(22), wallet(23), wallet(21)]);
}

#[tokio::test]
async fn test_retry_week_pays_only_unpaid_winners() {
    let h = Harness::new();
    let (week, _) = h
        .prize_week_after(Some(TransferError::Transient("node behind".to_string())))
        .await;
    assert_eq!(week.status, PrizeWeekStatus::Failed);
    let paid_before: Vec<Option<String>> = week
        .winners
        .iter()
        .map(|w| w.transaction_signature.clone())
        .collect();

    let week = h.prizes.retry_week(week.id).await.unwrap();
    assert_eq!(week.status, PrizeWeekStatus::Completed);
    assert_eq!(h.chain.transfers_sent(), 3);
    assert_eq!(h.destinations(), vec![wallet(22), wallet(23), wallet(21)]);
    // Ranks 2 and 3 keep the signatures of their original transfers
    assert_eq!(week.winners[1].transaction_signature, paid_before[1]);
    assert_eq!(week.winners[2].transaction_signature, paid_before[2]);

    // A completed week is left alone
    let again = h.prizes.retry_week(week.id).await.unwrap();
    assert_eq!(again.status, PrizeWeekStatus::Completed);
    assert_eq!(h.chain.transfers_sent(), 3);
}

#[tokio::test]
async fn test_concurrent_winner_retries_send_one_transfer() {
    let h = Harness::new();
    let (week, _) = h
        .prize_week_after(Some(TransferError::Permanent("account frozen".to_string())))
        .await;
    h.chain.set_transfer_delay(Some(Duration::from_millis(200)));

    let (first, second) = tokio::join!(
        h.prizes.retry_winner(week.id, 1),
        h.prizes.retry_winner(week.id, 1)
    );
    assert_ok!(first);
    assert_ok!(second);

    assert_eq!(h.chain.transfers_sent(), 3);
    assert_eq!(h.destinations(), vec![wallet(22), wallet(23), wallet(21)]);
    let week = h.store.get_prize_week(week.id).await.unwrap().unwrap();
    assert_eq!(week.status, PrizeWeekStatus::Completed);
    assert_eq!(week.winners[0].status, WinnerStatus::Paid);
}

#[tokio::test]
async fn test_stale_in_flight_winner_found_on_chain_is_paid() {
    let h = Harness::new();
    // Rank 1's transfer lands but the payer never hears back
    h.chain.lose_next_response();
    let (week, _) = h.prize_week_after(None).await;
    assert_eq!(week.winners[0].status, WinnerStatus::Failed);
    assert_eq!(h.chain.transfers_sent(), 3);

    // A payer that claimed the winner and then died
    let attempted = Utc::now() - ChronoDuration::hours(1);
    h.store
        .claim_prize_winner(week.id, 1, &[WinnerStatus::Failed], attempted)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(h.prizes.reconcile_in_flight(Utc::now()).await.unwrap(), 1);
    let week = h.store.get_prize_week(week.id).await.unwrap().unwrap();
    assert_eq!(week.status, PrizeWeekStatus::Completed);
    assert_eq!(week.winners[0].status, WinnerStatus::Paid);
    assert_eq!(h.chain.transfers_sent(), 3);
}

#[tokio::test]
async fn test_stale_in_flight_winner_not_on_chain_is_reopened() {
    let h = Harness::new();
    let (week, _) = h
        .prize_week_after(Some(TransferError::Permanent("account frozen".to_string())))
        .await;
    let attempted = Utc::now() - ChronoDuration::hours(1);
    h.store
        .claim_prize_winner(week.id, 1, &[WinnerStatus::Failed], attempted)
        .await
        .unwrap()
        .unwrap();

    // An in-flight winner blocks retries and keeps the week processing
    let blocked = h.prizes.retry_winner(week.id, 1).await.unwrap();
    assert_eq!(blocked.status, PrizeWeekStatus::Processing);
    assert_eq!(h.chain.transfers_sent(), 2);

    // Within the grace period nothing is settled
    let early = attempted + ChronoDuration::minutes(1);
    assert_eq!(h.prizes.reconcile_in_flight(early).await.unwrap(), 0);

    assert_eq!(h.prizes.reconcile_in_flight(Utc::now()).await.unwrap(), 1);
    let week = h.store.get_prize_week(week.id).await.unwrap().unwrap();
    assert_eq!(week.status, PrizeWeekStatus::Failed);
    assert_eq!(week.winners[0].status, WinnerStatus::Failed);

    let week = h.prizes.retry_winner(week.id, 1).await.unwrap();
    assert_eq!(week.status, PrizeWeekStatus::Completed);
    assert_eq!(h.chain.transfers_sent(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_never_overdraw() {
    let h = Harness::new();
    let campaign = h.campaign(100).await;
    let ledger = Arc::new(BudgetLedger::new(h.store.clone()));

    let handles: Vec<_> = (0..25)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.reserve(campaign, TokenAmount::from_tokens(10)).await })
        })
        .collect();

    let mut reserved = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            reserved += 1;
        }
    }
    assert_eq!(reserved, 10);
    assert_eq!(ledger.remaining(campaign).await.unwrap(), TokenAmount::ZERO);
}

#[tokio::test]
async fn test_reserve_release_round_trip_has_no_drift() {
    let h = Harness::new();
    let campaign = h.campaign(100).await;
    let amount: TokenAmount = "3.333333333".parse().unwrap();

    for _ in 0..10 {
        let reservation = h.ledger.reserve(campaign, amount).await.unwrap();
        assert_eq!(h.ledger.release(reservation.id).await.unwrap(), amount);
    }
    assert_eq!(
        h.ledger.remaining(campaign).await.unwrap(),
        TokenAmount::from_tokens(100)
    );
}
