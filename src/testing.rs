//! Scriptable fakes of the external collaborators
//!
//! Used by unit tests and the scenario tests in `tests/`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::eligibility::{ChainReader, Engagement, SocialAccount, SocialVerifier};
use crate::payout::{TransferError, TransferRequest, TransferSender};
use crate::types::TokenAmount;

type BalanceKey = (String, Option<String>);

fn key(wallet: &str, mint: Option<&str>) -> BalanceKey {
    (wallet.to_string(), mint.map(str::to_string))
}

#[derive(Default)]
struct ChainState {
    balances: HashMap<BalanceKey, TokenAmount>,
    wallet_ages: HashMap<String, u32>,
    histories: HashMap<BalanceKey, Vec<Option<TokenAmount>>>,
    fail_reads: bool,
    read_delay: Option<Duration>,
    balance_reads: u64,
    scripted_failures: VecDeque<TransferError>,
    lose_next_response: bool,
    fail_lookups: bool,
    transfer_delay: Option<Duration>,
    /// reference -> signature of every transfer that reached the chain
    landed: HashMap<String, String>,
    sent: Vec<TransferRequest>,
}

/// In-memory chain: balances, wallet ages, balance history and transfers
#[derive(Default)]
pub struct FakeChain {
    state: Mutex<ChainState>,
}

impl FakeChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, wallet: &str, mint: Option<&str>, amount: TokenAmount) {
        self.state.lock().balances.insert(key(wallet, mint), amount);
    }

    pub fn set_wallet_age(&self, wallet: &str, days: u32) {
        self.state.lock().wallet_ages.insert(wallet.to_string(), days);
    }

    /// Daily balances, oldest first; `None` marks a missing snapshot
    pub fn set_history(&self, wallet: &str, mint: Option<&str>, days: Vec<Option<TokenAmount>>) {
        self.state.lock().histories.insert(key(wallet, mint), days);
    }

    /// Make every read fail until switched off
    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Delay every balance read, to widen race windows
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.state.lock().read_delay = delay;
    }

    pub fn balance_reads(&self) -> u64 {
        self.state.lock().balance_reads
    }

    /// Queue failures returned by the next transfer sends, in order
    pub fn fail_next_transfers(&self, failures: Vec<TransferError>) {
        self.state.lock().scripted_failures.extend(failures);
    }

    /// The next transfer lands on chain but the caller sees a transient error
    pub fn lose_next_response(&self) {
        self.state.lock().lose_next_response = true;
    }

    /// Make every transfer lookup fail until switched off
    pub fn fail_lookups(&self, fail: bool) {
        self.state.lock().fail_lookups = fail;
    }

    /// Delay every transfer send, to exercise caller timeouts
    pub fn set_transfer_delay(&self, delay: Option<Duration>) {
        self.state.lock().transfer_delay = delay;
    }

    /// Number of transfers that reached the chain
    pub fn transfers_sent(&self) -> usize {
        self.state.lock().sent.len()
    }

    pub fn sent_transfers(&self) -> Vec<TransferRequest> {
        self.state.lock().sent.clone()
    }
}

#[async_trait]
impl ChainReader for FakeChain {
    async fn balance(&self, wallet: &str, mint: Option<&str>) -> anyhow::Result<TokenAmount> {
        let delay = self.state.lock().read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.fail_reads {
            anyhow::bail!("rpc unavailable");
        }
        state.balance_reads += 1;
        Ok(state
            .balances
            .get(&key(wallet, mint))
            .copied()
            .unwrap_or_default())
    }

    async fn wallet_age_days(&self, wallet: &str) -> anyhow::Result<u32> {
        let state = self.state.lock();
        if state.fail_reads {
            anyhow::bail!("rpc unavailable");
        }
        Ok(state.wallet_ages.get(wallet).copied().unwrap_or(0))
    }

    async fn daily_balances(
        &self,
        wallet: &str,
        mint: Option<&str>,
        days: u32,
    ) -> anyhow::Result<Vec<Option<TokenAmount>>> {
        let state = self.state.lock();
        if state.fail_reads {
            anyhow::bail!("rpc unavailable");
        }
        let history = state
            .histories
            .get(&key(wallet, mint))
            .cloned()
            .unwrap_or_default();
        let skip = history.len().saturating_sub(days as usize);
        Ok(history.into_iter().skip(skip).collect())
    }
}

#[async_trait]
impl TransferSender for FakeChain {
    async fn send_transfer(&self, request: &TransferRequest) -> Result<String, TransferError> {
        let delay = self.state.lock().transfer_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(failure) = state.scripted_failures.pop_front() {
            return Err(failure);
        }

        state.sent.push(request.clone());
        let signature = format!("sig-{}-{}", state.sent.len(), &request.reference[..8.min(request.reference.len())]);
        state
            .landed
            .insert(request.reference.clone(), signature.clone());

        if std::mem::take(&mut state.lose_next_response) {
            return Err(TransferError::Transient("response lost".to_string()));
        }
        Ok(signature)
    }

    async fn lookup_transfer(&self, reference: &str) -> Result<Option<String>, TransferError> {
        let state = self.state.lock();
        if state.fail_lookups {
            return Err(TransferError::Transient("rpc unavailable".to_string()));
        }
        Ok(state.landed.get(reference).cloned())
    }
}

#[derive(Default)]
struct SocialState {
    accounts: HashMap<String, SocialAccount>,
    engagements: HashSet<(Engagement, String, String)>,
    fail_lookups: bool,
    engagement_lookups: u64,
}

/// In-memory social platform
#[derive(Default)]
pub struct FakeSocial {
    state: Mutex<SocialState>,
}

impl FakeSocial {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_account(&self, handle: &str, account_age_days: u32, followers: u32) {
        self.state.lock().accounts.insert(
            handle.to_string(),
            SocialAccount {
                handle: handle.to_string(),
                account_age_days,
                followers,
            },
        );
    }

    pub fn engage(&self, engagement: Engagement, handle: &str, target: &str) {
        self.state
            .lock()
            .engagements
            .insert((engagement, handle.to_string(), target.to_string()));
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.state.lock().fail_lookups = fail;
    }

    pub fn engagement_lookups(&self) -> u64 {
        self.state.lock().engagement_lookups
    }
}

#[async_trait]
impl SocialVerifier for FakeSocial {
    async fn account(&self, handle: &str) -> anyhow::Result<Option<SocialAccount>> {
        let state = self.state.lock();
        if state.fail_lookups {
            anyhow::bail!("social api unavailable");
        }
        Ok(state.accounts.get(handle).cloned())
    }

    async fn has_engaged(
        &self,
        engagement: Engagement,
        handle: &str,
        target: &str,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        if state.fail_lookups {
            anyhow::bail!("social api unavailable");
        }
        state.engagement_lookups += 1;
        Ok(state
            .engagements
            .contains(&(engagement, handle.to_string(), target.to_string())))
    }
}
