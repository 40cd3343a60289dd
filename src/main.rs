//! Reward Engine Server
//!
//! Verifies campaign actions, pays rewards and runs the periodic sweeps

use std::sync::Arc;

use action_rewards::server::{run_server, AppState};
use action_rewards::{
    Config, LedgerClient, MemoryStore, PayoutProcessor, PgStorage, PrizeDistributor,
    ReputationScorer, SocialClient, Store, Sweeps, VerificationEngine,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting reward engine server");

    let config = Config::load()?;

    let store: Arc<dyn Store> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let storage = PgStorage::new(&database_url, &config.database).await?;
            info!("PostgreSQL storage initialized");
            Arc::new(storage)
        }
        Err(_) => {
            warn!("DATABASE_URL not set - using in-memory storage, data will not persist");
            Arc::new(MemoryStore::new())
        }
    };

    let receipt_secret = Config::receipt_secret();
    if receipt_secret.is_none() {
        warn!("RECEIPT_SECRET not set - website actions cannot be verified");
    }
    let admin_token = Config::admin_token();
    if admin_token.is_none() {
        warn!("ADMIN_TOKEN not set - admin endpoints are disabled");
    }

    let ledger_client = Arc::new(LedgerClient::new(&config.ledger));
    let social_client = Arc::new(SocialClient::new(&config.social));

    let verification = Arc::new(VerificationEngine::new(
        store.clone(),
        ledger_client.clone(),
        social_client,
        &config.verification,
        receipt_secret,
    ));
    let payouts = Arc::new(PayoutProcessor::new(
        store.clone(),
        ledger_client,
        ReputationScorer::new(config.prizes.points_per_paid_action),
        config.payout.clone(),
        config.ledger.call_timeout(),
    ));
    let prizes = Arc::new(PrizeDistributor::new(
        store.clone(),
        payouts.clone(),
        config.prizes.clone(),
        config.ledger.prize_mint.clone(),
    ));

    let sweeps = Arc::new(Sweeps::new(
        store.clone(),
        verification.clone(),
        payouts.clone(),
        prizes.clone(),
        config.sweeps.clone(),
    ));
    let _sweep_handles = sweeps.spawn();

    let state = Arc::new(AppState {
        store,
        verification,
        payouts,
        prizes,
        admin_token,
        started_at: std::time::Instant::now(),
    });

    run_server(&config.server.host, config.server.port, state).await?;

    Ok(())
}
