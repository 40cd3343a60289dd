//! Reward Engine Server
//!
//! HTTP endpoints for verification, claims and the admin/UI collaborators.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::auth;
use crate::error::RewardError;
use crate::payout::{ClaimOutcome, PayoutProcessor};
use crate::prizes::PrizeDistributor;
use crate::store::Store;
use crate::types::{CampaignId, ExecutionId, PrizeWeekId};
use crate::verification::{VerificationEngine, VerifyRequest};

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub verification: Arc<VerificationEngine>,
    pub payouts: Arc<PayoutProcessor>,
    pub prizes: Arc<PrizeDistributor>,
    pub admin_token: Option<String>,
    pub started_at: std::time::Instant,
}

type ApiResponse = (StatusCode, Json<serde_json::Value>);

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/verify", post(verify_handler))
        .route("/claim", post(claim_handler))
        .route("/rewards/pending", get(pending_handler))
        .route("/leaderboard", get(leaderboard_handler))
        .route("/prizes", get(prizes_handler))
        .route("/admin/retry/execution/:id", post(retry_execution_handler))
        .route("/admin/retry/prize/:id", post(retry_prize_week_handler))
        .route(
            "/admin/retry/prize/:id/winner/:rank",
            post(retry_prize_winner_handler),
        )
        .route("/admin/users/:wallet/social", post(link_social_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP status for a domain error
pub fn status_for(err: &RewardError) -> StatusCode {
    match err {
        RewardError::Validation(_) => StatusCode::BAD_REQUEST,
        RewardError::Ineligible(_) => StatusCode::FORBIDDEN,
        RewardError::InsufficientBudget { .. }
        | RewardError::CampaignExhausted(_)
        | RewardError::ActionExhausted(_)
        | RewardError::AlreadyExecuted { .. } => StatusCode::CONFLICT,
        RewardError::NotFound(_) => StatusCode::NOT_FOUND,
        RewardError::FatalPayout(_) => StatusCode::UNPROCESSABLE_ENTITY,
        RewardError::TransientPayout(_) | RewardError::External(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RewardError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        RewardError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: RewardError) -> ApiResponse {
    let status = status_for(&err);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    }
    let mut body = json!(ClaimOutcome::from(&err));
    if let RewardError::AlreadyExecuted { execution_id } = err {
        body["execution_id"] = json!(execution_id);
    }
    (status, Json(body))
}

fn ok(body: serde_json::Value) -> ApiResponse {
    (StatusCode::OK, Json(body))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiResponse> {
    let provided = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    if auth::is_admin(state.admin_token.as_deref(), provided) {
        Ok(())
    } else {
        warn!("Rejected admin request without a valid token");
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "outcome": "rejected",
                "code": "unauthorized",
                "reason": "admin token required",
            })),
        ))
    }
}

// ============================================================================
// PUBLIC ENDPOINTS
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub uptime_secs: u64,
    pub version: String,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn verify_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VerifyRequest>,
) -> ApiResponse {
    match state.verification.verify(request).await {
        Ok(execution) => ok(json!({
            "outcome": "success",
            "execution": execution,
        })),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub wallet: String,
    pub execution_ids: Vec<ExecutionId>,
}

async fn claim_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ClaimRequest>,
) -> ApiResponse {
    if request.execution_ids.is_empty() {
        return error_response(RewardError::Validation(
            "execution_ids must not be empty".to_string(),
        ));
    }
    match state
        .payouts
        .claim(&request.wallet, &request.execution_ids)
        .await
    {
        Ok(items) => ok(json!({ "results": items })),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    pub wallet: String,
    pub campaign_id: Option<CampaignId>,
}

async fn pending_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PendingQuery>,
) -> ApiResponse {
    if !auth::is_valid_wallet_address(&query.wallet) {
        return error_response(RewardError::Validation(format!(
            "invalid wallet address '{}'",
            query.wallet
        )));
    }
    let user = match state.store.get_user_by_wallet(&query.wallet).await {
        Ok(Some(user)) => user,
        Ok(None) => return ok(json!({ "wallet": query.wallet, "rewards": [] })),
        Err(e) => return error_response(RewardError::Storage(e)),
    };
    match state.store.pending_rewards(user.id, query.campaign_id).await {
        Ok(rewards) => ok(json!({ "wallet": query.wallet, "rewards": rewards })),
        Err(e) => error_response(RewardError::Storage(e)),
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub wallet_address: String,
    pub reputation_score: i64,
}

async fn leaderboard_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResponse {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    match state.store.top_users_by_reputation(limit).await {
        Ok(users) => {
            let leaderboard: Vec<LeaderboardEntry> = users
                .into_iter()
                .enumerate()
                .map(|(i, user)| LeaderboardEntry {
                    rank: i + 1,
                    wallet_address: user.wallet_address,
                    reputation_score: user.reputation_score,
                })
                .collect();
            ok(json!({ "leaderboard": leaderboard }))
        }
        Err(e) => error_response(RewardError::Storage(e)),
    }
}

async fn prizes_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResponse {
    let limit = query.limit.unwrap_or(10).clamp(1, 100);
    match state.prizes.history(limit).await {
        Ok(weeks) => ok(json!({ "weeks": weeks })),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// ADMIN ENDPOINTS
// ============================================================================

async fn retry_execution_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<ExecutionId>,
) -> ApiResponse {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    info!(execution_id = id, "Admin retry requested");
    match state.payouts.admin_retry(id).await {
        Ok(outcome) => ok(json!(ClaimOutcome::from(outcome))),
        Err(e) => error_response(e),
    }
}

async fn retry_prize_week_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<PrizeWeekId>,
) -> ApiResponse {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    match state.prizes.retry_week(id).await {
        Ok(week) => ok(json!({ "week": week })),
        Err(e) => error_response(e),
    }
}

async fn retry_prize_winner_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, rank)): Path<(PrizeWeekId, u32)>,
) -> ApiResponse {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    match state.prizes.retry_winner(id, rank).await {
        Ok(week) => ok(json!({ "week": week })),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct LinkSocialRequest {
    #[serde(default)]
    pub twitter_handle: Option<String>,
    #[serde(default)]
    pub telegram_handle: Option<String>,
}

/// Link social handles to a wallet, registering the wallet if it is new.
/// Handles are written by the operator after the account was proven elsewhere.
async fn link_social_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(wallet): Path<String>,
    Json(request): Json<LinkSocialRequest>,
) -> ApiResponse {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    if !auth::is_valid_wallet_address(&wallet) {
        return error_response(RewardError::Validation(format!(
            "invalid wallet address '{}'",
            wallet
        )));
    }
    if request.twitter_handle.is_none() && request.telegram_handle.is_none() {
        return error_response(RewardError::Validation(
            "twitter_handle or telegram_handle is required".to_string(),
        ));
    }

    let normalize = |raw: Option<String>, platform: &str| -> Result<Option<String>, RewardError> {
        raw.map(|handle| {
            auth::normalize_social_handle(&handle).ok_or_else(|| {
                RewardError::Validation(format!("invalid {} handle '{}'", platform, handle))
            })
        })
        .transpose()
    };
    let twitter = match normalize(request.twitter_handle, "twitter") {
        Ok(handle) => handle,
        Err(e) => return error_response(e),
    };
    let telegram = match normalize(request.telegram_handle, "telegram") {
        Ok(handle) => handle,
        Err(e) => return error_response(e),
    };

    let user = match state.verification.get_or_register_user(&wallet).await {
        Ok(user) => user,
        Err(e) => return error_response(e),
    };
    match state.store.link_social(user.id, twitter, telegram).await {
        Ok(Some(user)) => {
            info!(user_id = user.id, "Social handles linked");
            ok(json!({ "user": user }))
        }
        Ok(None) => error_response(RewardError::NotFound(format!("user with wallet {}", wallet))),
        Err(e) => error_response(RewardError::Storage(e)),
    }
}

/// Run the server
pub async fn run_server(host: &str, port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);
    let addr = format!("{}:{}", host, port);

    info!("Starting reward engine server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::reputation::ReputationScorer;
    use crate::store::{MemoryStore, NewAction, NewCampaign};
    use crate::testing::{FakeChain, FakeSocial};
    use crate::types::{ActionKind, CampaignStatus, Requirements, TokenAmount};
    use axum::http::HeaderValue;

    const WALLET: &str = "4Nd1mBQtrMJVYVfKf2PJy9NZUZdTAsp7D4xWLs4gDB4T";
    const SECRET: &str = "receipt-secret";

    fn app_state(store: Arc<MemoryStore>) -> Arc<AppState> {
        let config = Config::default();
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
            chain,
            ReputationScorer::new(config.prizes.points_per_paid_action),
            config.payout.clone(),
            std::time::Duration::from_secs(5),
        ));
        let prizes = Arc::new(PrizeDistributor::new(
            store.clone(),
            payouts.clone(),
            config.prizes.clone(),
            config.ledger.prize_mint.clone(),
        ));
        Arc::new(AppState {
            store,
            verification,
            payouts,
            prizes,
            admin_token: Some("letmein".to_string()),
            started_at: std::time::Instant::now(),
        })
    }

    async fn website_action(store: &MemoryStore) -> i64 {
        let campaign = store
            .insert_campaign(NewCampaign {
                title: "Launch".to_string(),
                token_mint: "mint".to_string(),
                total_budget: TokenAmount::from_tokens(100),
                status: CampaignStatus::Active,
                creation_fee_paid: true,
                requirements: Requirements::default(),
                holder_rule: None,
            })
            .await
            .unwrap();
        store
            .insert_action(NewAction {
                campaign_id: campaign.id,
                kind: ActionKind::Website,
                title: "Visit".to_string(),
                url: "https://example.com/launch".to_string(),
                reward_amount: TokenAmount::from_tokens(10),
                max_executions: None,
            })
            .await
            .unwrap()
            .id
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&RewardError::ActionExhausted(1)),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&RewardError::Validation("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&RewardError::Timeout("ledger".into())),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[tokio::test]
    async fn test_verify_then_duplicate_is_conflict() {
        let store = Arc::new(MemoryStore::new());
        let action_id = website_action(&store).await;
        let state = app_state(store);

        let request = VerifyRequest {
            action_id,
            user_wallet: WALLET.to_string(),
            proof: Some(auth::visit_receipt(SECRET, action_id, WALLET)),
        };
        let (status, Json(body)) =
            verify_handler(State(state.clone()), Json(request.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "success");
        assert_eq!(body["execution"]["status"], "verified");

        let (status, Json(body)) = verify_handler(State(state), Json(request)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["outcome"], "rejected");
        assert_eq!(body["code"], "already_executed");
    }

    #[tokio::test]
    async fn test_claim_and_pending() {
        let store = Arc::new(MemoryStore::new());
        let action_id = website_action(&store).await;
        let state = app_state(store);

        let (_, Json(body)) = verify_handler(
            State(state.clone()),
            Json(VerifyRequest {
                action_id,
                user_wallet: WALLET.to_string(),
                proof: Some(auth::visit_receipt(SECRET, action_id, WALLET)),
            }),
        )
        .await;
        let execution_id = body["execution"]["id"].as_i64().unwrap();

        let (_, Json(pending)) = pending_handler(
            State(state.clone()),
            Query(PendingQuery {
                wallet: WALLET.to_string(),
                campaign_id: None,
            }),
        )
        .await;
        assert_eq!(pending["rewards"].as_array().unwrap().len(), 1);

        let (status, Json(body)) = claim_handler(
            State(state.clone()),
            Json(ClaimRequest {
                wallet: WALLET.to_string(),
                execution_ids: vec![execution_id],
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"][0]["outcome"], "success");

        let (_, Json(pending)) = pending_handler(
            State(state),
            Query(PendingQuery {
                wallet: WALLET.to_string(),
                campaign_id: None,
            }),
        )
        .await;
        assert!(pending["rewards"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_admin_routes_require_token() {
        let store = Arc::new(MemoryStore::new());
        let state = app_state(store);

        let (status, _) =
            retry_execution_handler(State(state.clone()), HeaderMap::new(), Path(1)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let mut headers = HeaderMap::new();
        headers.insert(ADMIN_TOKEN_HEADER, HeaderValue::from_static("letmein"));
        let (status, Json(body)) =
            retry_execution_handler(State(state), headers, Path(1)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    fn admin_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ADMIN_TOKEN_HEADER, HeaderValue::from_static("letmein"));
        headers
    }

    #[tokio::test]
    async fn test_link_social_registers_and_updates_handles() {
        let store = Arc::new(MemoryStore::new());
        let state = app_state(store.clone());

        let (status, Json(body)) = link_social_handler(
            State(state.clone()),
            admin_headers(),
            Path(WALLET.to_string()),
            Json(LinkSocialRequest {
                twitter_handle: Some("@alice".to_string()),
                telegram_handle: None,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["twitter_handle"], "alice");
        assert!(body["user"]["telegram_handle"].is_null());

        // A later link keeps the handle it does not mention
        let (status, _) = link_social_handler(
            State(state.clone()),
            admin_headers(),
            Path(WALLET.to_string()),
            Json(LinkSocialRequest {
                twitter_handle: None,
                telegram_handle: Some("alice_tg".to_string()),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let user = store.get_user_by_wallet(WALLET).await.unwrap().unwrap();
        assert_eq!(user.twitter_handle.as_deref(), Some("alice"));
        assert_eq!(user.telegram_handle.as_deref(), Some("alice_tg"));
    }

    #[tokio::test]
    async fn test_link_social_rejects_bad_input() {
        let store = Arc::new(MemoryStore::new());
        let state = app_state(store.clone());

        let (status, _) = link_social_handler(
            State(state.clone()),
            HeaderMap::new(),
            Path(WALLET.to_string()),
            Json(LinkSocialRequest {
                twitter_handle: Some("alice".to_string()),
                telegram_handle: None,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, Json(body)) = link_social_handler(
            State(state.clone()),
            admin_headers(),
            Path(WALLET.to_string()),
            Json(LinkSocialRequest {
                twitter_handle: Some("not a handle".to_string()),
                telegram_handle: None,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation");

        let (status, _) = link_social_handler(
            State(state),
            admin_headers(),
            Path(WALLET.to_string()),
            Json(LinkSocialRequest {
                twitter_handle: None,
                telegram_handle: None,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(store.get_user_by_wallet(WALLET).await.unwrap().is_none());
    }
}
