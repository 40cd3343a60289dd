//! Reward engine API client

use anyhow::{anyhow, Result};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Debug, Serialize)]
pub struct VerifyRequest<'a> {
    pub action_id: i64,
    pub user_wallet: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct ClaimRequest<'a> {
    pub wallet: &'a str,
    pub execution_ids: &'a [i64],
}

/// One claimed execution and how it went
#[derive(Debug, Deserialize)]
pub struct ClaimResult {
    pub execution_id: i64,
    pub outcome: String,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PendingReward {
    pub execution_id: i64,
    pub campaign_id: i64,
    pub action_id: i64,
    pub status: String,
    pub amount: String,
    pub token_mint: String,
    #[serde(default)]
    pub hold_until: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub wallet_address: String,
    pub reputation_score: i64,
}

#[derive(Debug, Deserialize)]
pub struct PrizeWinner {
    pub rank: u32,
    pub wallet_address: String,
    pub prize_amount: String,
    pub reputation_delta: i64,
    pub status: String,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PrizeWeek {
    pub id: i64,
    pub week_number: u32,
    pub start_date: String,
    pub total_prize_pool: String,
    pub status: String,
    pub winners: Vec<PrizeWinner>,
}

pub struct RewardsClient {
    client: Client,
    base_url: String,
}

impl RewardsClient {
    pub fn new(server_url: &str) -> Self {
        // Build HTTP client with timeout, falling back to default client if builder fails
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send and decode the body; non-2xx responses become errors carrying
    /// the server's reason
    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Value> {
        let resp = request.send().await?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);

        if status.is_success() {
            Ok(body)
        } else {
            let reason = body
                .get("reason")
                .and_then(|r| r.as_str())
                .unwrap_or("Unknown error");
            Err(anyhow!("{} failed ({}): {}", what, status, reason))
        }
    }

    pub async fn verify(&self, request: &VerifyRequest<'_>) -> Result<Value> {
        let req = self.client.post(self.url("verify")).json(request);
        let body = self.send(req, "Verification").await?;
        Ok(body.get("execution").cloned().unwrap_or(Value::Null))
    }

    pub async fn claim(&self, request: &ClaimRequest<'_>) -> Result<Vec<ClaimResult>> {
        let req = self.client.post(self.url("claim")).json(request);
        let body = self.send(req, "Claim").await?;
        Ok(serde_json::from_value(
            body.get("results").cloned().unwrap_or_else(|| Value::Array(vec![])),
        )?)
    }

    pub async fn pending(&self, wallet: &str, campaign_id: Option<i64>) -> Result<Vec<PendingReward>> {
        let mut query = vec![("wallet", wallet.to_string())];
        if let Some(id) = campaign_id {
            query.push(("campaign_id", id.to_string()));
        }
        let req = self.client.get(self.url("rewards/pending")).query(&query);
        let body = self.send(req, "Fetching pending rewards").await?;
        Ok(serde_json::from_value(
            body.get("rewards").cloned().unwrap_or_else(|| Value::Array(vec![])),
        )?)
    }

    pub async fn leaderboard(&self, limit: usize) -> Result<Vec<LeaderboardEntry>> {
        let req = self
            .client
            .get(self.url(&format!("leaderboard?limit={}", limit)));
        let body = self.send(req, "Fetching leaderboard").await?;
        Ok(serde_json::from_value(
            body.get("leaderboard").cloned().unwrap_or_else(|| Value::Array(vec![])),
        )?)
    }

    pub async fn prizes(&self, limit: usize) -> Result<Vec<PrizeWeek>> {
        let req = self.client.get(self.url(&format!("prizes?limit={}", limit)));
        let body = self.send(req, "Fetching prize history").await?;
        Ok(serde_json::from_value(
            body.get("weeks").cloned().unwrap_or_else(|| Value::Array(vec![])),
        )?)
    }

    /// `path` is relative to `/admin/retry/`
    pub async fn admin_retry(&self, path: &str, admin_token: &str) -> Result<Value> {
        let req = self
            .client
            .post(self.url(&format!("admin/retry/{}", path)))
            .header(ADMIN_TOKEN_HEADER, admin_token);
        self.send(req, "Retry").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_strips_trailing_slash() {
        let client = RewardsClient::new("http://localhost:8080/");
        assert_eq!(client.base_url, "http://localhost:8080");
    }

    #[test]
    fn test_url_joins_paths() {
        let client = RewardsClient::new("http://localhost:8080");
        assert_eq!(
            client.url("/admin/retry/execution/7"),
            "http://localhost:8080/admin/retry/execution/7"
        );
        assert_eq!(client.url("claim"), "http://localhost:8080/claim");
    }

    #[test]
    fn test_claim_result_parses_flattened_outcome() {
        let item: ClaimResult = serde_json::from_str(
            r#"{"execution_id":3,"outcome":"pending","reason":"rpc timeout"}"#,
        )
        .unwrap();
        assert_eq!(item.outcome, "pending");
        assert_eq!(item.reason.as_deref(), Some("rpc timeout"));
        assert!(item.signature.is_none());
    }
}
