//! Social platform API client
//!
//! Looks up linked accounts and checks engagement against the social
//! gateway configured in `[social]`. SOCIAL_API_TOKEN is sent as a bearer
//! token when set.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{Config, SocialConfig};
use crate::eligibility::{Engagement, SocialAccount, SocialVerifier};

#[derive(Debug, Deserialize)]
struct AccountResponse {
    handle: String,
    account_age_days: u32,
    followers: u32,
}

#[derive(Debug, Deserialize)]
struct EngagementResponse {
    engaged: bool,
}

fn engagement_path(engagement: Engagement) -> &'static str {
    match engagement {
        Engagement::Follow => "follow",
        Engagement::Retweet => "retweet",
        Engagement::Like => "like",
        Engagement::Comment => "comment",
        Engagement::ChannelMember => "channel_member",
    }
}

pub struct SocialClient {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl SocialClient {
    pub fn new(config: &SocialConfig) -> Self {
        let token = Config::social_api_token();
        if token.is_some() {
            info!("Social API client initialized with token");
        } else {
            warn!("SOCIAL_API_TOKEN not set - requests may be rate limited");
        }

        let client = reqwest::Client::builder()
            .timeout(config.call_timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn build_request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .get(format!("{}{}", self.api_url, path))
            .header("User-Agent", "action-rewards/0.1.0")
            .header("Accept", "application/json");

        if let Some(ref token) = self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        req
    }
}

#[async_trait]
impl SocialVerifier for SocialClient {
    async fn account(&self, handle: &str) -> Result<Option<SocialAccount>> {
        let handle = handle.trim_start_matches('@');
        let response = self
            .build_request(&format!("/users/{}", handle))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Social account {} not found", handle);
            return Ok(None);
        }
        if !response.status().is_success() {
            anyhow::bail!("Social API error: {}", response.status());
        }

        let account: AccountResponse = response.json().await?;
        Ok(Some(SocialAccount {
            handle: account.handle,
            account_age_days: account.account_age_days,
            followers: account.followers,
        }))
    }

    async fn has_engaged(&self, engagement: Engagement, handle: &str, target: &str) -> Result<bool> {
        let handle = handle.trim_start_matches('@');
        let response = self
            .build_request(&format!("/engagements/{}", engagement_path(engagement)))
            .query(&[("handle", handle), ("target", target)])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            anyhow::bail!("Social API error: {}", response.status());
        }

        let body: EngagementResponse = response.json().await?;
        Ok(body.engaged)
    }
}
