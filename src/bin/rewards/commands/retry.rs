//! Retry command - admin re-drive of failed payouts

use crate::client::RewardsClient;
use crate::style::*;
use crate::RetryTarget;
use anyhow::Result;

pub async fn run(server: &str, admin_token: &str, target: RetryTarget) -> Result<()> {
    let client = RewardsClient::new(server);

    match target {
        RetryTarget::Execution { id } => {
            print_header(&format!("Retry Execution {}", id));
            let body = client
                .admin_retry(&format!("execution/{}", id), admin_token)
                .await?;
            let outcome = body
                .get("outcome")
                .and_then(|o| o.as_str())
                .unwrap_or("unknown");
            println!("Outcome: {}", style_status(outcome));
            if let Some(reason) = body.get("reason").and_then(|r| r.as_str()) {
                println!("Reason:  {}", reason);
            }
            if let Some(signature) = body.get("signature").and_then(|s| s.as_str()) {
                println!("Signature: {}", style_dim(signature));
            }
        }
        RetryTarget::Prize { week_id, rank } => {
            let path = match rank {
                Some(rank) => format!("prize/{}/winner/{}", week_id, rank),
                None => format!("prize/{}", week_id),
            };
            print_header(&format!("Retry Prize Week {}", week_id));
            let body = client.admin_retry(&path, admin_token).await?;
            let status = body
                .pointer("/week/status")
                .and_then(|s| s.as_str())
                .unwrap_or("unknown");
            println!("Week status: {}", style_status(status));
        }
    }

    Ok(())
}
