//! Verify command - submit an action attempt

use crate::client::{RewardsClient, VerifyRequest};
use crate::style::*;
use anyhow::Result;

pub async fn run(server: &str, action_id: i64, wallet: &str, proof: Option<&str>) -> Result<()> {
    print_header("Verify Action");

    let client = RewardsClient::new(server);
    let execution = client
        .verify(&VerifyRequest {
            action_id,
            user_wallet: wallet,
            proof,
        })
        .await?;

    let status = execution
        .get("status")
        .and_then(|s| s.as_str())
        .unwrap_or("unknown");
    let id = execution.get("id").and_then(|i| i.as_i64()).unwrap_or_default();

    print_success(&format!("Action {} verified", action_id));
    println!("Execution:  {}", style_bold(&id.to_string()));
    println!("Status:     {}", style_status(status));
    if let Some(amount) = execution.get("reserved_amount").and_then(|a| a.as_str()) {
        println!("Reward:     {}", style_green(amount));
    }
    if let Some(until) = execution.get("hold_until").and_then(|h| h.as_str()) {
        println!();
        print_info(&format!("Keep holding until {} to unlock the reward", until));
    } else {
        println!();
        println!("To claim, run:");
        println!("  rewards claim --wallet {} {}", wallet, id);
    }

    Ok(())
}
