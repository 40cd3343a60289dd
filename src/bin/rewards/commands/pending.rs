//! Pending command - rewards still owed to a wallet

use crate::client::RewardsClient;
use crate::style::*;
use anyhow::Result;

pub async fn run(server: &str, wallet: &str, campaign: Option<i64>) -> Result<()> {
    print_header("Pending Rewards");
    println!("Wallet: {}", style_cyan(&truncate_wallet(wallet)));

    let client = RewardsClient::new(server);
    let rewards = client.pending(wallet, campaign).await?;

    if rewards.is_empty() {
        println!();
        print_info("Nothing owed right now.");
        return Ok(());
    }

    println!();
    println!(
        "{:>9}  {:>8}  {:>6}  {:<10}  {:>16}  Note",
        "Execution", "Campaign", "Action", "Status", "Amount"
    );
    println!("{}", "─".repeat(70));

    for reward in &rewards {
        let note = match (&reward.hold_until, reward.status.as_str()) {
            (Some(until), "waiting") => format!("holding until {}", until),
            (_, "verified") | (_, "ready") => "claimable".to_string(),
            _ => String::new(),
        };
        println!(
            "{:>9}  {:>8}  {:>6}  {:<10}  {:>16}  {}",
            reward.execution_id,
            reward.campaign_id,
            reward.action_id,
            style_status(&reward.status),
            reward.amount,
            style_dim(&note)
        );
    }

    println!();
    println!(
        "{} reward(s); token {}",
        rewards.len(),
        style_dim(&truncate_wallet(&rewards[0].token_mint))
    );

    Ok(())
}
