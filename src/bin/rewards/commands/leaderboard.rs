//! Leaderboard command

use crate::client::RewardsClient;
use crate::style::*;
use anyhow::Result;

pub async fn run(server: &str, limit: usize) -> Result<()> {
    print_header("Reputation Leaderboard");

    let client = RewardsClient::new(server);
    let entries = client.leaderboard(limit).await?;

    if entries.is_empty() {
        print_info("No users yet.");
        return Ok(());
    }

    println!();
    println!("{:>4}  {:<16}  {:>10}", "Rank", "Wallet", "Reputation");
    println!("{}", "─".repeat(36));

    for entry in &entries {
        let rank = format!("#{}", entry.rank);
        let rank_styled = if entry.rank == 1 {
            style_yellow(&rank)
        } else if entry.rank <= 3 {
            style_cyan(&rank)
        } else {
            rank
        };
        println!(
            "{:>4}  {:<16}  {:>10}",
            rank_styled,
            truncate_wallet(&entry.wallet_address),
            entry.reputation_score
        );
    }

    println!();
    println!("Total users: {}", entries.len());
    Ok(())
}
