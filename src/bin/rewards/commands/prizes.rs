//! Prizes command - weekly prize history

use crate::client::RewardsClient;
use crate::style::*;
use anyhow::Result;

pub async fn run(server: &str, limit: usize) -> Result<()> {
    print_header("Weekly Prizes");

    let client = RewardsClient::new(server);
    let weeks = client.prizes(limit).await?;

    if weeks.is_empty() {
        print_info("No prize weeks closed yet.");
        return Ok(());
    }

    for week in &weeks {
        println!();
        println!(
            "Week {} (id {}, from {})  pool {}  {}",
            style_bold(&week.week_number.to_string()),
            week.id,
            week.start_date,
            style_green(&week.total_prize_pool),
            style_status(&week.status)
        );
        if week.winners.is_empty() {
            println!("  {}", style_dim("no winners"));
        }
        for winner in &week.winners {
            println!(
                "  #{}  {:<16}  +{:<5}  {:>14}  {}",
                winner.rank,
                truncate_wallet(&winner.wallet_address),
                winner.reputation_delta,
                winner.prize_amount,
                style_status(&winner.status)
            );
            if let Some(error) = &winner.error_message {
                println!("      {}", style_red(error));
            }
        }
    }

    Ok(())
}
