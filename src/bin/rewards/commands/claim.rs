//! Claim command - pay out verified rewards

use crate::client::{ClaimRequest, RewardsClient};
use crate::style::*;
use anyhow::Result;

pub async fn run(server: &str, wallet: &str, execution_ids: Vec<i64>) -> Result<()> {
    print_header("Claim Rewards");

    let client = RewardsClient::new(server);

    let execution_ids: Vec<i64> = if execution_ids.is_empty() {
        client
            .pending(wallet, None)
            .await?
            .into_iter()
            .filter(|r| r.status == "verified" || r.status == "ready")
            .map(|r| r.execution_id)
            .collect()
    } else {
        execution_ids
    };

    if execution_ids.is_empty() {
        print_info("No claimable rewards.");
        return Ok(());
    }

    let results = client
        .claim(&ClaimRequest {
            wallet,
            execution_ids: &execution_ids,
        })
        .await?;

    let mut paid = 0;
    for item in &results {
        match item.outcome.as_str() {
            "success" => {
                paid += 1;
                print_success(&format!(
                    "Execution {} paid ({})",
                    item.execution_id,
                    style_dim(item.signature.as_deref().unwrap_or("?"))
                ));
            }
            "pending" => print_warning(&format!(
                "Execution {} will be retried: {}",
                item.execution_id,
                item.reason.as_deref().unwrap_or("temporary failure")
            )),
            _ => print_error(&format!(
                "Execution {} rejected: {}",
                item.execution_id,
                item.reason.as_deref().unwrap_or("unknown reason")
            )),
        }
    }

    println!();
    println!("Paid {} of {}", style_bold(&paid.to_string()), results.len());
    Ok(())
}
