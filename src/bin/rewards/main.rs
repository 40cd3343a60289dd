//! Action Rewards CLI
//!
//! Command-line interface for the reward engine server.

mod client;
mod commands;
mod style;

use clap::{Parser, Subcommand};
use style::*;

#[derive(Parser)]
#[command(name = "rewards")]
#[command(version)]
#[command(about = "Action Rewards - check, claim and administer campaign rewards", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Reward engine server URL
    #[arg(
        short,
        long,
        env = "REWARDS_URL",
        default_value = "http://127.0.0.1:8080",
        global = true
    )]
    server: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List rewards still owed to a wallet
    #[command(visible_alias = "p")]
    Pending {
        /// Wallet address
        #[arg(short, long, env = "REWARDS_WALLET")]
        wallet: String,

        /// Only show one campaign
        #[arg(short, long)]
        campaign: Option<i64>,
    },

    /// Claim verified rewards
    #[command(visible_alias = "c")]
    Claim {
        #[arg(short, long, env = "REWARDS_WALLET")]
        wallet: String,

        /// Execution ids to claim; all claimable rewards when omitted
        execution_ids: Vec<i64>,
    },

    /// Submit an action for verification
    #[command(visible_alias = "v")]
    Verify {
        /// Action id
        action_id: i64,

        #[arg(short, long, env = "REWARDS_WALLET")]
        wallet: String,

        /// Proof for the action (visit receipt for website actions)
        #[arg(short, long)]
        proof: Option<String>,
    },

    /// Re-drive a failed payout (admin)
    Retry {
        /// Admin token
        #[arg(long, env = "ADMIN_TOKEN", hide_env_values = true)]
        admin_token: String,

        #[command(subcommand)]
        target: RetryTarget,
    },

    /// View the reputation leaderboard
    #[command(visible_alias = "lb")]
    Leaderboard {
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show weekly prize history
    Prizes {
        /// Number of weeks to show
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },
}

#[derive(Subcommand)]
pub enum RetryTarget {
    /// A failed execution payout
    Execution { id: i64 },
    /// A prize week, or a single winner of it
    Prize {
        week_id: i64,
        /// Only retry this rank
        #[arg(short, long)]
        rank: Option<u32>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt().with_env_filter("info").init();
    }

    let result = match cli.command {
        Commands::Pending { wallet, campaign } => {
            commands::pending::run(&cli.server, &wallet, campaign).await
        }
        Commands::Claim {
            wallet,
            execution_ids,
        } => commands::claim::run(&cli.server, &wallet, execution_ids).await,
        Commands::Verify {
            action_id,
            wallet,
            proof,
        } => commands::verify::run(&cli.server, action_id, &wallet, proof.as_deref()).await,
        Commands::Retry {
            admin_token,
            target,
        } => commands::retry::run(&cli.server, &admin_token, target).await,
        Commands::Leaderboard { limit } => commands::leaderboard::run(&cli.server, limit).await,
        Commands::Prizes { limit } => commands::prizes::run(&cli.server, limit).await,
    };

    if let Err(e) = result {
        print_error(&format!("{}", e));
        std::process::exit(1);
    }
}
