//! Operator command line for a Fedigroup instance
//!
//! Uses the same configuration and database as the server.

use clap::{Parser, Subcommand};
use fedigroup::federation::DeliveryResult;
use fedigroup::{AppState, config};

#[derive(Parser)]
#[command(name = "fedigroupctl", version, about = "Administer Fedigroup groups")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new group with its own key pair
    CreateGroup {
        /// Local name, the group becomes `name@domain`
        name: String,
        /// Human readable name (defaults to the local name)
        #[arg(long, default_value = "")]
        display_name: String,
        /// Group description
        #[arg(long, default_value = "")]
        summary: String,
        /// `user@host` handle of the creator
        #[arg(long)]
        creator: Option<String>,
    },
    /// Post a message as the group to all members
    GroupMessage {
        /// Group name
        group: String,
        /// Message text
        message: String,
    },
    /// Boost a remote note (and its thread) into the group
    BoostMessage {
        /// Group name
        group: String,
        /// ActivityPub id of the remote note
        note_id: String,
    },
}

fn print_summary(results: &[DeliveryResult]) {
    let delivered = results.iter().filter(|r| r.success).count();
    for result in results {
        match (&result.error, result.status_code) {
            (None, Some(status)) => println!("  ok   {} ({})", result.inbox_uri, status),
            (None, None) => println!("  ok   {}", result.inbox_uri),
            (Some(error), _) => println!("  FAIL {}: {}", result.inbox_uri, error),
        }
    }
    println!("Delivered to {}/{} inboxes", delivered, results.len());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fedigroup=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::AppConfig::load()?;
    let state = AppState::new(config).await?;
    let groups = state.group_service();

    match cli.command {
        Command::CreateGroup {
            name,
            display_name,
            summary,
            creator,
        } => {
            let group = groups
                .create_group(&name, &display_name, &summary, creator.as_deref())
                .await?;
            println!(
                "Created group {} ({})",
                state.config.server.group_handle(&group.name),
                state.config.server.group_url(&group.name)
            );
        }
        Command::GroupMessage { group, message } => {
            let (note, results) = groups.post_message(&group, &message).await?;
            println!(
                "Posted {}/note/{}",
                state.config.server.base_url(),
                note.id
            );
            print_summary(&results);
        }
        Command::BoostMessage { group, note_id } => {
            let results = groups.boost_note(&group, &note_id).await?;
            println!("Boosted {} into {}", note_id, group);
            print_summary(&results);
        }
    }

    // Ancestor boosts and other scheduled work finish before exit.
    state.delivery.join_background().await;
    Ok(())
}
