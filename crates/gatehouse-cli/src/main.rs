//! Gatehouse CLI - operator maintenance commands
//!
//! Usage:
//!   gatehouse repair
//!   gatehouse purge-blacklist --days 30
//!   gatehouse invite create --email <email> --customer-id <id> [--ttl-days <n>]
//!   gatehouse invite check <token>
//!   gatehouse invalidate --user-id <id> [--reason security]
//!   gatehouse inspect-token <token>
//!
//! Author: hephaex@gmail.com

use anyhow::Context;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use gatehouse_api::auth::{peek_unverified, CheckOutcome};
use gatehouse_api::state::{AppState, Backends};
use gatehouse_core::{
    schema, AppConfig, LoggingConfig, PgStore, RevocationReason, StaticSecrets, SystemClock,
    MAX_INVITATION_TTL_DAYS,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(about = "Token lifecycle and invitation maintenance")]
#[command(version)]
struct Cli {
    /// TOML config file; falls back to GATEHOUSE_CONFIG, then the environment
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create missing tables and columns, backfill legacy invitation rows
    Repair,
    /// Drop blacklist entries whose token expired more than N days ago
    PurgeBlacklist {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Manage invitations
    Invite {
        #[command(subcommand)]
        action: InviteAction,
    },
    /// Invalidate every session of a user
    Invalidate {
        #[arg(long)]
        user_id: i64,
        /// security, password_change or logout
        #[arg(long, default_value = "security")]
        reason: String,
    },
    /// Print a token's claims without verifying it
    InspectToken { token: String },
}

#[derive(Subcommand)]
enum InviteAction {
    /// Create a pending invitation
    Create {
        #[arg(long)]
        email: String,
        #[arg(long)]
        customer_id: i64,
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..=MAX_INVITATION_TTL_DAYS))]
        ttl_days: Option<i64>,
    },
    /// Show the state of an invitation
    Check { token: String },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &logging.level;
        format!("gatehouse_cli={level},gatehouse_api={level},gatehouse_core={level},audit=info")
            .into()
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if logging.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os("GATEHOUSE_CONFIG").map(PathBuf::from));
    let config = match path {
        Some(path) => AppConfig::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?
            .with_env_override()?,
        None => AppConfig::from_env()?,
    };
    Ok(config)
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn inspect_token(token: &str) -> anyhow::Result<()> {
    let claims = peek_unverified(token).context("token is not a decodable JWT")?;
    print_json(&claims)?;

    if let Some(exp) = claims.get("exp").and_then(|v| v.as_i64()) {
        match Utc.timestamp_opt(exp, 0).single() {
            Some(at) if at <= Utc::now() => println!("expired at {at}"),
            Some(at) => println!("expires at {at}"),
            None => println!("exp out of range: {exp}"),
        }
    }
    println!("signature NOT verified");
    Ok(())
}

async fn run(config: AppConfig, command: Commands) -> anyhow::Result<()> {
    let store = PgStore::connect(&config.database).await?;

    if let Commands::Repair = command {
        let report = schema::repair(store.pool(), &config.database.table_prefix).await?;
        if report.is_noop() {
            println!("Schema up to date");
        } else {
            println!("Created tables: {:?}", report.created_tables);
            println!("Added columns: {:?}", report.added_columns);
            println!("Backfilled invitations: {}", report.backfilled_invitations);
        }
        return Ok(());
    }

    let secrets = Arc::new(StaticSecrets::from_config(&config.auth));
    let state = AppState::new(
        config,
        Backends::postgres(store),
        secrets,
        Arc::new(SystemClock),
    );

    match command {
        Commands::PurgeBlacklist { days } => {
            anyhow::ensure!(days >= 0, "--days must not be negative");
            let removed = state.blacklist.purge_older_than(days).await?;
            println!("Removed {removed} blacklist entries");
        }
        Commands::Invite { action } => match action {
            InviteAction::Create {
                email,
                customer_id,
                ttl_days,
            } => {
                let invitation = state
                    .invitations
                    .create(&email, customer_id, ttl_days)
                    .await?;
                print_json(&serde_json::json!({
                    "token": invitation.token,
                    "email": invitation.email,
                    "customer_id": invitation.customer_id,
                    "expires_at": invitation.expires_at,
                }))?;
            }
            InviteAction::Check { token } => {
                match state.invitations.check(&token).await? {
                    CheckOutcome::Valid { customer_id, email } => {
                        println!("valid: {email} (customer {customer_id})")
                    }
                    CheckOutcome::Used => println!("used"),
                    CheckOutcome::Expired => println!("expired"),
                    CheckOutcome::NotFound => println!("not found"),
                }
            }
        },
        Commands::Invalidate { user_id, reason } => {
            let reason: RevocationReason = reason.parse()?;
            let report = state.tokens.invalidate_all(user_id, reason).await?;
            println!(
                "User {} now at token version {} ({} blacklisted, {} rows revoked)",
                report.user_id, report.new_token_version, report.blacklisted, report.revoked_rows
            );
        }
        Commands::Repair | Commands::InspectToken { .. } => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::InspectToken { token } => inspect_token(&token),
        command => run(config, command).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_invite_create() {
        let cli = Cli::parse_from([
            "gatehouse",
            "invite",
            "create",
            "--email",
            "jane@example.com",
            "--customer-id",
            "9",
        ]);
        match cli.command {
            Commands::Invite {
                action:
                    InviteAction::Create {
                        email,
                        customer_id,
                        ttl_days,
                    },
            } => {
                assert_eq!(email, "jane@example.com");
                assert_eq!(customer_id, 9);
                assert_eq!(ttl_days, None);
            }
            _ => panic!("expected invite create"),
        }
    }

    #[test]
    fn test_invite_ttl_is_bounded() {
        let args = |ttl: &'static str| {
            [
                "gatehouse",
                "invite",
                "create",
                "--email",
                "jane@example.com",
                "--customer-id",
                "9",
                "--ttl-days",
                ttl,
            ]
        };
        assert!(Cli::try_parse_from(args("30")).is_ok());
        assert!(Cli::try_parse_from(args("0")).is_err());
        assert!(Cli::try_parse_from(args("200000000")).is_err());
    }

    #[test]
    fn test_invalidate_defaults_to_security() {
        let cli = Cli::parse_from(["gatehouse", "invalidate", "--user-id", "42"]);
        match cli.command {
            Commands::Invalidate { user_id, reason } => {
                assert_eq!(user_id, 42);
                assert_eq!(reason.parse::<RevocationReason>().unwrap(), RevocationReason::Security);
            }
            _ => panic!("expected invalidate"),
        }
    }

    #[test]
    fn test_inspect_rejects_garbage() {
        assert!(inspect_token("not-a-token").is_err());
    }
}
