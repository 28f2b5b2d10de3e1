use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sapn_core::CanonicalEvent;
use sapn_storage::EventStore;
use sapn_sync::{build_driver, maybe_build_scheduler, AppConfig, RunOverrides};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "sapn-cli")]
#[command(about = "School portal alert notifier")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation cycle.
    Check {
        /// Read portal records from a JSON fixture instead of the live portal.
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Log the email instead of sending it.
        #[arg(long)]
        dry_run: bool,
    },
    /// Create the event store schema.
    Migrate,
    /// Serve the HTTP API (and the scheduler when enabled).
    Serve,
    /// Run the scheduled check in the foreground until interrupted.
    Schedule,
    /// List stored events.
    Events {
        #[arg(long)]
        pending: bool,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Check {
        fixture: None,
        dry_run: false,
    }) {
        Commands::Check { fixture, dry_run } => {
            let driver = build_driver(&config, &RunOverrides { fixture, dry_run }).await?;
            let result = driver.run().await;
            driver.store().close().await;
            let result = result?;
            println!(
                "check complete: run_id={} new_absences={} new_behavior_alerts={} retried={} email_sent={}",
                result.run_id,
                result.new_absences,
                result.new_behavior_alerts,
                result.retried_events,
                result.email_sent
            );
        }
        Commands::Migrate => {
            let store = EventStore::open(&config.store_config())
                .await
                .context("opening event store")?;
            println!(
                "event store ready: {} ({} events)",
                store.path().display(),
                store.count().await?
            );
            store.close().await;
        }
        Commands::Serve => {
            sapn_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let config = AppConfig {
                scheduler_enabled: true,
                ..config
            };
            let driver = Arc::new(build_driver(&config, &RunOverrides::default()).await?);
            if let Some(mut sched) = maybe_build_scheduler(&config, driver).await? {
                sched.start().await.context("starting scheduler")?;
                info!("scheduler running; press ctrl-c to stop");
                tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Events { pending, limit } => {
            let store = EventStore::open(&config.store_config())
                .await
                .context("opening event store")?;
            let events = if pending {
                store.pending_notification().await?
            } else {
                store.list_recent(limit).await?
            };
            for event in &events {
                println!("{}", event_line(event));
            }
            println!("{} event(s)", events.len());
            store.close().await;
        }
    }

    Ok(())
}

fn event_line(event: &CanonicalEvent) -> String {
    format!(
        "{}  {:<14}  {}  notified={}  {}",
        event.date.format("%d-%m-%Y"),
        event.event_type.as_str(),
        event.first_seen.format("%Y-%m-%dT%H:%M:%SZ"),
        event.notified,
        event.description
    )
}
