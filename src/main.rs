//! Cash operations CLI.
//!
//! Drives one full cycle against a SQLite store: create entities and
//! snapshots, register connections, run syncs, promote datasets, run the
//! matching and forecast engines, check invariants, evaluate trust gates
//! and print the 13-week calendar.

use anyhow::{Context, Result};
use cashops_backend::connectors::ConnectorRegistry;
use cashops_backend::models::Role;
use cashops_backend::trust::{LockGateThresholds, OverrideRequest};
use cashops_backend::{
    promote_dataset, CashCalendarBuilder, Config, ForecastEngine, InvariantEngine, MatchingEngine,
    Store, SyncOrchestrator, TrustEngine,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cashops", about = "Cash operations backend")]
struct Cli {
    /// SQLite database path; falls back to DATABASE_PATH.
    #[arg(long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an entity.
    CreateEntity {
        name: String,
        #[arg(long, default_value = "EUR")]
        base_currency: String,
        /// Payment-run weekday, 0 = Monday .. 6 = Sunday.
        #[arg(long, default_value_t = 3)]
        payment_run_day: u8,
    },
    /// Create a snapshot for an entity.
    CreateSnapshot {
        entity_id: i64,
        label: String,
        #[arg(long, default_value_t = 0.0)]
        opening_balance: f64,
        #[arg(long, default_value_t = 0.0)]
        min_cash: f64,
    },
    /// Register a connection (config is a JSON object).
    AddConnection {
        connector_type: String,
        name: String,
        config: String,
        #[arg(long)]
        entity_id: Option<i64>,
    },
    /// Probe a connection.
    TestConnection { connection_id: i64 },
    /// Assess source data quality for a connection.
    Health { connection_id: i64 },
    /// Run a sync for a connection.
    Sync { connection_id: i64 },
    /// Promote a dataset's canonical records into a snapshot.
    Promote {
        snapshot_id: i64,
        dataset_uid: String,
        #[arg(long, default_value = "default")]
        bank_account: String,
    },
    /// Run the reconciliation matching engine over a snapshot.
    Reconcile { snapshot_id: i64 },
    /// Run the probabilistic forecast over a snapshot.
    Forecast { snapshot_id: i64 },
    /// Run the seven invariant checks.
    Check { snapshot_id: i64 },
    /// Evaluate the trust report and lock gates.
    Trust { snapshot_id: i64 },
    /// Print the 13-week cash calendar.
    Calendar { snapshot_id: i64 },
    /// Move a snapshot DRAFT -> READY_FOR_REVIEW.
    MarkReady {
        snapshot_id: i64,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Lock a snapshot (CFO role). Requires passing gates or an override.
    Lock {
        snapshot_id: i64,
        #[arg(long, default_value = "cli")]
        actor: String,
        #[arg(long, default_value = "weekly close")]
        reason: String,
        #[arg(long)]
        acknowledgment: Option<String>,
        #[arg(long)]
        override_reason: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let db_path = cli.db.unwrap_or(config.database_path);
    let store = Arc::new(Store::open(&db_path).context("open store")?);

    match cli.command {
        Command::CreateEntity {
            name,
            base_currency,
            payment_run_day,
        } => {
            let entity = store.create_entity(&name, &base_currency, payment_run_day, &[])?;
            println!("entity {} created ({})", entity.id, entity.name);
        }
        Command::CreateSnapshot {
            entity_id,
            label,
            opening_balance,
            min_cash,
        } => {
            let snapshot = store.create_snapshot(entity_id, &label, opening_balance, min_cash)?;
            println!("snapshot {} created ({})", snapshot.id, snapshot.label);
        }
        Command::AddConnection {
            connector_type,
            name,
            config: connection_config,
            entity_id,
        } => {
            let mut connection_config: serde_json::Value =
                serde_json::from_str(&connection_config).context("parse connection config JSON")?;
            // Environment locale hint applies unless the config pins one.
            if let Some(map) = connection_config.as_object_mut() {
                map.entry("locale")
                    .or_insert_with(|| serde_json::json!(format!("{:?}", config.date_locale).to_uppercase()));
            }
            let connection = store.create_connection(
                entity_id,
                &connector_type,
                &name,
                &connection_config,
                None,
                None,
            )?;
            println!("connection {} created ({})", connection.id, connection.name);
        }
        Command::TestConnection { connection_id } => {
            let orchestrator = SyncOrchestrator::new(
                store.clone(),
                Arc::new(ConnectorRegistry::standard()),
                config.ingest_batch_size,
            );
            let report = orchestrator.test_connection(connection_id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Health { connection_id } => {
            let orchestrator = SyncOrchestrator::new(
                store.clone(),
                Arc::new(ConnectorRegistry::standard()),
                config.ingest_batch_size,
            );
            let report = orchestrator.connection_health(connection_id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Sync { connection_id } => {
            let orchestrator = SyncOrchestrator::new(
                store.clone(),
                Arc::new(ConnectorRegistry::standard()),
                config.ingest_batch_size,
            );
            let outcome = orchestrator.run_sync(connection_id, "cli", None, None)?;
            println!(
                "sync {} {}: extracted {}, loaded {}, skipped {}, errors {} (dataset {})",
                outcome.sync_run_id,
                outcome.status.as_str(),
                outcome.rows_extracted,
                outcome.rows_loaded,
                outcome.rows_skipped,
                outcome.rows_error,
                outcome.dataset_uid,
            );
        }
        Command::Promote {
            snapshot_id,
            dataset_uid,
            bank_account,
        } => {
            let outcome = promote_dataset(&store, snapshot_id, &dataset_uid, &bank_account)?;
            println!(
                "promoted: {} invoices, {} bills, {} bank txns, {} fx rates, {} skipped",
                outcome.invoices,
                outcome.vendor_bills,
                outcome.bank_transactions,
                outcome.fx_rates,
                outcome.skipped,
            );
        }
        Command::Reconcile { snapshot_id } => {
            let summary = MatchingEngine::new(store.clone()).run_snapshot(snapshot_id)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Forecast { snapshot_id } => {
            let engine = ForecastEngine::new(store.clone());
            let summary = engine.run(snapshot_id, Utc::now().date_naive())?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            let diagnostics = engine.diagnostics(snapshot_id)?;
            println!("{}", serde_json::to_string_pretty(&diagnostics)?);
        }
        Command::Check { snapshot_id } => {
            let run = InvariantEngine::new(store.clone()).run_all(snapshot_id, "cli")?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Command::Trust { snapshot_id } => {
            let engine = TrustEngine::new(store.clone());
            let report = engine.evaluate(snapshot_id, Utc::now())?;
            let gates = engine.lock_gates(&report, &LockGateThresholds::default());
            println!("{}", serde_json::to_string_pretty(&report)?);
            println!("{}", serde_json::to_string_pretty(&gates)?);
        }
        Command::Calendar { snapshot_id } => {
            let calendar =
                CashCalendarBuilder::new(store.clone()).build(snapshot_id, Utc::now().date_naive())?;
            println!("{}", serde_json::to_string_pretty(&calendar)?);
        }
        Command::MarkReady { snapshot_id, actor } => {
            let snapshot = cashops_backend::SnapshotWorkflow::new(store.clone()).mark_ready(
                snapshot_id,
                &actor,
                Role::Regular,
            )?;
            println!("snapshot {} is {}", snapshot.id, snapshot.status.as_str());
        }
        Command::Lock {
            snapshot_id,
            actor,
            reason,
            acknowledgment,
            override_reason,
        } => {
            let trust = TrustEngine::new(store.clone());
            let report = trust.evaluate(snapshot_id, Utc::now())?;
            let gates = trust.lock_gates(&report, &LockGateThresholds::default());
            let override_request = match (acknowledgment, override_reason) {
                (Some(ack), Some(reason)) => Some(OverrideRequest {
                    acknowledgment_text: ack,
                    override_reason: reason,
                    email: None,
                    ip_address: None,
                }),
                _ => None,
            };
            let snapshot = cashops_backend::SnapshotWorkflow::new(store.clone()).lock(
                snapshot_id,
                &actor,
                Role::LockCapable,
                &reason,
                &gates,
                override_request.as_ref(),
            )?;
            println!("snapshot {} is {}", snapshot.id, snapshot.status.as_str());
        }
    }
    Ok(())
}
