use anyhow::{Context, Result};
use clap::Parser;
use semver::Version;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use alcove::catalog::{Catalog, LoadState, ValidationStatus};
use alcove::lifecycle::LifecycleController;

/// Alcove - widget host loader harness
///
/// Scans an install root for widget packages, reports the catalog, and can
/// attempt a headless activation of a single package.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Install root to scan (defaults to ~/.alcove/widgets)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Host version presented to the compatibility gate
    #[arg(long, default_value = "1.0.0")]
    host_version: String,

    /// Attempt a full activation of the given package key
    #[arg(short, long)]
    activate: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global default subscriber")?;

    let host_version = Version::parse(&args.host_version)
        .with_context(|| format!("invalid --host-version `{}`", args.host_version))?;

    let root = match args.root {
        Some(root) => root,
        None => {
            let home = dirs::home_dir().context("Failed to get home directory")?;
            home.join(".alcove").join("widgets")
        }
    };
    let settings_root = root.join(".settings");

    let mut catalog = Catalog::new(&root, host_version.clone());
    let records = catalog.scan();

    println!("install root: {}", root.display());
    println!("host version: {host_version}");
    if records.is_empty() {
        println!("no widget packages found");
    }
    for record in &records {
        let version = record
            .manifest
            .as_ref()
            .map_or_else(|| "?".to_string(), |m| m.version.to_string());
        let status = match &record.status {
            ValidationStatus::Valid => "valid".to_string(),
            ValidationStatus::Invalid { reason } => format!("invalid: {reason}"),
            ValidationStatus::Incompatible { .. } => "incompatible with this host".to_string(),
        };
        println!("  {:<24} {:<12} {status}", record.key, version);
    }

    if let Some(key) = args.activate {
        let record = catalog
            .get(&key)
            .with_context(|| format!("no package `{key}` in the catalog"))?;

        let mut controller = LifecycleController::new(host_version, settings_root);
        let instance_id = Uuid::new_v4();
        match controller.activate(&record, instance_id) {
            Ok(activation) => {
                catalog.set_load_state(&key, LoadState::Loaded);
                println!("activated `{key}` as {} ({})", instance_id, activation.mode);
                controller.close(&key, instance_id);
                println!("closed `{key}`; unit eligible for unload");
            }
            Err(e) => {
                catalog.set_load_state(
                    &key,
                    LoadState::Failed {
                        reason: e.to_string(),
                    },
                );
                // Broken widgets are present-but-unavailable, never a crash.
                eprintln!("activation failed: {e}");
            }
        }
        controller.shutdown();
    }

    Ok(())
}
