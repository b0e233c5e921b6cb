//! zoneclaim
//!
//! Runs once per node at boot: acquires this node's zone-pinned resource,
//! attaches it, prepares it, and exits. Exits non-zero on any unrecoverable
//! failure so the node does not join the fleet half-provisioned.

use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use zoneclaim_provisioner::config::{Cli, Command};
use zoneclaim_provisioner::disk::{FilesystemInitializer, Initializer, NoopInitializer};
use zoneclaim_provisioner::model::ResourceKind;
use zoneclaim_provisioner::provisioner::initial_wait;
use zoneclaim_provisioner::{Config, HttpBackend, ProvisionError, ResourceProvisioner, SystemClock};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    zoneclaim_provisioner::logging::init(cli.log_format, &cli.log_level);

    if let Err(e) = run(cli).await {
        error!(reason = e.reason_code(), error = %e, "Provisioning failed");
        process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<(), ProvisionError> {
    let config = Config::from_cli(cli.command.options())?;
    info!(
        node_id = %config.node_id,
        zone = %config.zone,
        kind = %config.kind,
        backend_url = %config.backend_url,
        state_file = %config.state_file.display(),
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    });

    initial_wait(config.initial_wait, shutdown_rx.clone()).await?;

    let backend = HttpBackend::new(config.backend_url.clone(), config.backend_timeout)?;
    let initializer: Arc<dyn Initializer> = match config.kind {
        ResourceKind::Volume => Arc::new(FilesystemInitializer::new(config.volume_layout.clone())),
        ResourceKind::Interface | ResourceKind::Address => Arc::new(NoopInitializer),
    };
    let provisioner =
        ResourceProvisioner::new(config, Arc::new(backend), Arc::new(SystemClock), initializer);

    match cli.command {
        Command::Provision(_) => {
            let report = provisioner.provision(shutdown_rx).await?;
            info!(
                resource_id = %report.resource.id,
                acquisition = ?report.acquisition,
                attachment_id = ?report.attachment_id.as_ref().map(|a| a.as_str()),
                "Provisioning complete"
            );
        }
        Command::Release(_) => match provisioner.release(shutdown_rx).await? {
            Some(id) => info!(resource_id = %id, "Release complete"),
            None => info!("Nothing to release"),
        },
    }

    Ok(())
}
