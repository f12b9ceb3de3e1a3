//! nodemdns daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use nodemdns::mdns::{Backoff, MdnsController, RouteController, MDNS_CONTROLLER_NAME};
use nodemdns::watch::FileRouteSource;
use nodemdns::{Config, ServiceError, ServiceManager, Signal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting nodemdns with config: {:?}", cfg);

    let mut manager = ServiceManager::new();

    // mDNS responder and node name
    let mdns = Arc::new(MdnsController::new(&cfg)?);
    manager.add_service(mdns.clone())?;

    // Route hosts
    match &cfg.routes_file {
        Some(path) => {
            let source = Arc::new(FileRouteSource::new(path, cfg.routes_poll_interval()));
            let routes = RouteController::new(mdns.resolver(), mdns.node_addresses(), &cfg.tld, source)
                .with_backoff(Backoff::from(&cfg.route_api_backoff))
                .with_dependencies(&[MDNS_CONTROLLER_NAME]);
            manager.add_service(Arc::new(routes))?;
        }
        None => info!("No routes_file configured, only the node name will be announced"),
    }

    // Graceful Shutdown
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, shutting down..."),
                Err(err) => error!("Unable to listen for shutdown signal: {}", err),
            }
            cancel.cancel();
        });
    }

    let ready = Signal::new();
    {
        let ready = ready.clone();
        tokio::spawn(async move {
            ready.wait().await;
            info!("All services ready.");
        });
    }

    match manager.run(cancel, ready, Signal::new()).await {
        Ok(()) | Err(ServiceError::Cancelled) => {}
        Err(e) => return Err(e.into()),
    }

    info!("Shutdown complete.");
    Ok(())
}
