//! Route-driven name registration.
//!
//! Every route whose host ends in the mDNS TLD is published in the resolver
//! against the node's own addresses. Several routes may share one host, so
//! hosts are reference counted and only withdrawn when the last route using
//! them goes away.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::controller::NodeAddresses;
use super::resolver::{normalize, Resolver};
use crate::servicemanager::Service;
use crate::signal::Signal;
use crate::types::{route_host, RouteEvent};
use crate::watch::RouteSource;

pub const ROUTE_CONTROLLER_NAME: &str = "mdns-route-controller";

const EVENT_CHANNEL_SIZE: usize = 128;

/// Exponential backoff schedule.
///
/// `steps` is the number of attempts; the schedule yields the `steps - 1`
/// delays between them, starting at `initial`, multiplied by `factor` each
/// time and capped at `cap`.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub steps: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(10),
            factor: 1.5,
            cap: Duration::from_secs(180),
            steps: 24,
        }
    }
}

impl Backoff {
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut next = self.initial;
        (1..self.steps).map(move |_| {
            let delay = next.min(self.cap);
            next = Duration::try_from_secs_f64(next.as_secs_f64() * self.factor)
                .map_or(self.cap, |d| d.min(self.cap));
            delay
        })
    }
}

/// Keeps resolver entries in sync with the routes delivered by a
/// [`RouteSource`].
pub struct RouteController {
    resolver: Arc<Resolver>,
    addresses: NodeAddresses,
    tld: String,
    source: Arc<dyn RouteSource>,
    backoff: Backoff,
    deps: Vec<String>,
    host_count: Mutex<HashMap<String, usize>>,
}

impl RouteController {
    pub fn new(
        resolver: Arc<Resolver>,
        addresses: NodeAddresses,
        tld: &str,
        source: Arc<dyn RouteSource>,
    ) -> Self {
        Self {
            resolver,
            addresses,
            tld: tld.to_ascii_lowercase(),
            source,
            backoff: Backoff::default(),
            deps: Vec::new(),
            host_count: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Services that must be ready before routes are watched.
    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.deps = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.host_count.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of routes currently exposing `host`.
    pub fn host_count(&self, host: &str) -> usize {
        self.counts().get(&normalize(host)).copied().unwrap_or(0)
    }

    fn has_tld(&self, host: &str) -> bool {
        host.trim_end_matches('.')
            .to_ascii_lowercase()
            .ends_with(&self.tld)
    }

    pub fn expose_host(&self, host: &str) {
        if !self.has_tld(host) {
            debug!("mDNS ignoring host without mDNS suffix: {}", host);
            return;
        }

        let key = normalize(host);
        let mut counts = self.counts();
        let count = counts.entry(key.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            let ips = self.addresses.get();
            if ips.is_empty() {
                warn!(
                    "mDNS: route found for host {:?} but the node has no addresses, it will not resolve",
                    host
                );
            } else {
                info!("mDNS: route found for host {:?}, ips {:?}", host, ips);
            }
            // TODO(multi-node): resolve the router's endpoints instead of
            // assuming this node serves every route.
            self.resolver.register(&key, &ips);
        }
    }

    pub fn unexpose_host(&self, host: &str) {
        if !self.has_tld(host) {
            return;
        }

        let key = normalize(host);
        let mut counts = self.counts();
        match counts.get_mut(&key) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                counts.remove(&key);
                info!("mDNS removing {:?}, no more route references", host);
                self.resolver.deregister(&key);
            }
            None => debug!("mDNS: unexpose of unknown host {:?}", host),
        }
    }

    pub fn added_route(&self, route: &Value) {
        match route_host(route) {
            Some(host) => self.expose_host(host),
            None => error!("mDNS spec.host not found in added route"),
        }
    }

    pub fn updated_route(&self, old: &Value, new: &Value) {
        let old_host = route_host(old);
        let new_host = route_host(new);
        if old_host == new_host {
            return;
        }

        info!("Updating route host from {:?} to {:?}", old_host, new_host);
        if let Some(host) = old_host {
            self.unexpose_host(host);
        }
        if let Some(host) = new_host {
            self.expose_host(host);
        }
    }

    pub fn deleted_route(&self, route: &Value) {
        match route_host(route) {
            Some(host) => self.unexpose_host(host),
            None => error!("mDNS spec.host not found in deleted route"),
        }
    }

    pub fn handle_event(&self, event: RouteEvent) {
        match event {
            RouteEvent::Added(route) => self.added_route(&route),
            RouteEvent::Updated { old, new } => self.updated_route(&old, &new),
            RouteEvent::Deleted(route) => self.deleted_route(&route),
        }
    }

    /// Poll the route source until it answers a list call.
    ///
    /// Running out of attempts is not fatal: the watch is started anyway and
    /// reports its own errors. Returns `false` only if cancelled.
    pub async fn wait_for_route_api(&self, cancel: &CancellationToken) -> bool {
        info!("mDNS: waiting for route API to be ready");
        let mut delays = self.backoff.delays();

        loop {
            let listed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                listed = self.source.list() => listed,
            };
            match listed {
                Ok(_) => {
                    info!("mDNS: route API ready, watching routes");
                    return true;
                }
                Err(e) => debug!("mDNS: route API not ready: {:#}", e),
            }

            let Some(delay) = delays.next() else {
                error!("mDNS: timed out waiting for the route API to come up");
                return true;
            };

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[async_trait]
impl Service for RouteController {
    fn name(&self) -> &str {
        ROUTE_CONTROLLER_NAME
    }

    fn dependencies(&self) -> Vec<String> {
        self.deps.clone()
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        ready: Signal,
        stopped: Signal,
    ) -> anyhow::Result<()> {
        info!("Starting mDNS route watcher");

        if !self.wait_for_route_api(&cancel).await {
            stopped.fire();
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let source = Arc::clone(&self.source);
        let watch_cancel = cancel.child_token();
        let watcher = tokio::spawn(async move { source.watch(tx, watch_cancel).await });
        ready.fire();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!("mDNS: route watch ended, no further route updates");
                        cancel.cancelled().await;
                        break;
                    }
                },
            }
        }

        match watcher.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("error running route watch: {:#}", e),
            Err(e) => error!("route watch task failed: {}", e),
        }

        stopped.fire();
        Ok(())
    }
}
