use super::RouteSource;
use crate::types::{route_key, RouteEvent};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Watches a JSON file of route objects.
///
/// The file holds either an array of routes or a list document with an
/// `items` array (the shape `kubectl get routes -o json` prints). It is
/// re-read every `interval` and successive snapshots are diffed into
/// [`RouteEvent`]s.
pub struct FileRouteSource {
    path: PathBuf,
    interval: Duration,
}

impl FileRouteSource {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
        }
    }

    async fn read_routes(&self) -> Result<Vec<Value>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading routes from {}", self.path.display()))?;
        let doc: Value = serde_json::from_str(&raw)
            .with_context(|| format!("parsing routes in {}", self.path.display()))?;

        match doc {
            Value::Array(items) => Ok(items),
            Value::Object(mut list) => match list.remove("items") {
                Some(Value::Array(items)) => Ok(items),
                _ => Err(anyhow!(
                    "{}: expected an array or an object with an `items` array",
                    self.path.display()
                )),
            },
            _ => Err(anyhow!(
                "{}: expected an array or an object with an `items` array",
                self.path.display()
            )),
        }
    }
}

/// Index routes by identity, skipping objects without one.
fn snapshot(routes: Vec<Value>) -> BTreeMap<String, Value> {
    let mut map = BTreeMap::new();
    for route in routes {
        match route_key(&route) {
            Some(key) => {
                map.insert(key, route);
            }
            None => warn!("Skipping route without metadata.name: {}", route),
        }
    }
    map
}

/// Events turning `old` into `new`. Deletions come first.
fn diff(old: &BTreeMap<String, Value>, new: &BTreeMap<String, Value>) -> Vec<RouteEvent> {
    let mut events = Vec::new();

    for (key, route) in old {
        if !new.contains_key(key) {
            events.push(RouteEvent::Deleted(route.clone()));
        }
    }

    for (key, route) in new {
        match old.get(key) {
            None => events.push(RouteEvent::Added(route.clone())),
            Some(previous) if previous != route => events.push(RouteEvent::Updated {
                old: previous.clone(),
                new: route.clone(),
            }),
            Some(_) => {}
        }
    }

    events
}

#[async_trait]
impl RouteSource for FileRouteSource {
    async fn list(&self) -> Result<Vec<Value>> {
        self.read_routes().await
    }

    async fn watch(
        &self,
        events: mpsc::Sender<RouteEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!("Watching routes in {}", self.path.display());

        let mut current: BTreeMap<String, Value> = BTreeMap::new();
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            // Keep the last good snapshot while the file is unreadable.
            let next = match self.read_routes().await {
                Ok(routes) => snapshot(routes),
                Err(e) => {
                    warn!("Failed to read routes: {:#}. Retrying...", e);
                    continue;
                }
            };

            for event in diff(&current, &next) {
                debug!("Route event: {:?}", event);
                if events.send(event).await.is_err() {
                    debug!("Route event receiver closed, stopping watch");
                    return Ok(());
                }
            }
            current = next;
        }
    }
}
