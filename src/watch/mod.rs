use crate::types::RouteEvent;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod file;
pub use file::FileRouteSource;

#[async_trait]
pub trait RouteSource: Send + Sync {
    /// List the current routes. Used as a cheap reachability probe before
    /// watching.
    async fn list(&self) -> Result<Vec<Value>>;

    /// Deliver route changes to `events` until `cancel` fires.
    /// The current contents are delivered first, as `Added` events.
    async fn watch(&self, events: mpsc::Sender<RouteEvent>, cancel: CancellationToken)
        -> Result<()>;
}
