//! Dependency-ordered service startup.
//!
//! Services are registered after their dependencies, so registration order is
//! always a topological order and cycles cannot be expressed. [`ServiceManager::run`]
//! launches every service concurrently, holding each one back only until the
//! services it depends on have signalled readiness.
//!
//! A failing service is logged and left alone; its siblings keep running.
//! The manager sequences startup, it does not supervise or restart.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;
use crate::signal::{wait_all, Signal};

/// A long-running unit of work managed by [`ServiceManager`].
///
/// `run` must fire `ready` once dependents may start and `stopped` when it
/// exits, and should return promptly after `cancel` fires.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Names of services that must be ready before this one starts.
    fn dependencies(&self) -> Vec<String>;

    async fn run(
        &self,
        cancel: CancellationToken,
        ready: Signal,
        stopped: Signal,
    ) -> anyhow::Result<()>;
}

type RunFn = Box<
    dyn Fn(CancellationToken, Signal, Signal) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// A [`Service`] built from a closure.
pub struct GenericService {
    name: String,
    deps: Vec<String>,
    run_fn: RunFn,
}

impl GenericService {
    pub fn new<F, Fut>(name: impl Into<String>, deps: &[&str], run: F) -> Self
    where
        F: Fn(CancellationToken, Signal, Signal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            run_fn: Box::new(move |cancel, ready, stopped| Box::pin(run(cancel, ready, stopped))),
        }
    }
}

#[async_trait]
impl Service for GenericService {
    fn name(&self) -> &str {
        &self.name
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
        (self.run_fn)(cancel, ready, stopped).await
    }
}

pub struct ServiceManager {
    name: String,
    services: Vec<Arc<dyn Service>>,
    names: HashSet<String>,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        Self {
            name: "service-manager".to_string(),
            services: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Register a service. Its dependencies must already be registered.
    pub fn add_service(&mut self, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        let name = service.name().to_string();
        if self.names.contains(&name) {
            return Err(ServiceError::DuplicateService(name));
        }
        // Requiring dependencies first keeps `services` topologically sorted.
        for dependency in service.dependencies() {
            if !self.names.contains(&dependency) {
                return Err(ServiceError::MissingDependency {
                    dependency,
                    service: name,
                });
            }
        }

        self.names.insert(name);
        self.services.push(service);
        Ok(())
    }

    /// Registered service names, in registration order.
    pub fn service_names(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name()).collect()
    }

    /// Start every service and wait for all of them to stop.
    ///
    /// `ready` fires once every service is ready, `stopped` once every
    /// launched service has stopped. If `cancel` fires while a service is
    /// still waiting on its dependencies, no further services are launched
    /// and [`ServiceError::Cancelled`] is returned after the launched ones
    /// have stopped.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        ready: Signal,
        stopped: Signal,
    ) -> Result<(), ServiceError> {
        let mut ready_map: HashMap<&str, Signal> = HashMap::new();
        let mut ready_list: Vec<Signal> = Vec::new();
        let mut stopped_list: Vec<Signal> = Vec::new();

        for service in &self.services {
            let deps_ready: Vec<Signal> = service
                .dependencies()
                .iter()
                .filter_map(|dep| ready_map.get(dep.as_str()).cloned())
                .collect();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Let launched services wind down before returning.
                    wait_all(&stopped_list).await;
                    stopped.fire();
                    return Err(ServiceError::Cancelled);
                }
                _ = wait_all(&deps_ready) => {}
            }

            let (service_ready, service_stopped) = async_run(cancel.clone(), Arc::clone(service));
            ready_map.insert(service.name(), service_ready.clone());
            ready_list.push(service_ready);
            stopped_list.push(service_stopped);
        }

        let ready_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = wait_all(&ready_list) => {
                    ready.fire();
                }
                _ = ready_cancel.cancelled() => {}
            }
        });

        wait_all(&stopped_list).await;
        stopped.fire();

        if cancel.is_cancelled() {
            Err(ServiceError::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn async_run(cancel: CancellationToken, service: Arc<dyn Service>) -> (Signal, Signal) {
    let ready = Signal::new();
    let stopped = Signal::new();
    let (service_ready, service_stopped) = (ready.clone(), stopped.clone());

    tokio::spawn(async move {
        let name = service.name().to_string();
        let start = Instant::now();
        info!("SERVICE STARTING service={}", name);

        {
            let (ready, stopped, name) = (ready.clone(), stopped.clone(), name.clone());
            tokio::spawn(async move {
                tokio::select! {
                    _ = ready.wait() => {
                        info!("SERVICE READY service={} since-start={:?}", name, start.elapsed());
                    }
                    _ = stopped.wait() => {}
                }
            });
        }

        let task = {
            let (service, ready, stopped) = (Arc::clone(&service), ready.clone(), stopped.clone());
            tokio::spawn(async move { service.run(cancel, ready, stopped).await })
        };

        match task.await {
            Ok(Ok(())) => {
                info!("SERVICE COMPLETED service={} since-start={:?}", name, start.elapsed())
            }
            Ok(Err(e)) => error!(
                "SERVICE FAILED service={} since-start={:?}: {:#}",
                name,
                start.elapsed(),
                e
            ),
            Err(e) => error!(
                "SERVICE FAILED service={} since-start={:?}: {}",
                name,
                start.elapsed(),
                e
            ),
        }

        // A failed service may not have fired its own signal.
        stopped.fire();
        info!("SERVICE STOPPED service={} since-start={:?}", name, start.elapsed());
    });

    (service_ready, service_stopped)
}

#[async_trait]
impl Service for ServiceManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        ready: Signal,
        stopped: Signal,
    ) -> anyhow::Result<()> {
        match ServiceManager::run(self, cancel, ready, stopped).await {
            Ok(()) | Err(ServiceError::Cancelled) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn noop(name: &str, deps: &[&str]) -> Arc<dyn Service> {
        Arc::new(GenericService::new(name, deps, |_, ready: Signal, stopped: Signal| async move {
            ready.fire();
            stopped.fire();
            Ok(())
        }))
    }

    #[test]
    fn test_add_service() {
        let cases: Vec<Vec<(Arc<dyn Service>, Option<&str>)>> = vec![
            vec![(noop("foo", &[]), None)],
            vec![(noop("foo", &[]), None), (noop("bar", &["foo"]), None)],
            vec![
                (noop("foo", &[]), None),
                (noop("foo", &[]), Some("service 'foo' added more than once")),
            ],
            vec![
                (
                    noop("bar", &["foo"]),
                    Some("dependency 'foo' of service 'bar' not yet defined"),
                ),
                (noop("foo", &[]), None),
            ],
        ];

        for case in cases {
            let mut m = ServiceManager::new();
            for (service, want) in case {
                let got = m.add_service(service).err().map(|e| e.to_string());
                assert_eq!(got.as_deref(), want);
            }
        }
    }

    #[test]
    fn test_duplicate_registration_keeps_one() {
        let mut m = ServiceManager::new();
        m.add_service(noop("foo", &[])).unwrap();
        assert!(matches!(
            m.add_service(noop("foo", &[])),
            Err(ServiceError::DuplicateService(name)) if name == "foo"
        ));
        assert_eq!(m.service_names(), vec!["foo"]);
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let completed = Arc::new(AtomicUsize::new(0));
        let run_to_completion = {
            let completed = completed.clone();
            move |_, ready: Signal, stopped: Signal| {
                let completed = completed.clone();
                async move {
                    sleep(Duration::from_millis(50)).await;
                    ready.fire();
                    sleep(Duration::from_millis(50)).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                    stopped.fire();
                    Ok(())
                }
            }
        };

        let mut m = ServiceManager::new();
        m.add_service(Arc::new(GenericService::new("foo", &[], run_to_completion.clone())))
            .unwrap();
        m.add_service(Arc::new(GenericService::new("bar", &["foo"], run_to_completion)))
            .unwrap();

        let (ready, stopped) = (Signal::new(), Signal::new());
        m.run(CancellationToken::new(), ready.clone(), stopped.clone())
            .await
            .unwrap();

        assert_eq!(completed.load(Ordering::SeqCst), 2);
        timeout(Duration::from_secs(5), ready.wait())
            .await
            .expect("ready signal not fired after completing service manager");
        assert!(stopped.is_fired(), "stopped signal not fired after completing service manager");
    }

    fn wait_for_cancel(name: &str, deps: &[&str]) -> Arc<dyn Service> {
        Arc::new(GenericService::new(
            name,
            deps,
            |cancel: CancellationToken, ready: Signal, stopped: Signal| async move {
                sleep(Duration::from_millis(20)).await;
                ready.fire();
                cancel.cancelled().await;
                stopped.fire();
                Ok(())
            },
        ))
    }

    #[tokio::test]
    async fn test_run_cancellation() {
        let mut m = ServiceManager::new();
        m.add_service(wait_for_cancel("foo", &[])).unwrap();
        m.add_service(wait_for_cancel("bar", &["foo"])).unwrap();
        let m = Arc::new(m);

        let cancel = CancellationToken::new();
        let (ready, stopped) = (Signal::new(), Signal::new());
        let handle = {
            let (m, cancel, ready, stopped) =
                (m.clone(), cancel.clone(), ready.clone(), stopped.clone());
            tokio::spawn(async move { m.run(cancel, ready, stopped).await })
        };

        timeout(Duration::from_secs(5), ready.wait())
            .await
            .expect("timeout waiting for service manager to become ready");

        cancel.cancel();
        let result = timeout(Duration::from_secs(5), handle)
            .await
            .expect("service manager did not stop after cancellation")
            .unwrap();
        assert!(matches!(result, Err(ServiceError::Cancelled)));
        assert!(stopped.is_fired());
    }

    #[tokio::test]
    async fn test_cancel_before_ready_launches_nothing_else() {
        let dependent_started = Arc::new(AtomicBool::new(false));

        let mut m = ServiceManager::new();
        // Never becomes ready, but honours cancellation.
        m.add_service(Arc::new(GenericService::new(
            "never-ready",
            &[],
            |cancel: CancellationToken, _ready: Signal, stopped: Signal| async move {
                cancel.cancelled().await;
                stopped.fire();
                Ok(())
            },
        )))
        .unwrap();
        m.add_service(Arc::new(GenericService::new("dependent", &["never-ready"], {
            let dependent_started = dependent_started.clone();
            move |_, ready: Signal, stopped: Signal| {
                dependent_started.store(true, Ordering::SeqCst);
                async move {
                    ready.fire();
                    stopped.fire();
                    Ok(())
                }
            }
        })))
        .unwrap();

        let cancel = CancellationToken::new();
        let (ready, stopped) = (Signal::new(), Signal::new());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = timeout(Duration::from_secs(5), m.run(cancel, ready.clone(), stopped.clone()))
            .await
            .expect("run did not return promptly after cancellation");
        assert!(matches!(result, Err(ServiceError::Cancelled)));
        assert!(!dependent_started.load(Ordering::SeqCst));
        assert!(!ready.is_fired());
        assert!(stopped.is_fired());
    }

    #[tokio::test]
    async fn test_already_cancelled_launches_nothing() {
        let started = Arc::new(AtomicBool::new(false));
        let mut m = ServiceManager::new();
        m.add_service(Arc::new(GenericService::new("foo", &[], {
            let started = started.clone();
            move |_, _, _| {
                started.store(true, Ordering::SeqCst);
                async { Ok(()) }
            }
        })))
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = m.run(cancel, Signal::new(), Signal::new()).await;
        assert!(matches!(result, Err(ServiceError::Cancelled)));
        assert!(!started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_siblings() {
        let mut m = ServiceManager::new();
        m.add_service(wait_for_cancel("foo", &[])).unwrap();
        m.add_service(Arc::new(GenericService::new(
            "bar-crash",
            &["foo"],
            |_, ready: Signal, _stopped: Signal| async move {
                ready.fire();
                sleep(Duration::from_millis(20)).await;
                anyhow::bail!("I'm crashing")
            },
        )))
        .unwrap();
        m.add_service(Arc::new(GenericService::new(
            "baz-panic",
            &["foo"],
            |_, ready: Signal, _stopped: Signal| async move {
                ready.fire();
                sleep(Duration::from_millis(20)).await;
                panic!("I'm in panic");
            },
        )))
        .unwrap();
        let m = Arc::new(m);

        let cancel = CancellationToken::new();
        let (ready, stopped) = (Signal::new(), Signal::new());
        let handle = {
            let (m, cancel, ready, stopped) =
                (m.clone(), cancel.clone(), ready.clone(), stopped.clone());
            tokio::spawn(async move { m.run(cancel, ready, stopped).await })
        };

        timeout(Duration::from_secs(5), ready.wait()).await.unwrap();
        // Give the failing services time to exit.
        sleep(Duration::from_millis(100)).await;
        assert!(!stopped.is_fired(), "a failing service must not stop the manager");
        assert!(!handle.is_finished());

        cancel.cancel();
        let result = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(matches!(result, Err(ServiceError::Cancelled)));
        assert!(stopped.is_fired());
    }

    #[tokio::test]
    async fn test_dependency_ordering() {
        let random = RandomState::new();
        for trial in 0..20u64 {
            let mut hasher = random.build_hasher();
            hasher.write_u64(trial);
            let jitter = Duration::from_millis(hasher.finish() % 15);

            let a_ready = Arc::new(AtomicBool::new(false));
            let violated = Arc::new(AtomicBool::new(false));

            let mut m = ServiceManager::new();
            m.add_service(Arc::new(GenericService::new("a", &[], {
                let a_ready = a_ready.clone();
                move |_, ready: Signal, stopped: Signal| {
                    let a_ready = a_ready.clone();
                    async move {
                        sleep(jitter).await;
                        a_ready.store(true, Ordering::SeqCst);
                        ready.fire();
                        stopped.fire();
                        Ok(())
                    }
                }
            })))
            .unwrap();
            m.add_service(Arc::new(GenericService::new("b", &["a"], {
                let (a_ready, violated) = (a_ready.clone(), violated.clone());
                move |_, ready: Signal, stopped: Signal| {
                    if !a_ready.load(Ordering::SeqCst) {
                        violated.store(true, Ordering::SeqCst);
                    }
                    async move {
                        ready.fire();
                        stopped.fire();
                        Ok(())
                    }
                }
            })))
            .unwrap();
            // Independent sibling with its own random delay.
            m.add_service(Arc::new(GenericService::new(
                "c",
                &[],
                move |_, ready: Signal, stopped: Signal| async move {
                    sleep(jitter / 2).await;
                    ready.fire();
                    stopped.fire();
                    Ok(())
                },
            )))
            .unwrap();

            m.run(CancellationToken::new(), Signal::new(), Signal::new())
                .await
                .unwrap();
            assert!(
                !violated.load(Ordering::SeqCst),
                "b started before a was ready in trial {}",
                trial
            );
        }
    }

    #[tokio::test]
    async fn test_nested_manager() {
        let mut inner = ServiceManager::new();
        inner.add_service(noop("inner-a", &[])).unwrap();
        inner.add_service(noop("inner-b", &["inner-a"])).unwrap();

        let mut outer = ServiceManager::new();
        outer.add_service(Arc::new(inner)).unwrap();
        outer.add_service(noop("after", &["service-manager"])).unwrap();

        let (ready, stopped) = (Signal::new(), Signal::new());
        timeout(
            Duration::from_secs(5),
            outer.run(CancellationToken::new(), ready.clone(), stopped.clone()),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(stopped.is_fired());
    }
}
