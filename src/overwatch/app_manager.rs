use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use itertools::Itertools;
use tokio_util::task::TaskTracker;

use super::ServiceRef;
use crate::errors;

/// Invoked with `(service_type, service_name, error)` whenever a service's
/// `run` returns.
pub type ServiceCallback = Arc<dyn Fn(&str, &str, Option<&anyhow::Error>) + Send + Sync>;

/// Registry of running services keyed by name.
///
/// The registry lock is never held while calling into service code, so a
/// service may call back into the manager (for example to remove itself).
/// A service whose `run` returns stays registered until it is removed or
/// replaced by a service with a different hash; it is not restarted.
pub struct AppManager {
    services: Mutex<HashMap<String, ServiceRef>>,
    callback: ServiceCallback,
    tasks: TaskTracker,
}

impl AppManager {
    pub fn new(callback: ServiceCallback) -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
            callback,
            tasks: TaskTracker::new(),
        }
    }

    /// Registers and starts `service`.
    ///
    /// Re-adding a service with the same name and hash is a no-op. A changed
    /// hash shuts the previous instance down and starts the new one without
    /// waiting for the old `run` to return.
    pub fn add(&self, service: ServiceRef) {
        let name = service.name().to_string();
        let previous = {
            let mut services = self.lock();
            if let Some(current) = services.get(&name)
                && current.hash() == service.hash()
            {
                return;
            }
            services.insert(name, service.clone())
        };

        if let Some(previous) = previous {
            tracing::info!(
                service = previous.name(),
                service_type = previous.service_type(),
                "Configuration changed, replacing service"
            );
            previous.shutdown();
        }

        self.start(service);
    }

    /// Shuts down and unregisters the service called `name`, if any.
    pub fn remove(&self, name: &str) {
        let removed = self.lock().remove(name);
        if let Some(service) = removed {
            tracing::info!(
                service = service.name(),
                service_type = service.service_type(),
                "Removing service"
            );
            service.shutdown();
        }
    }

    /// Snapshot of the registered services, ordered by name.
    pub fn services(&self) -> Vec<ServiceRef> {
        self.lock()
            .values()
            .cloned()
            .sorted_by(|a, b| a.name().cmp(b.name()))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<ServiceRef> {
        self.lock().get(name).cloned()
    }

    /// Waits until every service started so far has returned from `run`.
    pub async fn wait_stopped(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    fn start(&self, service: ServiceRef) {
        tracing::info!(
            service = service.name(),
            service_type = service.service_type(),
            "Starting service"
        );

        let callback = self.callback.clone();
        let tasks = self.tasks.clone();
        self.tasks.spawn(async move {
            let runner = service.clone();
            let result = match tasks.spawn(async move { runner.run().await }).await {
                Ok(result) => result,
                Err(join_error) => Err(anyhow::anyhow!(errors::service::panicked(
                    service.name(),
                    &join_error.to_string()
                ))),
            };
            report(
                &callback,
                service.service_type(),
                service.name(),
                result.as_ref().err(),
            );
        });
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ServiceRef>> {
        self.services
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn report(
    callback: &ServiceCallback,
    service_type: &str,
    name: &str,
    error: Option<&anyhow::Error>,
) {
    let outcome =
        std::panic::catch_unwind(AssertUnwindSafe(|| callback(service_type, name, error)));
    if outcome.is_err() {
        tracing::error!(
            service = name,
            service_type,
            "Service completion callback panicked"
        );
    }
}
