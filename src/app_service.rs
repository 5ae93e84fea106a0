//! Reconciles configuration snapshots into running services.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use itertools::Itertools;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Manager, Notifier, Root};
use crate::errors;
use crate::overwatch::{AppManager, ServiceRef};
use crate::services::ServiceFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AppState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

/// Drives the [`AppManager`] from configuration updates.
///
/// Updates and shutdown are handled by a single loop, so reconciliation
/// passes never overlap.
pub struct AppService {
    config_manager: Arc<dyn Manager>,
    app_manager: Arc<AppManager>,
    factory: Arc<dyn ServiceFactory>,
    updates: mpsc::UnboundedSender<Root>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Root>>>,
    state: Mutex<AppState>,
    shutdown: CancellationToken,
}

impl AppService {
    pub fn new(
        config_manager: Arc<dyn Manager>,
        app_manager: Arc<AppManager>,
        factory: Arc<dyn ServiceFactory>,
        shutdown: CancellationToken,
    ) -> Self {
        let (updates, pending) = mpsc::unbounded_channel();
        Self {
            config_manager,
            app_manager,
            factory,
            updates,
            pending: Mutex::new(Some(pending)),
            state: Mutex::new(AppState::Idle),
            shutdown,
        }
    }

    pub fn state(&self) -> AppState {
        *lock(&self.state)
    }

    pub fn app_manager(&self) -> &Arc<AppManager> {
        &self.app_manager
    }

    /// Starts the reconciliation loop and blocks on the config manager.
    ///
    /// Returns once the config manager has stopped and every service has been
    /// asked to shut down. A config manager that fails to start is returned
    /// as an error right away.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        let Some(updates) = lock(&self.pending).take() else {
            anyhow::bail!(errors::app::ALREADY_STARTED);
        };
        {
            let mut state = lock(&self.state);
            if *state == AppState::Idle {
                *state = AppState::Running;
            }
        }

        let action_loop = tokio::spawn(self.clone().action_loop(updates));

        let notifier: Arc<dyn Notifier> = self.clone();
        self.config_manager.start(notifier).await?;

        if let Err(e) = action_loop.await {
            tracing::error!("App service loop aborted: {}", e);
        }
        Ok(())
    }

    /// Stops the config manager and every registered service.
    pub fn shutdown(&self) {
        {
            let mut state = lock(&self.state);
            if matches!(*state, AppState::ShuttingDown | AppState::Stopped) {
                return;
            }
            *state = AppState::ShuttingDown;
        }
        tracing::info!("App service shutting down");
        self.config_manager.shutdown();
        self.shutdown.cancel();
    }

    async fn action_loop(self: Arc<Self>, mut updates: mpsc::UnboundedReceiver<Root>) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                update = updates.recv() => match update {
                    Some(root) => self.reconcile(&root),
                    None => break,
                },
            }
        }

        for service in self.app_manager.services() {
            service.shutdown();
        }
        self.set_state(AppState::Stopped);
        tracing::info!("App service stopped");
    }

    /// Makes the registered services match `root`.
    ///
    /// Entries that fail to build are skipped. Applying the same snapshot
    /// twice starts and stops nothing the second time.
    pub fn reconcile(&self, root: &Root) {
        let mut desired = HashSet::new();
        for service in self.desired_services(root) {
            if !desired.insert(service.name().to_string()) {
                tracing::warn!(
                    service = service.name(),
                    service_type = service.service_type(),
                    "{}",
                    errors::app::DUPLICATE_SERVICE
                );
                continue;
            }
            self.app_manager.add(service);
        }

        let stale: Vec<String> = self
            .app_manager
            .services()
            .iter()
            .map(|service| service.name().to_string())
            .filter(|name| !desired.contains(name))
            .collect();
        if !stale.is_empty() {
            tracing::info!("Removing services: {}", stale.iter().join(", "));
        }
        for name in &stale {
            self.app_manager.remove(name);
        }
    }

    fn desired_services(&self, root: &Root) -> Vec<ServiceRef> {
        let mut built = Vec::with_capacity(root.forwarders.len() + 2);

        for forwarder in &root.forwarders {
            keep_built(
                &mut built,
                &forwarder.listener,
                self.factory.forwarder(forwarder),
            );
        }
        if root.resolver.enabled {
            keep_built(&mut built, "resolver", self.factory.resolver(&root.resolver));
        }
        if let Some(tunnel) = &root.tunnel {
            keep_built(&mut built, &tunnel.edge, self.factory.tunnel(tunnel));
        }

        built
    }

    fn set_state(&self, state: AppState) {
        *lock(&self.state) = state;
    }
}

impl Notifier for AppService {
    fn config_did_update(&self, root: Root) {
        if self.updates.send(root).is_err() {
            tracing::debug!("Config update dropped, app service loop has exited");
        }
    }
}

fn keep_built(built: &mut Vec<ServiceRef>, entry: &str, result: anyhow::Result<ServiceRef>) {
    match result {
        Ok(service) => built.push(service),
        Err(e) => {
            tracing::warn!("{}: {:#}", errors::app::skipped_entry(entry), e);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
