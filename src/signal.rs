//! Process lifecycle and the two-phase shutdown coordinator.
//!
//! [`Lifecycle`] owns two tokens: `grace_shutdown` asks components to stop
//! taking new work, `shutdown` is the hard stop. Both are built once by the
//! binary and handed down explicitly.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors;

#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    shutdown: CancellationToken,
    grace_shutdown: CancellationToken,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hard stop. Cancelled exactly once, on every exit path of the
    /// coordinator.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Start of the grace period.
    pub fn grace_shutdown(&self) -> &CancellationToken {
        &self.grace_shutdown
    }
}

/// Completes when the process receives SIGINT, SIGTERM or SIGQUIT.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Completes on Ctrl-C.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Blocks until a fatal error, an OS signal or an external shutdown.
///
/// An error wins over a signal that arrives at the same time and is returned
/// as is. `shutdown` is cancelled on every path.
pub async fn wait_for_signal(
    errors: &mut mpsc::Receiver<anyhow::Error>,
    lifecycle: &Lifecycle,
) -> anyhow::Result<()> {
    wait_for_signal_with(errors, lifecycle, wait_for_shutdown_signal()).await
}

pub async fn wait_for_signal_with<F>(
    errors: &mut mpsc::Receiver<anyhow::Error>,
    lifecycle: &Lifecycle,
    signal: F,
) -> anyhow::Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    let result = tokio::select! {
        biased;
        Some(e) = errors.recv() => {
            tracing::error!("Shutting down after error: {:#}", e);
            Err(e)
        }
        _ = observed(signal) => {
            tracing::info!("Received shutdown signal");
            Ok(())
        }
        _ = lifecycle.shutdown.cancelled() => Ok(()),
    };
    lifecycle.shutdown.cancel();
    result
}

/// Two-phase variant of [`wait_for_signal`].
///
/// A fatal error cancels both tokens and is returned without a grace period.
/// A signal or an external `grace_shutdown` starts the grace phase: it lasts
/// until `grace_period` elapses, a late error arrives, `shutdown` is
/// cancelled elsewhere or a second signal forces the stop. `shutdown` is then
/// cancelled and `Ok` returned. An external `shutdown` before any of this
/// also cancels `grace_shutdown`.
pub async fn wait_for_signal_with_grace_shutdown(
    errors: &mut mpsc::Receiver<anyhow::Error>,
    lifecycle: &Lifecycle,
    grace_period: Duration,
) -> anyhow::Result<()> {
    wait_for_signal_with_grace_shutdown_with(
        errors,
        lifecycle,
        grace_period,
        wait_for_shutdown_signal,
    )
    .await
}

pub async fn wait_for_signal_with_grace_shutdown_with<S, F>(
    errors: &mut mpsc::Receiver<anyhow::Error>,
    lifecycle: &Lifecycle,
    grace_period: Duration,
    mut signal: S,
) -> anyhow::Result<()>
where
    S: FnMut() -> F,
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        biased;
        Some(e) = errors.recv() => {
            tracing::error!("Shutting down after error: {:#}", e);
            lifecycle.grace_shutdown.cancel();
            lifecycle.shutdown.cancel();
            return Err(e);
        }
        _ = observed(signal()) => {
            tracing::info!(
                grace_period = %humantime::format_duration(grace_period),
                "Received shutdown signal, starting graceful shutdown"
            );
            lifecycle.grace_shutdown.cancel();
        }
        _ = lifecycle.grace_shutdown.cancelled() => {
            tracing::info!(
                grace_period = %humantime::format_duration(grace_period),
                "Graceful shutdown requested"
            );
        }
        _ = lifecycle.shutdown.cancelled() => {
            lifecycle.grace_shutdown.cancel();
            return Ok(());
        }
    }

    tokio::select! {
        biased;
        Some(e) = errors.recv() => {
            tracing::warn!("Error during graceful shutdown: {:#}", e);
        }
        _ = lifecycle.shutdown.cancelled() => {}
        _ = observed(signal()) => {
            tracing::warn!("Received second shutdown signal, stopping now");
        }
        _ = tokio::time::sleep(grace_period) => {
            tracing::info!("Grace period elapsed");
        }
    }

    lifecycle.shutdown.cancel();
    Ok(())
}

/// Resolves when `signal` fires. A handler that cannot be installed never
/// resolves, so it cannot trigger a shutdown by itself.
async fn observed<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        tracing::warn!("{}: {}", errors::signal::HANDLER_FAILED, e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Notify;

    const TICK: Duration = Duration::from_millis(50);

    fn never() -> std::future::Pending<std::io::Result<()>> {
        std::future::pending()
    }

    type SignalFuture = std::pin::Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>>;

    fn notified(notify: &Arc<Notify>) -> impl FnMut() -> SignalFuture + Send + use<> {
        let notify = notify.clone();
        move || {
            let notify = notify.clone();
            Box::pin(async move {
                notify.notified().await;
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_error_cancels_shutdown() {
        let (tx, mut rx) = mpsc::channel(1);
        let lifecycle = Lifecycle::new();
        tx.send(anyhow::anyhow!("server error")).await.unwrap();

        let result = wait_for_signal_with(&mut rx, &lifecycle, never()).await;
        assert_eq!(result.unwrap_err().to_string(), "server error");
        assert!(lifecycle.shutdown().is_cancelled());
    }

    #[tokio::test]
    async fn test_error_wins_over_concurrent_signal() {
        let (tx, mut rx) = mpsc::channel(1);
        let lifecycle = Lifecycle::new();
        tx.send(anyhow::anyhow!("server error")).await.unwrap();

        let result = wait_for_signal_with(&mut rx, &lifecycle, async { Ok(()) }).await;
        assert!(result.is_err());

        let (tx, mut rx) = mpsc::channel(1);
        let lifecycle = Lifecycle::new();
        tx.send(anyhow::anyhow!("server error")).await.unwrap();
        let result = wait_for_signal_with_grace_shutdown_with(&mut rx, &lifecycle, TICK, || async {
            Ok(())
        })
        .await;
        assert!(result.is_err());
        assert!(lifecycle.shutdown().is_cancelled());
        assert!(lifecycle.grace_shutdown().is_cancelled());
    }

    #[tokio::test]
    async fn test_signal_cancels_shutdown() {
        let (_tx, mut rx) = mpsc::channel::<anyhow::Error>(1);
        let lifecycle = Lifecycle::new();

        let result = wait_for_signal_with(&mut rx, &lifecycle, async {
            tokio::time::sleep(TICK).await;
            Ok(())
        })
        .await;
        assert!(result.is_ok());
        assert!(lifecycle.shutdown().is_cancelled());
    }

    #[tokio::test]
    async fn test_external_shutdown_returns() {
        let (_tx, mut rx) = mpsc::channel::<anyhow::Error>(1);
        let lifecycle = Lifecycle::new();
        lifecycle.shutdown().cancel();

        let result = wait_for_signal_with(&mut rx, &lifecycle, never()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_failed_signal_handler_does_not_shut_down() {
        let (tx, mut rx) = mpsc::channel(1);
        let lifecycle = Lifecycle::new();

        let sender = tokio::spawn(async move {
            tokio::time::sleep(TICK).await;
            tx.send(anyhow::anyhow!("later")).await.unwrap();
        });
        let result = wait_for_signal_with(&mut rx, &lifecycle, async {
            Err(std::io::Error::other("no signal support"))
        })
        .await;
        assert_eq!(result.unwrap_err().to_string(), "later");
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_grace_external_shutdown_cancels_grace() {
        let (_tx, mut rx) = mpsc::channel::<anyhow::Error>(1);
        let lifecycle = Lifecycle::new();
        lifecycle.shutdown().cancel();

        let result =
            wait_for_signal_with_grace_shutdown_with(&mut rx, &lifecycle, TICK, never).await;
        assert!(result.is_ok());
        assert!(lifecycle.grace_shutdown().is_cancelled());
    }

    #[tokio::test]
    async fn test_grace_external_grace_shutdown_waits_period() {
        let (_tx, mut rx) = mpsc::channel::<anyhow::Error>(1);
        let lifecycle = Lifecycle::new();
        lifecycle.grace_shutdown().cancel();

        let started = tokio::time::Instant::now();
        let result =
            wait_for_signal_with_grace_shutdown_with(&mut rx, &lifecycle, TICK, never).await;
        assert!(result.is_ok());
        assert!(started.elapsed() >= TICK);
        assert!(lifecycle.shutdown().is_cancelled());
    }

    #[tokio::test]
    async fn test_grace_signal_holds_shutdown_during_grace() {
        let (_tx, rx) = mpsc::channel::<anyhow::Error>(1);
        let lifecycle = Lifecycle::new();
        let signal = Arc::new(Notify::new());
        signal.notify_one();

        let coordinator = {
            let lifecycle = lifecycle.clone();
            let next = notified(&signal);
            tokio::spawn(async move {
                let mut rx = rx;
                wait_for_signal_with_grace_shutdown_with(
                    &mut rx,
                    &lifecycle,
                    Duration::from_secs(60),
                    next,
                )
                .await
            })
        };

        tokio::time::timeout(Duration::from_secs(2), lifecycle.grace_shutdown().cancelled())
            .await
            .unwrap();
        tokio::time::sleep(TICK).await;
        assert!(!lifecycle.shutdown().is_cancelled());

        lifecycle.shutdown().cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), coordinator)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_grace_period_elapses() {
        let (_tx, mut rx) = mpsc::channel::<anyhow::Error>(1);
        let lifecycle = Lifecycle::new();
        let signal = Arc::new(Notify::new());
        signal.notify_one();

        let started = tokio::time::Instant::now();
        let result =
            wait_for_signal_with_grace_shutdown_with(&mut rx, &lifecycle, TICK, notified(&signal))
                .await;
        assert!(result.is_ok());
        assert!(started.elapsed() >= TICK);
        assert!(lifecycle.grace_shutdown().is_cancelled());
        assert!(lifecycle.shutdown().is_cancelled());
    }

    #[tokio::test]
    async fn test_grace_late_error_ends_grace_without_failing() {
        let (tx, mut rx) = mpsc::channel(1);
        let lifecycle = Lifecycle::new();
        let signal = Arc::new(Notify::new());
        signal.notify_one();

        let sender = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                lifecycle.grace_shutdown().cancelled().await;
                tx.send(anyhow::anyhow!("grace error")).await.unwrap();
            })
        };

        let started = tokio::time::Instant::now();
        let result = wait_for_signal_with_grace_shutdown_with(
            &mut rx,
            &lifecycle,
            Duration::from_secs(10),
            notified(&signal),
        )
        .await;

        assert!(result.is_ok());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(lifecycle.shutdown().is_cancelled());
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_second_signal_skips_grace_period() {
        let (_tx, mut rx) = mpsc::channel::<anyhow::Error>(1);
        let lifecycle = Lifecycle::new();
        let signal = Arc::new(Notify::new());
        signal.notify_one();

        let second = {
            let signal = signal.clone();
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                lifecycle.grace_shutdown().cancelled().await;
                signal.notify_one();
            })
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_signal_with_grace_shutdown_with(
                &mut rx,
                &lifecycle,
                Duration::from_secs(60),
                notified(&signal),
            ),
        )
        .await
        .unwrap();

        assert!(result.is_ok());
        assert!(lifecycle.shutdown().is_cancelled());
        second.await.unwrap();
    }
}
