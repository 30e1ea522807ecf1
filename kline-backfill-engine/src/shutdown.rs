use std::{
    future::{self, Future},
    io,
    sync::Arc,
};

use log::{info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::partition::{PartitionRouter, SinkError, SinkSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The provider returned a short page: no more history to fetch.
    Exhausted,
    /// An operator interrupt (Ctrl-C or SIGTERM) arrived.
    Interrupted,
    Failed,
}

struct ShutdownInner {
    state: ShutdownState,
    reason: Option<StopReason>,
}

/// Single place where a run is asked to stop and where it finishes stopping.
///
/// Stop requests from the poller and from the signal listener race; only the first one is
/// recorded. Finishing the stop closes every open partition.
pub struct ShutdownCoordinator {
    label: String,
    token: CancellationToken,
    inner: Mutex<ShutdownInner>,
}

impl ShutdownCoordinator {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            token: CancellationToken::new(),
            inner: Mutex::new(ShutdownInner {
                state: ShutdownState::Running,
                reason: None,
            }),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> ShutdownState {
        self.inner.lock().state
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.inner.lock().reason
    }

    pub fn is_stop_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns `true` when this call initiated the stop.
    pub fn request_stop(&self, reason: StopReason) -> bool {
        let mut guard = self.inner.lock();
        if guard.state != ShutdownState::Running {
            return false;
        }
        guard.state = ShutdownState::Stopping;
        guard.reason = Some(reason);
        drop(guard);
        info!("[{}] stop requested: {:?}", self.label, reason);
        self.token.cancel();
        true
    }

    /// Closes every partition still open, then moves to `Stopped`.
    pub fn complete(&self, router: &mut PartitionRouter) -> Result<Vec<SinkSummary>, SinkError> {
        let closed = self.complete_with(|| router.close_all())?;
        info!("[{}] closed {} partition(s)", self.label, closed.len());
        Ok(closed)
    }

    /// Runs `cleanup` in the `Stopping` state and reaches `Stopped` only once it has returned,
    /// whether it succeeded or not. A run that was never asked to stop is recorded as failed.
    pub fn complete_with<T, E>(&self, cleanup: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        {
            let mut guard = self.inner.lock();
            if guard.state == ShutdownState::Running {
                guard.state = ShutdownState::Stopping;
                guard.reason = Some(StopReason::Failed);
            }
        }
        self.token.cancel();
        let outcome = cleanup();
        self.inner.lock().state = ShutdownState::Stopped;
        outcome
    }
}

/// Spawns a task that turns Ctrl-C (and SIGTERM on unix) into an interrupted stop. The task
/// exits on its own once the run stops for any other reason.
pub fn spawn_interrupt_listener(coordinator: Arc<ShutdownCoordinator>) -> JoinHandle<()> {
    let token = coordinator.token();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = wait_for_interrupt() => {
                coordinator.request_stop(StopReason::Interrupted);
            }
        }
    })
}

#[cfg(unix)]
async fn wait_for_interrupt() {
    use tokio::signal::unix::{signal, SignalKind};

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {}", err);
                future::pending::<()>().await;
            }
        }
    };
    first_interrupt(tokio::signal::ctrl_c(), terminate).await;
}

#[cfg(not(unix))]
async fn wait_for_interrupt() {
    first_interrupt(tokio::signal::ctrl_c(), future::pending::<()>()).await;
}

/// Resolves on the first of Ctrl-C or `terminate`. If Ctrl-C cannot be listened for,
/// `terminate` alone still ends the wait.
async fn first_interrupt<C, T>(ctrl_c: C, terminate: T)
where
    C: Future<Output = io::Result<()>>,
    T: Future<Output = ()>,
{
    tokio::pin!(terminate);
    tokio::select! {
        result = ctrl_c => match result {
            Ok(()) => return,
            Err(err) => warn!("failed to listen for ctrl-c: {}", err),
        },
        _ = &mut terminate => return,
    }
    terminate.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_stop_request_wins() {
        let coordinator = ShutdownCoordinator::new("test");
        assert_eq!(coordinator.state(), ShutdownState::Running);
        assert!(!coordinator.is_stop_requested());

        assert!(coordinator.request_stop(StopReason::Interrupted));
        assert!(!coordinator.request_stop(StopReason::Exhausted));
        assert_eq!(coordinator.state(), ShutdownState::Stopping);
        assert_eq!(coordinator.stop_reason(), Some(StopReason::Interrupted));
        assert!(coordinator.token().is_cancelled());
    }

    #[tokio::test]
    async fn listener_exits_when_run_stops() {
        let coordinator = Arc::new(ShutdownCoordinator::new("test"));
        let handle = spawn_interrupt_listener(Arc::clone(&coordinator));
        coordinator.request_stop(StopReason::Exhausted);
        handle.await.unwrap();
        assert_eq!(coordinator.stop_reason(), Some(StopReason::Exhausted));
    }

    #[test]
    fn cleanup_runs_while_stopping() {
        let coordinator = ShutdownCoordinator::new("test");
        coordinator.request_stop(StopReason::Exhausted);

        let seen = coordinator.complete_with(|| Ok::<_, ()>(coordinator.state()));
        assert_eq!(seen, Ok(ShutdownState::Stopping));
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
        assert_eq!(coordinator.stop_reason(), Some(StopReason::Exhausted));
    }

    #[test]
    fn failed_cleanup_still_reaches_stopped() {
        let coordinator = ShutdownCoordinator::new("test");

        let outcome = coordinator.complete_with(|| {
            assert_eq!(coordinator.state(), ShutdownState::Stopping);
            Err::<(), _>("flush failed")
        });
        assert_eq!(outcome, Err("flush failed"));
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
        assert_eq!(coordinator.stop_reason(), Some(StopReason::Failed));
        assert!(coordinator.token().is_cancelled());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn complete_surfaces_flush_failure() {
        use crate::{BackfillConfig, BackfillMetrics};
        use core_types::{Candle, CurrencyPair, Period};
        use std::path::Path;

        if !Path::new("/dev/full").exists() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        // writes to /dev/full succeed until the buffer is flushed
        std::os::unix::fs::symlink(
            "/dev/full",
            dir.path().join("binance_kline_ltcusdt_1min_2024-01-01.csv"),
        )
        .unwrap();
        let config = BackfillConfig::new(
            CurrencyPair::new("LTC", "USDT"),
            Period::OneMin,
            1_704_067_200_000,
            dir.path(),
        );
        let mut router = PartitionRouter::new(&config, Arc::new(BackfillMetrics::new()));
        router
            .write(&Candle {
                timestamp: 1_704_067_200,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 1.0,
            })
            .unwrap();

        let coordinator = ShutdownCoordinator::new("test");
        coordinator.request_stop(StopReason::Exhausted);
        assert!(matches!(
            coordinator.complete(&mut router),
            Err(SinkError::Flush { .. })
        ));
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
        assert_eq!(router.open_partitions(), 0);
    }

    #[tokio::test]
    async fn terminate_still_heard_when_ctrl_c_unavailable() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let waiter = tokio::spawn(first_interrupt(
            async { Err(io::Error::new(io::ErrorKind::Other, "no ctrl-c handler")) },
            async move {
                let _ = rx.await;
            },
        ));
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tx.send(()).unwrap();
        waiter.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sigterm_requests_interrupted_stop() {
        use std::{process::Command, time::Duration};
        use tokio::signal::unix::{signal, SignalKind};

        // keep SIGTERM routed to tokio so a signal sent before the listener registers
        // cannot kill the test process
        let _guard = signal(SignalKind::terminate()).unwrap();
        let coordinator = Arc::new(ShutdownCoordinator::new("test"));
        let mut handle = spawn_interrupt_listener(Arc::clone(&coordinator));

        let pid = std::process::id().to_string();
        let mut stopped = false;
        for _ in 0..50 {
            let status = Command::new("kill").args(["-TERM", &pid]).status().unwrap();
            assert!(status.success());
            if tokio::time::timeout(Duration::from_millis(100), &mut handle)
                .await
                .is_ok()
            {
                stopped = true;
                break;
            }
        }
        assert!(stopped, "listener never observed SIGTERM");
        assert_eq!(coordinator.stop_reason(), Some(StopReason::Interrupted));
        assert_eq!(coordinator.state(), ShutdownState::Stopping);
    }
}
