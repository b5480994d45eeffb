use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Held by every task taking part in shutdown. Dropping a guard cancels the shared token, and
/// shutdown completes once the last guard is gone.
pub struct ShutdownGuard {
    name: &'static str,
    token: CancellationToken,
    live: Arc<watch::Sender<usize>>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.token.cancel();
        self.live.send_modify(|n| *n -= 1);
        debug!("[{}] released shutdown guard ({} left)", self.name, *self.live.borrow());
    }
}

impl ShutdownGuard {
    fn new(name: &'static str, token: CancellationToken, live: Arc<watch::Sender<usize>>) -> Self {
        live.send_modify(|n| *n += 1);
        Self { name, token, live }
    }

    pub fn child(&self, name: &'static str) -> Self {
        Self::new(name, self.token.clone(), self.live.clone())
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawns a task that is abandoned as soon as shutdown begins.
    pub fn spawn_task<F, T>(&self, name: &'static str, task: T) -> JoinHandle<Option<T::Output>>
    where
        F: Send + 'static,
        T: Future<Output = anyhow::Result<F>> + Send + 'static,
    {
        let guard = self.child(name);
        tokio::spawn(async move {
            let token = guard.token();
            select! {
                output = task => {
                    if let Err(e) = &output {
                        error!("[{}] {:#}", guard.name, e);
                    }
                    Some(output)
                }
                _ = token.cancelled() => None,
            }
        })
    }

    /// Spawns a task that observes the token itself; shutdown waits for it to run to completion.
    pub fn spawn_draining<F, T>(&self, name: &'static str, task: T) -> JoinHandle<T::Output>
    where
        F: Send + 'static,
        T: Future<Output = anyhow::Result<F>> + Send + 'static,
    {
        let guard = self.child(name);
        tokio::spawn(async move {
            let output = task.await;
            if let Err(e) = &output {
                error!("[{}] {:#}", guard.name, e);
            }
            output
        })
    }
}

// a task's draining guard is dropped just before its handle reports completion
const JOIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ShutdownError {
    #[error("shutdown interrupted by a second signal")]
    Signal,
    #[error("tasks did not stop before the shutdown timeout")]
    Timeout,
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Resolves on SIGINT or SIGTERM. If the handlers cannot be installed it never resolves, and
/// shutdown can only be triggered from inside the process.
async fn termination_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("unable to install signal handlers: {}", e);
            return std::future::pending().await;
        }
    };

    select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

/// Coordinates the shutdown of a process: a signal or any guarded task finishing cancels the
/// shared token, then draining tasks get a bounded amount of time to finish.
pub struct Shutdown {
    name: &'static str,
    guard: ShutdownGuard,
    live: watch::Receiver<usize>,
}

impl Shutdown {
    pub fn new(name: &'static str) -> Self {
        let (tx, live) = watch::channel(0);
        Self {
            name,
            guard: ShutdownGuard::new("root", CancellationToken::new(), Arc::new(tx)),
            live,
        }
    }

    pub fn spawn_task<F, T>(&self, name: &'static str, task: T) -> JoinHandle<Option<T::Output>>
    where
        F: Send + 'static,
        T: Future<Output = anyhow::Result<F>> + Send + 'static,
    {
        self.guard.spawn_task(name, task)
    }

    pub fn spawn_draining<F, T>(&self, name: &'static str, task: T) -> JoinHandle<T::Output>
    where
        F: Send + 'static,
        T: Future<Output = anyhow::Result<F>> + Send + 'static,
    {
        self.guard.spawn_draining(name, task)
    }

    pub fn guard(&self, name: &'static str) -> ShutdownGuard {
        self.guard.child(name)
    }

    pub fn token(&self) -> CancellationToken {
        self.guard.token()
    }

    pub async fn wait_for_shutdown(mut self, timeout: Duration) -> Result<(), ShutdownError> {
        let token = self.guard.token();
        select! {
            _ = termination_signal() => {
                info!("received signal, shutting down {}", self.name);
                token.cancel();
            }
            _ = token.cancelled() => {
                warn!("{} shutting down", self.name);
            }
        }

        drop(self.guard);
        select! {
            _ = self.live.wait_for(|n| *n == 0) => {
                info!("{} shutdown complete", self.name);
                Ok(())
            }
            _ = termination_signal() => {
                info!("received second signal, shutting down {} immediately", self.name);
                Err(ShutdownError::Signal)
            }
            _ = tokio::time::sleep(timeout) => {
                warn!("{} failed to shut down within {:?}", self.name, timeout);
                Err(ShutdownError::Timeout)
            }
        }
    }

    /// Waits for shutdown like [Shutdown::wait_for_shutdown], then returns the output of
    /// `handle`, which should come from [Shutdown::spawn_draining].
    pub async fn join<T>(
        self,
        handle: JoinHandle<T>,
        timeout: Duration,
    ) -> Result<T, ShutdownError> {
        self.wait_for_shutdown(timeout).await?;

        match tokio::time::timeout(JOIN_GRACE, handle).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(ShutdownError::Panicked(e.to_string())),
            Err(_) => Err(ShutdownError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_draining_task_completes_before_shutdown() {
        let shutdown = Shutdown::new("test");
        let token = shutdown.token();
        let drained = Arc::new(AtomicBool::new(false));

        let flag = drained.clone();
        shutdown.spawn_draining("drain", async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        shutdown.token().cancel();
        assert_eq!(
            shutdown.wait_for_shutdown(Duration::from_secs(5)).await,
            Ok(())
        );
        assert!(drained.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_finished_task_triggers_shutdown() {
        let shutdown = Shutdown::new("test");
        shutdown.spawn_draining("short", async { Ok(()) });

        assert_eq!(
            shutdown.wait_for_shutdown(Duration::from_secs(5)).await,
            Ok(())
        );
    }

    #[tokio::test]
    async fn test_join_returns_task_output() {
        for _ in 0..50 {
            let shutdown = Shutdown::new("test");
            let handle = shutdown.spawn_draining("short", async { Ok(7) });

            let output = shutdown.join(handle, Duration::from_secs(5)).await;
            assert_eq!(output.unwrap().unwrap(), 7);
        }
    }

    #[tokio::test]
    async fn test_join_reports_task_error() {
        let shutdown = Shutdown::new("test");
        let handle = shutdown.spawn_draining("failing", async {
            Err::<(), _>(anyhow::anyhow!("boom"))
        });

        let output = shutdown.join(handle, Duration::from_secs(5)).await.unwrap();
        assert_eq!(output.unwrap_err().to_string(), "boom");
    }

    #[tokio::test]
    async fn test_timeout() {
        let shutdown = Shutdown::new("test");
        let _stuck = shutdown.guard("stuck");
        shutdown.token().cancel();

        assert_eq!(
            shutdown.wait_for_shutdown(Duration::from_millis(20)).await,
            Err(ShutdownError::Timeout)
        );
    }
}
