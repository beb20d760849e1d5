//! Handle to a running public port listener

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Shared handle to the accept loop serving one forward port.
///
/// Cloning yields another handle to the same listener. Stopping is
/// idempotent and waits for the accept loop to exit, so once
/// [`ListenerHandle::stop`] returns the port no longer accepts connections.
/// Connections already handed to a dispatcher are not affected.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    port: u16,
    cancel: CancellationToken,
    in_flight: Arc<AtomicUsize>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ListenerHandle {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            cancel: CancellationToken::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Token the accept loop watches for shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Counter of connections currently being dispatched
    pub fn in_flight_counter(&self) -> Arc<AtomicUsize> {
        self.in_flight.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Attach the accept loop task
    pub fn attach(&self, handle: JoinHandle<()>) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(old) = task.replace(handle) {
                old.abort();
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop accepting and wait for the accept loop to exit
    pub async fn stop(&self) {
        self.cancel.cancel();

        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            match task.await {
                Ok(()) => debug!("Listener on port {} stopped", self.port),
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("Listener task for port {} failed: {}", self.port, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let handle = ListenerHandle::new(9000);
        let token = handle.shutdown_token();
        handle.attach(tokio::spawn(async move { token.cancelled().await }));

        handle.stop().await;
        assert!(handle.is_stopped());
        handle.stop().await;
        handle.clone().stop().await;
    }

    #[tokio::test]
    async fn test_replacing_task_aborts_previous() {
        let handle = ListenerHandle::new(9001);
        let first = tokio::spawn(async { tokio::time::sleep(Duration::from_secs(60)).await });
        let abort = first.abort_handle();
        handle.attach(first);
        handle.attach(tokio::spawn(async {}));

        tokio::time::timeout(Duration::from_secs(1), async {
            while !abort.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        handle.stop().await;
    }
}
