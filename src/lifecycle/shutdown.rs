//! Shutdown coordination for the proxy.

use std::time::Duration;

use hyper_util::server::graceful::GracefulShutdown;
use tokio::sync::watch;

use crate::error::{ProxyError, Result};
use crate::net::admission::AdmissionController;

/// Coordinator for graceful shutdown.
///
/// Cloning shares the same trigger. Subscribers created after the trigger
/// still observe it.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of [`Shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait for the trigger. Never resolves if every [`Shutdown`] was
    /// dropped without triggering.
    pub async fn recv(&mut self) {
        if self.rx.wait_for(|triggered| *triggered).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Waits for in-flight work once the server has stopped accepting.
///
/// Two things are drained: HTTP connections (told to stop keep-alive and
/// finish the request they are on), and admission slots, which are still
/// held by tunnels that outlived their HTTP connection.
pub struct DrainController {
    connections: GracefulShutdown,
    admission: AdmissionController,
    deadline: Duration,
}

impl DrainController {
    pub fn new(
        connections: GracefulShutdown,
        admission: AdmissionController,
        deadline: Duration,
    ) -> Self {
        Self {
            connections,
            admission,
            deadline,
        }
    }

    /// Drain, bounded by the deadline. Tunnels are never severed here;
    /// a tunnel still open at the deadline turns into `DrainTimeout`.
    pub async fn drain(self) -> Result<()> {
        let Self {
            connections,
            admission,
            deadline,
        } = self;

        tracing::info!(
            in_flight = admission.in_flight(),
            deadline = ?deadline,
            "Draining connections"
        );

        let waiting = admission.clone();
        let drained = tokio::time::timeout(deadline, async move {
            connections.shutdown().await;
            tracing::debug!(in_flight = waiting.in_flight(), "HTTP connections closed");
            waiting.wait_idle().await
        })
        .await;

        match drained {
            Ok(result) => {
                result?;
                tracing::info!("Gracefully stopped");
                Ok(())
            }
            Err(_) => Err(ProxyError::DrainTimeout {
                timeout: deadline,
                in_flight: admission.in_flight(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscriber_sees_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        assert!(shutdown.is_triggered());

        let mut signal = shutdown.subscribe();
        tokio::time::timeout(Duration::from_millis(100), signal.recv())
            .await
            .expect("trigger should already be visible");
    }

    #[tokio::test]
    async fn drain_waits_for_held_slots() {
        let admission = AdmissionController::new(2);
        let slot = admission.acquire().await.unwrap();

        let drain = tokio::spawn(
            DrainController::new(GracefulShutdown::new(), admission.clone(), Duration::from_secs(5))
                .drain(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!drain.is_finished());

        drop(slot);
        drain.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn drain_deadline_is_shutdown_failure() {
        let admission = AdmissionController::new(1);
        let _stuck = admission.acquire().await.unwrap();

        let err = DrainController::new(GracefulShutdown::new(), admission, Duration::from_millis(50))
            .drain()
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::DrainTimeout { in_flight: 1, .. }));
    }
}
