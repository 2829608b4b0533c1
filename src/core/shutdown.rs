//! Process termination.
//!
//! Every way the process can end (SIGINT, SIGTERM, the telemetry loop
//! finishing on its own, a normal return from `main`) goes through
//! [`Shutdown::shutdown`], which cancels telemetry and stops the connection
//! exactly once. Later or concurrent calls wait for and return the outcome of
//! the first.

use std::{io, time::Duration};

use tempsim_mqtt::{ConnectionHandle, TransferError};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use super::telemetry::TelemetryHandle;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShutdownError {
    #[error("connection did not stop within {0:?}")]
    Timeout(Duration),

    #[error("connection stop failed: {0}")]
    Stop(String),
}

impl From<TransferError> for ShutdownError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::ShutdownTimeout(timeout) => ShutdownError::Timeout(timeout),
            other => ShutdownError::Stop(other.to_string()),
        }
    }
}

pub struct Shutdown {
    handle: ConnectionHandle,
    telemetry: Option<TelemetryHandle>,
    stop_timeout: Duration,
    outcome: OnceCell<Result<(), ShutdownError>>,
}

impl Shutdown {
    pub fn new(
        handle: ConnectionHandle,
        telemetry: Option<TelemetryHandle>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            handle,
            telemetry,
            stop_timeout,
            outcome: OnceCell::new(),
        }
    }

    /// Cancels telemetry, then stops the connection within `stop_timeout`.
    ///
    /// Runs once. A failure is logged and returned but leaves the connection
    /// released, so the caller can exit regardless.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.outcome.get_or_init(|| self.run()).await.clone()
    }

    pub fn is_done(&self) -> bool {
        self.outcome.initialized()
    }

    async fn run(&self) -> Result<(), ShutdownError> {
        info!(state = %self.handle.state(), "Shutdown sequence started");

        if let Some(telemetry) = &self.telemetry {
            telemetry.cancel();
            telemetry.join().await;
        }

        let result = self
            .handle
            .stop(self.stop_timeout)
            .await
            .map_err(ShutdownError::from);

        match &result {
            Ok(()) => info!("Shutdown complete"),
            Err(e) => error!(error = %e, "Shutdown finished with errors"),
        }
        result
    }
}

/// Resolves on the first SIGINT or SIGTERM (Ctrl-C elsewhere) and returns
/// the signal's name.
#[cfg(unix)]
pub async fn wait_for_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    };
    warn!(signal = name, "Termination signal received");
    Ok(name)
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    warn!(signal = "Ctrl-C", "Termination signal received");
    Ok("Ctrl-C")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempsim_mqtt::{
        testing::{stub_transport, StubController},
        ConnectionState, HandleOptions,
    };
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        config::telemetry::TelemetryConfig,
        core::telemetry::{Publisher, TelemetryLoop},
    };

    async fn ready_handle() -> (ConnectionHandle, StubController) {
        let (link, events, controller) = stub_transport();
        let handle = ConnectionHandle::with_transport(link, events, HandleOptions::default());
        handle.start().await.unwrap();
        controller.connect();
        handle.await_ready().await.unwrap();
        (handle, controller)
    }

    #[tokio::test]
    #[traced_test]
    async fn test_concurrent_calls_run_once() {
        let (handle, controller) = ready_handle().await;
        let shutdown = Shutdown::new(handle.clone(), None, Duration::from_secs(1));

        let (first, second) = tokio::join!(shutdown.shutdown(), shutdown.shutdown());
        assert_eq!(first, Ok(()));
        assert_eq!(second, Ok(()));
        assert_eq!(shutdown.shutdown().await, Ok(()));

        assert!(shutdown.is_done());
        assert_eq!(controller.disconnect_count(), 1);
        assert_eq!(handle.state(), ConnectionState::Stopped);
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|line| line.contains("Shutdown sequence started"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("expected one shutdown sequence, saw {n}")),
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancels_telemetry_before_stopping() {
        let (handle, controller) = ready_handle().await;
        let publisher: Arc<dyn Publisher> = Arc::new(handle.clone());
        let config = TelemetryConfig {
            interval_ms: 1000,
            ..Default::default()
        };
        let telemetry = TelemetryLoop::new(publisher, "dev-1", &config)
            .unwrap()
            .start(handle.subscribe_state());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let shutdown = Shutdown::new(handle.clone(), Some(telemetry.clone()), Duration::from_secs(1));
        shutdown.shutdown().await.unwrap();

        assert!(telemetry.is_finished());
        let published = controller.publish_attempts();
        assert_eq!(published, 2);

        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(controller.publish_attempts(), published);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_reported_once() {
        let (handle, controller) = ready_handle().await;
        controller.hold_disconnect();
        let shutdown = Shutdown::new(handle.clone(), None, Duration::from_millis(200));

        let timeout = Err(ShutdownError::Timeout(Duration::from_millis(200)));
        assert_eq!(shutdown.shutdown().await, timeout);
        assert_eq!(shutdown.shutdown().await, timeout);
        assert_eq!(handle.state(), ConnectionState::Stopped);
        assert_eq!(controller.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_of_unstarted_connection() {
        let (link, events, controller) = stub_transport();
        let handle = ConnectionHandle::with_transport(link, events, HandleOptions::default());
        let shutdown = Shutdown::new(handle.clone(), None, Duration::from_secs(1));

        assert_eq!(shutdown.shutdown().await, Ok(()));
        assert_eq!(handle.state(), ConnectionState::Stopped);
        assert_eq!(controller.disconnect_count(), 0);
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            ShutdownError::from(TransferError::ShutdownTimeout(Duration::from_secs(5))),
            ShutdownError::Timeout(Duration::from_secs(5))
        );
        assert!(matches!(
            ShutdownError::from(TransferError::Stopped),
            ShutdownError::Stop(_)
        ));
    }
}
