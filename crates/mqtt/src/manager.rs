//! Connection manager and the handle applications hold.
//!
//! `MqttManager` validates settings and builds the mutual-TLS client.
//! The resulting [`ConnectionHandle`] is the one live connection of the
//! process: it starts the kernel, gates publishes on the `Ready` state and
//! runs the stop sequence.
//!
//! # Typical Usage
//!
//! ```ignore
//! let handle = MqttManager::from_config(config).build()?;
//! handle.start().await?;
//! handle.await_ready().await?;
//! handle.publish("device/temperature", payload, QoS::AtLeastOnce).await?;
//! handle.stop(Duration::from_secs(5)).await?;
//! ```

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use rumqttc::QoS;
use tokio::{
    sync::{broadcast, watch, Mutex, Notify, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::{
    client::ClientBuilder,
    config::Config,
    connection::{update_state, ConnectionKernel},
    error::TransferError,
    state::ConnectionState,
    transport::{rumqtt_transport, EventSource, Link, LinkEvent},
};

/// Counts in-flight publishes so that a stop can wait for them.
#[derive(Debug, Default)]
pub(crate) struct PublishDrain {
    inflight: AtomicUsize,
    notify: Notify,
}

impl PublishDrain {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enter(self: &Arc<Self>) -> PublishGuard {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        PublishGuard {
            drain: self.clone(),
        }
    }

    pub(crate) fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Resolves once no publish is in flight.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed.
            notified.as_mut().enable();

            if self.inflight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct PublishGuard {
    drain: Arc<PublishDrain>,
}

impl Drop for PublishGuard {
    fn drop(&mut self) {
        if self.drain.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drain.notify.notify_waiters();
        }
    }
}

/// Returned when the transport accepted a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    pub topic: String,
    pub qos: QoS,
    pub payload_len: usize,
}

/// Tuning for a [`ConnectionHandle`].
#[derive(Debug, Clone)]
pub struct HandleOptions {
    /// Buffer size of the `LinkEvent` broadcast channel. Slow subscribers
    /// that fall further behind miss events.
    pub event_capacity: usize,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self { event_capacity: 64 }
    }
}

/// Entry point for building the broker connection.
pub struct MqttManager {
    config: Config,
}

impl MqttManager {
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validates the settings, reads the TLS material and constructs the
    /// client. No connection is attempted until `ConnectionHandle::start`.
    ///
    /// # Errors
    /// - `TransferError::ConfigError`: a field failed validation
    /// - `TransferError::Configuration`: a certificate or key is unreadable
    pub fn build(self) -> Result<ConnectionHandle, TransferError> {
        info!(
            host = %self.config.host,
            port = self.config.port,
            client_id = %self.config.client_id,
            "Building MQTT connection"
        );

        let (client, event_loop) = ClientBuilder::from_config(&self.config)?.build()?;
        let (link, events) = rumqtt_transport(
            client,
            event_loop,
            Duration::from_secs(self.config.reconnect_delay),
        );

        info!("MQTT connection built successfully");
        Ok(ConnectionHandle::with_transport(
            link,
            events,
            HandleOptions::default(),
        ))
    }
}

struct Inner {
    /// `None` once the transport has been released by `stop`.
    link: RwLock<Option<Arc<dyn Link>>>,
    /// Taken by `start`; a second `start` finds it empty.
    events: Mutex<Option<Box<dyn EventSource>>>,
    /// Kernel task. The lock also serializes `start` and `stop`.
    kernel: Mutex<Option<JoinHandle<()>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    events_tx: broadcast::Sender<LinkEvent>,
    drain: Arc<PublishDrain>,
    cancel: CancellationToken,
}

/// Shared handle to the single broker connection.
///
/// Clones refer to the same connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("state", &self.state())
            .field("inflight", &self.inner.drain.inflight())
            .finish()
    }
}

impl ConnectionHandle {
    /// Builds an `Idle` handle over any transport.
    pub fn with_transport(
        link: impl Link,
        events: impl EventSource,
        options: HandleOptions,
    ) -> Self {
        let link: Arc<dyn Link> = Arc::new(link);
        let events: Box<dyn EventSource> = Box::new(events);
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (events_tx, _) = broadcast::channel(options.event_capacity.max(1));

        Self {
            inner: Arc::new(Inner {
                link: RwLock::new(Some(link)),
                events: Mutex::new(Some(events)),
                kernel: Mutex::new(None),
                state_tx: Arc::new(state_tx),
                events_tx,
                drain: Arc::new(PublishDrain::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Spawns the connection kernel and enters `Connecting`.
    ///
    /// Returns immediately; use `await_ready` to wait for the handshake.
    pub async fn start(&self) -> Result<(), TransferError> {
        let mut kernel_slot = self.inner.kernel.lock().await;

        if self.state().is_stopped() {
            return Err(TransferError::Stopped);
        }

        let events = self
            .inner
            .events
            .lock()
            .await
            .take()
            .ok_or(TransferError::AlreadyStarted)?;
        let link = self
            .inner
            .link
            .read()
            .await
            .clone()
            .ok_or(TransferError::Stopped)?;

        update_state(&self.inner.state_tx, ConnectionState::Connecting);

        let kernel = ConnectionKernel::new(
            link,
            events,
            self.inner.cancel.clone(),
            self.inner.state_tx.clone(),
            self.inner.events_tx.clone(),
        );
        *kernel_slot = Some(tokio::spawn(kernel.run().in_current_span()));

        Ok(())
    }

    /// Waits until the connection is `Ready`.
    ///
    /// Connection failures do not resolve this; it keeps waiting across
    /// retries. Returns `TransferError::Stopped` if the handle stops first.
    pub async fn await_ready(&self) -> Result<(), TransferError> {
        let mut rx = self.inner.state_tx.subscribe();
        let ready = rx
            .wait_for(|state| state.is_ready() || state.is_stopped())
            .await
            .map_err(|_| TransferError::Stopped)?
            .is_ready();

        if ready {
            Ok(())
        } else {
            Err(TransferError::Stopped)
        }
    }

    /// Publishes `payload` to `topic`.
    ///
    /// Outside `Ready` this fails with `NotReady` and the transport is not
    /// called.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> Result<PublishResult, TransferError> {
        let state = self.state();
        if !state.is_ready() {
            debug!(topic, state = %state, "Publish rejected, connection not ready");
            return Err(TransferError::NotReady(state));
        }

        let _guard = self.inner.drain.enter();
        let link = self
            .inner
            .link
            .read()
            .await
            .clone()
            .ok_or(TransferError::Stopped)?;

        let payload = payload.into();
        let payload_len = payload.len();
        link.publish(topic, qos, payload).await?;

        Ok(PublishResult {
            topic: topic.to_string(),
            qos,
            payload_len,
        })
    }

    /// Stops the connection and releases the transport.
    ///
    /// Waits for in-flight publishes, asks the kernel to disconnect and waits
    /// for `Stopped`. All of that is bounded by `timeout`; when it elapses the
    /// kernel task is aborted and `ShutdownTimeout` is returned, with the
    /// handle stopped anyway. Calling `stop` again is a no-op.
    pub async fn stop(&self, timeout: Duration) -> Result<(), TransferError> {
        let mut kernel_slot = self.inner.kernel.lock().await;

        if self.state().is_stopped() {
            debug!("Stop requested on an already stopped connection");
            return Ok(());
        }

        info!(state = %self.state(), "Stopping connection");

        let result = match kernel_slot.take() {
            None => {
                // Never started: nothing to drain or disconnect.
                self.inner.events.lock().await.take();
                Ok(())
            }
            Some(mut kernel) => {
                let outcome = tokio::time::timeout(timeout, async {
                    self.inner.drain.wait_idle().await;
                    self.inner.cancel.cancel();
                    (&mut kernel).await
                })
                .await;

                match outcome {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(join_err)) => {
                        error!("Connection kernel task failed: {join_err}");
                        Err(TransferError::Transport(format!(
                            "connection task failed: {join_err}"
                        )))
                    }
                    Err(_) => {
                        kernel.abort();
                        warn!(?timeout, "Stop timed out, aborting connection task");
                        Err(TransferError::ShutdownTimeout(timeout))
                    }
                }
            }
        };

        self.inner.link.write().await.take();
        debug!("Transport released");
        update_state(&self.inner.state_tx, ConnectionState::Stopped);
        info!("Connection stopped");

        result
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Number of publishes currently between the readiness check and the
    /// transport returning.
    pub fn inflight_publishes(&self) -> usize {
        self.inner.drain.inflight()
    }
}
