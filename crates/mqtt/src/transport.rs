//! Transport seam between the connection kernel and the MQTT client.
//!
//! The kernel never touches `rumqttc` directly. It publishes through a
//! [`Link`] and consumes [`LinkEvent`]s from an [`EventSource`]. The production
//! pair is [`RumqttLink`] / [`RumqttEvents`]; tests use the in-memory stub in
//! `crate::testing`.
//!
//! ```text
//! ConnectionHandle ──publish/disconnect──▶ Link ──▶ AsyncClient
//!        ▲                                              │
//!   state / events                                   requests
//!        │                                              ▼
//! ConnectionKernel ◀──LinkEvent── EventSource ◀── EventLoop::poll
//! ```

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet, QoS,
};
use tracing::{debug, error, trace, warn};

use super::error::TransferError;

/// Lifecycle and inbound events reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A connection attempt is about to be made.
    AttemptingConnect,

    /// The broker accepted the connection.
    ConnectionSuccess { session_present: bool },

    /// An attempt failed before the link was ever up.
    ConnectionFailure(String),

    /// An established link was lost.
    Disconnection(String),

    /// A message arrived on a subscribed topic.
    MessageReceived { topic: String, payload: Bytes },

    /// The broker acknowledged a QoS 1 publish.
    PublishAcknowledged { packet_id: u16 },

    /// A requested disconnect completed; no further events follow.
    Closed,
}

/// Outbound half of a transport. Shared by every task that publishes.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Hands a message to the transport. Returns once it is queued for
    /// sending, not when it is acknowledged.
    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), TransferError>;

    /// Requests a graceful disconnect. The matching event source reports
    /// `LinkEvent::Closed` once it has been carried out.
    async fn disconnect(&self) -> Result<(), TransferError>;
}

/// Inbound half of a transport. Driven by exactly one task.
#[async_trait]
pub trait EventSource: Send + 'static {
    /// Waits for the next event. `None` means the source is exhausted.
    async fn next_event(&mut self) -> Option<LinkEvent>;
}

/// Builds the production transport pair from a client and its event loop.
pub fn rumqtt_transport(
    client: AsyncClient,
    event_loop: EventLoop,
    reconnect_delay: Duration,
) -> (RumqttLink, RumqttEvents) {
    let closing = Arc::new(AtomicBool::new(false));
    (
        RumqttLink {
            client,
            closing: closing.clone(),
        },
        RumqttEvents::new(event_loop, reconnect_delay, closing),
    )
}

#[derive(Clone)]
pub struct RumqttLink {
    client: AsyncClient,
    /// Set once a disconnect has been requested; read by `RumqttEvents`.
    closing: Arc<AtomicBool>,
}

#[async_trait]
impl Link for RumqttLink {
    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), TransferError> {
        self.client.publish_bytes(topic, qos, false, payload).await?;
        Ok(())
    }

    /// Queues DISCONNECT without waiting for channel space. The event loop is
    /// not polled while this runs, so a full request channel would otherwise
    /// block until the stop deadline; on failure the caller closes at once.
    async fn disconnect(&self) -> Result<(), TransferError> {
        self.closing.store(true, Ordering::Release);
        self.client.try_disconnect()?;
        Ok(())
    }
}

/// Drives `rumqttc::EventLoop` and translates what it yields.
///
/// `rumqttc` reconnects on the next `poll()` after an error. This adapter
/// only inserts a fixed pause before that poll, so a dead broker is not
/// hammered in a tight loop.
pub struct RumqttEvents {
    event_loop: EventLoop,
    reconnect_delay: Duration,
    closing: Arc<AtomicBool>,
    connected: bool,
    attempt_pending: bool,
    pause_pending: bool,
    finished: bool,
}

impl RumqttEvents {
    fn new(event_loop: EventLoop, reconnect_delay: Duration, closing: Arc<AtomicBool>) -> Self {
        Self {
            event_loop,
            reconnect_delay,
            closing,
            connected: false,
            attempt_pending: true,
            pause_pending: false,
            finished: false,
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn translate(&mut self, event: Event) -> Option<LinkEvent> {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    self.connected = true;
                    Some(LinkEvent::ConnectionSuccess {
                        session_present: ack.session_present,
                    })
                } else {
                    Some(LinkEvent::ConnectionFailure(format!(
                        "Connection refused: {:?}",
                        ack.code
                    )))
                }
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                Some(LinkEvent::PublishAcknowledged { packet_id: ack.pkid })
            }
            Event::Incoming(Packet::Publish(publish)) => Some(LinkEvent::MessageReceived {
                topic: publish.topic,
                payload: publish.payload,
            }),
            Event::Incoming(Packet::Disconnect) => {
                self.connected = false;
                Some(LinkEvent::Disconnection("Disconnected by broker".into()))
            }
            Event::Outgoing(Outgoing::Disconnect) if self.is_closing() => {
                self.finished = true;
                Some(LinkEvent::Closed)
            }
            other => {
                trace!("Unhandled MQTT event: {:?}", other);
                None
            }
        }
    }

    fn on_error(&mut self, err: ConnectionError) -> LinkEvent {
        let reason = get_error_message(&err);

        if self.is_closing() {
            debug!(error = %reason, "Event loop ended while closing");
            self.finished = true;
            return LinkEvent::Closed;
        }

        match classify_connection_error(&err) {
            Disposition::Fatal => error!(
                error = %reason,
                retry_in = ?self.reconnect_delay,
                "Connection error that is unlikely to recover, retrying anyway"
            ),
            Disposition::Reconnect => warn!(
                error = %reason,
                retry_in = ?self.reconnect_delay,
                "Connection error, retrying"
            ),
        }

        self.pause_pending = true;
        self.attempt_pending = true;

        if std::mem::take(&mut self.connected) {
            LinkEvent::Disconnection(reason)
        } else {
            LinkEvent::ConnectionFailure(reason)
        }
    }
}

#[async_trait]
impl EventSource for RumqttEvents {
    async fn next_event(&mut self) -> Option<LinkEvent> {
        loop {
            if self.finished {
                return None;
            }

            if self.pause_pending && !self.is_closing() {
                tokio::time::sleep(self.reconnect_delay).await;
            }
            self.pause_pending = false;

            if self.attempt_pending {
                self.attempt_pending = false;
                return Some(LinkEvent::AttemptingConnect);
            }

            match self.event_loop.poll().await {
                Ok(event) => {
                    if let Some(link_event) = self.translate(event) {
                        return Some(link_event);
                    }
                }
                Err(err) => return Some(self.on_error(err)),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    // Retrying will not help without operator action
    Fatal,
    // Temporary condition
    Reconnect,
}

pub(crate) fn classify_connection_error(err: &ConnectionError) -> Disposition {
    use Disposition::*;

    match err {
        // Bad certificates or key, or an incompatible crypto setup
        ConnectionError::Tls(_) => Fatal,

        ConnectionError::MqttState(_) => Fatal,

        ConnectionError::NotConnAck(_) => Fatal,

        ConnectionError::RequestsDone => Fatal,

        ConnectionError::Io(e) => match e.kind() {
            std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::InvalidData => Fatal,
            _ => Reconnect,
        },

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Reconnect,

        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized => Fatal,
            _ => Reconnect,
        },

        #[allow(unreachable_patterns)]
        _ => Reconnect,
    }
}

/// Innermost message of an error chain, without surrounding quotes.
fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}
