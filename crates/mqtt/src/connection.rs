//! Connection kernel: the single task that drives a transport.
//!
//! The kernel consumes [`LinkEvent`]s from an [`EventSource`], turns them into
//! [`ConnectionState`] transitions, and rebroadcasts every event to
//! subscribers. It exits when the source reports `Closed`, when the source is
//! exhausted, or right away when shutdown is requested before the link was
//! ever ready.
//!
//! ```text
//! ConnectionHandle::start ──spawn──▶ ConnectionKernel::run
//!                                        │
//!             cancel ───────────────────▶│──▶ Link::disconnect (if Ready)
//!                                        │
//!     EventSource::next_event ──────────▶│──▶ watch<ConnectionState>
//!                                        │──▶ broadcast<LinkEvent>
//!                                        ▼
//!                                     Stopped
//! ```

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
    state::ConnectionState,
    transport::{EventSource, Link, LinkEvent},
};

pub(crate) struct ConnectionKernel {
    link: Arc<dyn Link>,
    events: Box<dyn EventSource>,
    cancel: CancellationToken,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    events_tx: broadcast::Sender<LinkEvent>,
}

impl ConnectionKernel {
    pub(crate) fn new(
        link: Arc<dyn Link>,
        events: Box<dyn EventSource>,
        cancel: CancellationToken,
        state_tx: Arc<watch::Sender<ConnectionState>>,
        events_tx: broadcast::Sender<LinkEvent>,
    ) -> Self {
        Self {
            link,
            events,
            cancel,
            state_tx,
            events_tx,
        }
    }

    /// Runs until the link is closed, then publishes `Stopped`.
    pub(crate) async fn run(mut self) {
        info!("Starting connection event loop...");
        let mut closing = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled(), if !closing => {
                    closing = true;
                    let link = self.link.clone();
                    let state_tx = self.state_tx.clone();
                    if !Self::request_disconnect(link, state_tx).await {
                        break;
                    }
                }

                event = self.events.next_event() => match event {
                    Some(event) => {
                        if !self.handle_event(event) {
                            break;
                        }
                    }
                    None => {
                        if !closing {
                            warn!("Event source ended without a disconnect request");
                        }
                        break;
                    }
                }
            }
        }

        update_state(&self.state_tx, ConnectionState::Stopped);
        info!("Connection kernel shutdown completed");
    }

    /// Returns true when a disconnect is in progress and the kernel must keep
    /// polling for `Closed`.
    ///
    /// Takes its parts rather than `&self`: the kernel owns a `!Sync` event
    /// source, and a `&ConnectionKernel` held across the await would make the
    /// task future `!Send`.
    async fn request_disconnect(
        link: Arc<dyn Link>,
        state_tx: Arc<watch::Sender<ConnectionState>>,
    ) -> bool {
        let state = state_tx.borrow().clone();
        if !state.is_ready() {
            info!(state = %state, "Shutdown requested before the link was ready, closing immediately");
            return false;
        }

        info!("Shutdown requested, sending DISCONNECT");
        match link.disconnect().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Error sending disconnect packet: {e}");
                false
            }
        }
    }

    /// Applies one event. Returns false once the link is closed.
    fn handle_event(&self, event: LinkEvent) -> bool {
        let keep_running = match &event {
            LinkEvent::AttemptingConnect => {
                info!("Attempting to connect to broker");
                true
            }
            LinkEvent::ConnectionSuccess { session_present } => {
                info!(session_present, "Connection established successfully");
                update_state(&self.state_tx, ConnectionState::Ready);
                true
            }
            LinkEvent::ConnectionFailure(reason) => {
                warn!(reason = %reason, "Connection attempt failed");
                true
            }
            LinkEvent::Disconnection(reason) => {
                warn!(reason = %reason, "Connection lost");
                update_state(&self.state_tx, ConnectionState::Disconnected(reason.clone()));
                true
            }
            LinkEvent::MessageReceived { topic, payload } => {
                debug!(
                    topic = %topic,
                    payload = %String::from_utf8_lossy(payload),
                    "Message received"
                );
                true
            }
            LinkEvent::PublishAcknowledged { packet_id } => {
                debug!(packet_id, "Publish acknowledged");
                true
            }
            LinkEvent::Closed => {
                info!("Link closed");
                false
            }
        };

        // Nobody listening is fine.
        let _ = self.events_tx.send(event);
        keep_running
    }
}

/// Moves the shared state to `next` if the transition is legal.
///
/// Returns whether the state changed. Illegal transitions are ignored, which
/// is how a failure while `Connecting` leaves the state untouched.
pub(crate) fn update_state(tx: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    let mut previous = None;
    let changed = tx.send_if_modified(|current| {
        if current.can_transition_to(&next) {
            previous = Some(std::mem::replace(current, next.clone()));
            true
        } else {
            false
        }
    });

    match previous {
        Some(previous) => info!(from = %previous, to = %next, "Connection state changed"),
        None => trace!(to = %next, "Connection state transition ignored"),
    }
    changed
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing::Instrument;
    use tracing_test::traced_test;

    use super::*;
    use crate::testing::{stub_transport, StubController};

    struct Harness {
        state_rx: watch::Receiver<ConnectionState>,
        events_rx: broadcast::Receiver<LinkEvent>,
        cancel: CancellationToken,
        controller: StubController,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_kernel() -> Harness {
        let (link, events, controller) = stub_transport();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (events_tx, events_rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let kernel = ConnectionKernel::new(
            Arc::new(link),
            Box::new(events),
            cancel.clone(),
            Arc::new(state_tx),
            events_tx,
        );
        Harness {
            state_rx,
            events_rx,
            cancel,
            controller,
            task: tokio::spawn(kernel.run().in_current_span()),
        }
    }

    async fn wait_state(rx: &mut watch::Receiver<ConnectionState>, expected: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| *s == expected))
            .await
            .expect("state not reached in time")
            .expect("state channel closed");
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_kernel_future_is_send() {
        let (link, events, _controller) = stub_transport();
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (events_tx, _) = broadcast::channel(4);
        let kernel = ConnectionKernel::new(
            Arc::new(link),
            Box::new(events),
            CancellationToken::new(),
            Arc::new(state_tx),
            events_tx,
        );
        let run = kernel.run();
        assert_send(&run);
    }

    #[test]
    fn test_update_state_ignores_illegal_transition() {
        let (tx, rx) = watch::channel(ConnectionState::Connecting);
        assert!(!update_state(&tx, ConnectionState::Disconnected("lost".into())));
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);

        assert!(update_state(&tx, ConnectionState::Ready));
        assert_eq!(*rx.borrow(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_failure_while_connecting_keeps_connecting() {
        let mut h = spawn_kernel();
        h.controller.emit(LinkEvent::AttemptingConnect);
        h.controller
            .emit(LinkEvent::ConnectionFailure("connection refused".into()));

        assert_eq!(h.events_rx.recv().await.unwrap(), LinkEvent::AttemptingConnect);
        assert!(matches!(
            h.events_rx.recv().await.unwrap(),
            LinkEvent::ConnectionFailure(_)
        ));
        assert_eq!(*h.state_rx.borrow(), ConnectionState::Connecting);

        h.controller.connect();
        wait_state(&mut h.state_rx, ConnectionState::Ready).await;
    }

    #[tokio::test]
    async fn test_disconnection_and_recovery() {
        let mut h = spawn_kernel();
        h.controller.connect();
        wait_state(&mut h.state_rx, ConnectionState::Ready).await;

        h.controller.drop_link("broker went away");
        wait_state(
            &mut h.state_rx,
            ConnectionState::Disconnected("broker went away".into()),
        )
        .await;

        h.controller.connect();
        wait_state(&mut h.state_rx, ConnectionState::Ready).await;
    }

    #[tokio::test]
    async fn test_cancel_before_ready_skips_disconnect() {
        let mut h = spawn_kernel();
        h.cancel.cancel();
        h.task.await.unwrap();

        assert_eq!(*h.state_rx.borrow_and_update(), ConnectionState::Stopped);
        assert_eq!(h.controller.disconnect_count(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_cancel_when_ready_disconnects_and_waits_for_close() {
        let mut h = spawn_kernel();
        h.controller.connect();
        wait_state(&mut h.state_rx, ConnectionState::Ready).await;

        h.cancel.cancel();
        h.task.await.unwrap();

        assert_eq!(h.controller.disconnect_count(), 1);
        assert_eq!(*h.state_rx.borrow(), ConnectionState::Stopped);
        assert!(logs_contain("Link closed"));
        assert!(logs_contain("Connection state changed"));
    }
}
