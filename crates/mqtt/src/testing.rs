//! In-memory transport for tests.
//!
//! `stub_transport()` returns a [`Link`] and [`EventSource`] pair plus a
//! [`StubController`]. The controller emits lifecycle events as if a broker
//! were on the other side and records every publish the link receives.
//!
//! By default a disconnect request is answered with `LinkEvent::Closed`, so a
//! graceful stop completes. `hold_disconnect()` suppresses that to simulate a
//! broker that never finishes closing.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use tokio::sync::mpsc;

use super::{
    error::TransferError,
    transport::{EventSource, Link, LinkEvent},
};

/// A publish as seen by the stub link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPublish {
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
}

impl RecordedPublish {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

struct Recorder {
    publishes: Mutex<Vec<RecordedPublish>>,
    publish_attempts: AtomicUsize,
    disconnects: AtomicUsize,
    fail_publishes: AtomicBool,
    close_on_disconnect: AtomicBool,
    publish_delay: Mutex<Option<Duration>>,
}

impl Recorder {
    fn new() -> Self {
        Self {
            publishes: Mutex::new(Vec::new()),
            publish_attempts: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            fail_publishes: AtomicBool::new(false),
            close_on_disconnect: AtomicBool::new(true),
            publish_delay: Mutex::new(None),
        }
    }
}

pub fn stub_transport() -> (StubLink, StubEvents, StubController) {
    let recorder = Arc::new(Recorder::new());
    let (tx, rx) = mpsc::unbounded_channel();
    (
        StubLink {
            recorder: recorder.clone(),
            tx: tx.clone(),
        },
        StubEvents { rx },
        StubController { recorder, tx },
    )
}

pub struct StubLink {
    recorder: Arc<Recorder>,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

#[async_trait]
impl Link for StubLink {
    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), TransferError> {
        self.recorder.publish_attempts.fetch_add(1, Ordering::AcqRel);

        let delay = *self
            .recorder
            .publish_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.recorder.fail_publishes.load(Ordering::Acquire) {
            return Err(TransferError::Transport("stub publish failure".into()));
        }

        self.recorder
            .publishes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedPublish {
                topic: topic.to_string(),
                qos,
                payload,
            });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransferError> {
        self.recorder.disconnects.fetch_add(1, Ordering::AcqRel);
        if self.recorder.close_on_disconnect.load(Ordering::Acquire) {
            let _ = self.tx.send(LinkEvent::Closed);
        }
        Ok(())
    }
}

pub struct StubEvents {
    rx: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
impl EventSource for StubEvents {
    async fn next_event(&mut self) -> Option<LinkEvent> {
        self.rx.recv().await
    }
}

/// Test-side handle onto the stub transport.
#[derive(Clone)]
pub struct StubController {
    recorder: Arc<Recorder>,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl StubController {
    pub fn emit(&self, event: LinkEvent) {
        let _ = self.tx.send(event);
    }

    /// Emits a connection attempt followed by a successful handshake.
    pub fn connect(&self) {
        self.emit(LinkEvent::AttemptingConnect);
        self.emit(LinkEvent::ConnectionSuccess {
            session_present: false,
        });
    }

    pub fn drop_link(&self, reason: &str) {
        self.emit(LinkEvent::Disconnection(reason.to_string()));
    }

    /// Publishes that reached the link and succeeded.
    pub fn publishes(&self) -> Vec<RecordedPublish> {
        self.recorder
            .publishes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn publish_count(&self) -> usize {
        self.recorder
            .publishes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Every call into `Link::publish`, failed or not.
    pub fn publish_attempts(&self) -> usize {
        self.recorder.publish_attempts.load(Ordering::Acquire)
    }

    pub fn disconnect_count(&self) -> usize {
        self.recorder.disconnects.load(Ordering::Acquire)
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.recorder.fail_publishes.store(fail, Ordering::Release);
    }

    pub fn hold_disconnect(&self) {
        self.recorder
            .close_on_disconnect
            .store(false, Ordering::Release);
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        *self
            .recorder
            .publish_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }
}
