//! Periodic telemetry publishing.
//!
//! The `TelemetryLoop` waits for the connection to become ready, then samples
//! a reading every `interval_ms` and hands it to a [`Publisher`]. The first
//! tick fires one full interval after readiness. Publish failures are logged
//! and never end the loop; only [`TelemetryHandle::cancel`] does.

use std::{
    error::Error,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use tempsim_mqtt::{qos_from_level, ConnectionHandle, ConnectionState, QoS, TransferError};
use tokio::{
    sync::watch,
    time::{interval_at, sleep, Duration, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::reading::{Reading, TemperatureSampler};
use crate::config::telemetry::{TelemetryConfig, TickMode};

const READINESS_WARN_INTERVAL: Duration = Duration::from_secs(30);

/// Destination for readings.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        reading: &Reading,
        qos: QoS,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

#[async_trait]
impl Publisher for ConnectionHandle {
    async fn publish(
        &self,
        topic: &str,
        reading: &Reading,
        qos: QoS,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let payload = serde_json::to_vec(reading)
            .map_err(|e| TransferError::Serialization(e.to_string()))?;
        ConnectionHandle::publish(self, topic, payload, qos).await?;
        Ok(())
    }
}

pub struct TelemetryLoop {
    publisher: Arc<dyn Publisher>,
    device_id: String,
    topic: Arc<str>,
    qos: QoS,
    interval: Duration,
    mode: TickMode,
    sampler: TemperatureSampler,
}

impl TelemetryLoop {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        device_id: impl Into<String>,
        config: &TelemetryConfig,
    ) -> Result<Self, TransferError> {
        Ok(Self {
            publisher,
            device_id: device_id.into(),
            topic: Arc::from(config.topic.as_str()),
            qos: qos_from_level(config.qos)?,
            interval: Duration::from_millis(config.interval_ms),
            mode: config.tick_mode,
            sampler: TemperatureSampler::from_config(config),
        })
    }

    /// Spawns the driver task. It starts ticking once `state` reports
    /// `Ready` and exits early if the connection stops first.
    pub fn start(self, state: watch::Receiver<ConnectionState>) -> TelemetryHandle {
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();

        let driver_cancel = cancel.clone();
        let driver_done = done.clone();
        tokio::spawn(async move {
            let _done = driver_done.drop_guard();
            self.run(state, driver_cancel).await;
        }
        .in_current_span());

        TelemetryHandle { cancel, done }
    }

    async fn run(self, mut state: watch::Receiver<ConnectionState>, cancel: CancellationToken) {
        if !wait_until_ready(&mut state, &cancel).await {
            debug!("Telemetry loop ended before the connection became ready");
            return;
        }

        info!(
            interval_ms = self.interval.as_millis() as u64,
            topic = %self.topic,
            qos = ?self.qos,
            mode = ?self.mode,
            "Telemetry started"
        );

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let in_flight = Arc::new(AtomicBool::new(false));

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick(&in_flight),
            }
        }

        info!("Telemetry stopped");
    }

    fn tick(&self, in_flight: &Arc<AtomicBool>) {
        if self.mode == TickMode::Serialized && in_flight.swap(true, Ordering::AcqRel) {
            debug!("Previous publish still in flight, skipping tick");
            return;
        }

        let reading = self.sampler.sample(&self.device_id);
        let publisher = self.publisher.clone();
        let topic = self.topic.clone();
        let qos = self.qos;
        let in_flight = (self.mode == TickMode::Serialized).then(|| in_flight.clone());

        tokio::spawn(async move {
            match publisher.publish(&topic, &reading, qos).await {
                Ok(()) => debug!(
                    topic = %topic,
                    temperature = reading.temperature,
                    "Reading published"
                ),
                Err(e) => error!(
                    topic = %topic,
                    payload = %reading.to_json().unwrap_or_default(),
                    error = %e,
                    "Failed to publish reading"
                ),
            }
            if let Some(flag) = in_flight {
                flag.store(false, Ordering::Release);
            }
        }
        .in_current_span());
    }
}

/// Returns false if cancelled or the connection stopped before `Ready`.
async fn wait_until_ready(
    state: &mut watch::Receiver<ConnectionState>,
    cancel: &CancellationToken,
) -> bool {
    loop {
        let current = state.borrow_and_update().clone();
        if current.is_ready() {
            return true;
        }
        if current.is_stopped() {
            return false;
        }

        tokio::select! {
            _ = cancel.cancelled() => return false,
            changed = state.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            _ = sleep(READINESS_WARN_INTERVAL) => {
                warn!(state = %current, "Still waiting for the connection to become ready");
            }
        }
    }
}

/// Controls a running telemetry loop. Clones control the same loop.
#[derive(Debug, Clone)]
pub struct TelemetryHandle {
    cancel: CancellationToken,
    done: CancellationToken,
}

impl TelemetryHandle {
    /// Stops scheduling ticks. Publishes already started run to completion.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Waits for the driver task to exit.
    pub async fn join(&self) {
        self.done.cancelled().await;
    }
}
