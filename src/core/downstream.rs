//! Consumer side of the telemetry pipeline.
//!
//! Readings published by the device end up either in a handler invoked per
//! message or in a queue drained by a poller. The external services involved
//! (queue, document store, notification topic) sit behind the traits below;
//! this module holds only the processing rules.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::downstream::{ConsumerConfig, HandlerConfig};

#[derive(Debug, Error)]
pub enum DownstreamError {
    #[error("Invalid reading payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Notification error: {0}")]
    Notify(String),
}

/// A message pulled from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub body: String,
    /// Token used to delete the message once handled.
    pub receipt_handle: String,
}

/// A reading as the consumer accepts it. The device publishes integers, but
/// any JSON number is taken.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundReading {
    pub temperature: f64,
    #[serde(rename = "deviceId")]
    pub device_id: String,
}

impl InboundReading {
    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Row written for every reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureRecord {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub temperature: f64,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn receive(&self, max_messages: usize) -> Result<Vec<QueueMessage>, DownstreamError>;
    async fn delete(&self, receipt_handle: &str) -> Result<(), DownstreamError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, table: &str, record: TemperatureRecord) -> Result<(), DownstreamError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, topic: &str, message: &str) -> Result<(), DownstreamError>;
}

#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, body: &[u8]) -> Result<(), DownstreamError>;
}

/// Stores every reading and raises an alert for hot ones.
pub struct ReadingHandler {
    store: Arc<dyn DocumentStore>,
    notifier: Arc<dyn Notifier>,
    config: HandlerConfig,
}

impl ReadingHandler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        notifier: Arc<dyn Notifier>,
        config: HandlerConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    /// Handles one published payload.
    ///
    /// An alert that fails to send is logged and does not stop the reading
    /// from being stored. A store failure is returned.
    pub async fn handle(&self, payload: &[u8]) -> Result<TemperatureRecord, DownstreamError> {
        let reading = InboundReading::from_json(payload)?;
        debug!(
            device_id = %reading.device_id,
            temperature = reading.temperature,
            "Reading received"
        );

        if reading.temperature > f64::from(self.config.alert_threshold) {
            let message = alert_message(reading.temperature, self.config.alert_threshold);
            match self.notifier.publish(&self.config.alert_topic, &message).await {
                Ok(()) => info!(topic = %self.config.alert_topic, %message, "Alert sent"),
                Err(e) => warn!(error = %e, %message, "Failed to send alert"),
            }
        }

        let record = TemperatureRecord {
            device_id: reading.device_id,
            timestamp: now_millis(),
            temperature: reading.temperature,
        };
        if let Err(e) = self.store.put(&self.config.table, record.clone()).await {
            error!(error = %e, table = %self.config.table, "Failed to store reading");
            return Err(e);
        }

        Ok(record)
    }
}

#[async_trait]
impl MessageProcessor for ReadingHandler {
    async fn process(&self, body: &[u8]) -> Result<(), DownstreamError> {
        self.handle(body).await.map(|_| ())
    }
}

fn alert_message(temperature: f64, threshold: i32) -> String {
    format!("temperature is higher than normal: {temperature} (threshold {threshold})")
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Drains a queue on a fixed interval.
pub struct QueuePoller {
    queue: Arc<dyn MessageQueue>,
    processor: Arc<dyn MessageProcessor>,
    config: ConsumerConfig,
}

impl QueuePoller {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        processor: Arc<dyn MessageProcessor>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            processor,
            config,
        }
    }

    /// Polls until `cancel` fires. The first poll happens immediately.
    ///
    /// Errors never end the loop. A message is deleted only after it was
    /// processed successfully; otherwise it stays for redelivery.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(Duration::from_millis(self.config.poll_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            max_messages = self.config.max_messages,
            "Queue poller started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }

        info!("Queue poller stopped");
    }

    /// Returns the number of messages deleted.
    pub async fn poll_once(&self) -> usize {
        let messages = match self.queue.receive(self.config.max_messages).await {
            Ok(messages) => messages,
            Err(e) => {
                error!(error = %e, "Failed to receive messages");
                return 0;
            }
        };
        if messages.is_empty() {
            debug!("No new messages");
            return 0;
        }

        let mut deleted = 0;
        for message in messages {
            debug!(body = %message.body, "Received message");
            if let Err(e) = self.processor.process(message.body.as_bytes()).await {
                error!(error = %e, body = %message.body, "Failed to process message");
                continue;
            }
            match self.queue.delete(&message.receipt_handle).await {
                Ok(()) => {
                    deleted += 1;
                    debug!(receipt_handle = %message.receipt_handle, "Message deleted");
                }
                Err(e) => error!(error = %e, "Failed to delete message"),
            }
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex,
        },
    };

    use tracing_test::traced_test;

    use super::*;
    use crate::core::reading::Reading;

    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<Vec<(String, TemperatureRecord)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl DocumentStore for MemoryStore {
        async fn put(&self, table: &str, record: TemperatureRecord) -> Result<(), DownstreamError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DownstreamError::Store("table unavailable".into()));
            }
            self.rows.lock().unwrap().push((table.to_string(), record));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryNotifier {
        sent: Mutex<Vec<(String, String)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Notifier for MemoryNotifier {
        async fn publish(&self, topic: &str, message: &str) -> Result<(), DownstreamError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DownstreamError::Notify("topic unavailable".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), message.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryQueue {
        pending: Mutex<VecDeque<QueueMessage>>,
        deleted: Mutex<Vec<String>>,
        receives: AtomicUsize,
        fail_receive: AtomicBool,
    }

    impl MemoryQueue {
        fn push(&self, body: &str, receipt: &str) {
            self.pending.lock().unwrap().push_back(QueueMessage {
                body: body.to_string(),
                receipt_handle: receipt.to_string(),
            });
        }
    }

    #[async_trait]
    impl MessageQueue for MemoryQueue {
        async fn receive(&self, max_messages: usize) -> Result<Vec<QueueMessage>, DownstreamError> {
            self.receives.fetch_add(1, Ordering::SeqCst);
            if self.fail_receive.load(Ordering::SeqCst) {
                return Err(DownstreamError::Queue("receive failed".into()));
            }
            let mut pending = self.pending.lock().unwrap();
            let n = max_messages.min(pending.len());
            Ok(pending.drain(..n).collect())
        }

        async fn delete(&self, receipt_handle: &str) -> Result<(), DownstreamError> {
            let mut pending = self.pending.lock().unwrap();
            pending.retain(|m| m.receipt_handle != receipt_handle);
            self.deleted.lock().unwrap().push(receipt_handle.to_string());
            Ok(())
        }
    }

    fn handler() -> (ReadingHandler, Arc<MemoryStore>, Arc<MemoryNotifier>) {
        let store = Arc::new(MemoryStore::default());
        let notifier = Arc::new(MemoryNotifier::default());
        let handler = ReadingHandler::new(store.clone(), notifier.clone(), HandlerConfig::default());
        (handler, store, notifier)
    }

    #[tokio::test]
    async fn test_published_reading_round_trips_to_store() {
        let (handler, store, notifier) = handler();
        let payload = Reading::new(21, "dev-1").to_json().unwrap();

        let record = handler.handle(payload.as_bytes()).await.unwrap();

        assert_eq!(record.device_id, "dev-1");
        assert_eq!(record.temperature, 21.0);
        assert!(record.timestamp > 0);
        let rows = store.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "TemperatureData");
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_is_exclusive() {
        let (handler, _, notifier) = handler();
        handler.handle(br#"{"temperature":27,"deviceId":"d"}"#).await.unwrap();
        assert!(notifier.sent.lock().unwrap().is_empty());

        handler.handle(br#"{"temperature":28,"deviceId":"d"}"#).await.unwrap();
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "temperature is higher than normal: 28 (threshold 27)");
    }

    #[tokio::test]
    async fn test_fractional_temperature_alerts_and_stores() {
        let (handler, store, notifier) = handler();

        let record = handler
            .handle(br#"{"temperature":27.5,"deviceId":"dev-1"}"#)
            .await
            .unwrap();

        assert_eq!(record.temperature, 27.5);
        assert_eq!(store.rows.lock().unwrap().len(), 1);
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "temperature is higher than normal: 27.5 (threshold 27)");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_alert_failure_still_stores() {
        let (handler, store, notifier) = handler();
        notifier.fail.store(true, Ordering::SeqCst);

        handler.handle(br#"{"temperature":40,"deviceId":"d"}"#).await.unwrap();

        assert_eq!(store.rows.lock().unwrap().len(), 1);
        assert!(logs_contain("Failed to send alert"));
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let (handler, store, _) = handler();
        store.fail.store(true, Ordering::SeqCst);

        assert!(matches!(
            handler.handle(br#"{"temperature":20,"deviceId":"d"}"#).await,
            Err(DownstreamError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let (handler, store, _) = handler();
        assert!(matches!(
            handler.handle(b"not json").await,
            Err(DownstreamError::Decode(_))
        ));
        assert!(store.rows.lock().unwrap().is_empty());
    }

    fn poller(queue: Arc<MemoryQueue>, store: Arc<MemoryStore>) -> QueuePoller {
        let handler = ReadingHandler::new(
            store,
            Arc::new(MemoryNotifier::default()),
            HandlerConfig::default(),
        );
        QueuePoller::new(queue, Arc::new(handler), ConsumerConfig::default())
    }

    #[tokio::test]
    async fn test_poll_once_processes_and_deletes() {
        let queue = Arc::new(MemoryQueue::default());
        let store = Arc::new(MemoryStore::default());
        queue.push(r#"{"temperature":22,"deviceId":"dev-1"}"#, "r-1");
        queue.push(r#"{"temperature":23,"deviceId":"dev-1"}"#, "r-2");
        let poller = poller(queue.clone(), store.clone());

        // one message per poll by default
        assert_eq!(poller.poll_once().await, 1);
        assert_eq!(*queue.deleted.lock().unwrap(), vec!["r-1".to_string()]);
        assert_eq!(poller.poll_once().await, 1);
        assert_eq!(poller.poll_once().await, 0);
        assert_eq!(store.rows.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_message_is_not_deleted() {
        let queue = Arc::new(MemoryQueue::default());
        let store = Arc::new(MemoryStore::default());
        queue.push("garbage", "r-1");
        let poller = poller(queue.clone(), store);

        assert_eq!(poller.poll_once().await, 0);
        assert!(queue.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_keeps_polling_after_errors() {
        let queue = Arc::new(MemoryQueue::default());
        queue.fail_receive.store(true, Ordering::SeqCst);
        let poller = Arc::new(poller(queue.clone(), Arc::new(MemoryStore::default())));
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let poller = poller.clone();
            let cancel = cancel.clone();
            async move { poller.run(cancel).await }
        });

        // polls at 0, 5000 and 10000
        tokio::time::sleep(Duration::from_millis(12_500)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(queue.receives.load(Ordering::SeqCst), 3);
    }
}
