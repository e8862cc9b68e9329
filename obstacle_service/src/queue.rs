//! Kafka surface: consume analysis requests, publish results.
//!
//! One message is handled at a time and its offset is committed only once a
//! result (or a dead letter) has been written, so a crash mid-analysis means
//! the request is analyzed again after restart.

use crate::{config::QueueConfig, orchestrator::BatchAnalysis, telemetry::Metrics};
use async_trait::async_trait;
use obstacle_schema::{RequestEvent, ResultEvent};
use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaError,
    message::{Header, OwnedHeaders, OwnedMessage},
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
    ClientConfig, Message, Offset, TopicPartitionList,
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::broadcast, time::sleep};
use tracing::instrument;

pub const TYPE_ID_HEADER: &str = "__TypeId__";
pub const CORRELATION_ID_HEADER: &str = "correlationId";
pub const ERROR_HEADER: &str = "x-error";
pub const ORIGINAL_TOPIC_HEADER: &str = "x-original-topic";

const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const REDELIVERY_DELAY: Duration = Duration::from_secs(5);
const MAX_PUBLISH_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Failed to serialize result event: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

#[async_trait]
pub trait MessagePublisher: Send + Sync + 'static {
    async fn publish(&self, message: &OutgoingMessage) -> Result<(), QueueError>;
}

pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn new(config: &QueueConfig) -> Result<Self, QueueError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("message.timeout.ms", SEND_TIMEOUT.as_millis().to_string())
            .create()?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl MessagePublisher for KafkaPublisher {
    async fn publish(&self, message: &OutgoingMessage) -> Result<(), QueueError> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let mut record = FutureRecord::to(&message.topic)
            .payload(&message.payload)
            .headers(headers);
        if let Some(key) = &message.key {
            record = record.key(key.as_str());
        }

        self.producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map(|_| ())
            .map_err(|(e, _)| QueueError::Publish {
                topic: message.topic.clone(),
                reason: e.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandlingOutcome {
    Published { correlation_id: String },
    DeadLettered { reason: String },
}

impl HandlingOutcome {
    fn as_metric(&self) -> &'static str {
        match self {
            HandlingOutcome::Published { .. } => "published",
            HandlingOutcome::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// Transport-independent handling of one request payload.
pub struct RequestHandler<P: MessagePublisher> {
    analyzer: Arc<dyn BatchAnalysis>,
    publisher: P,
    config: QueueConfig,
}

impl<P: MessagePublisher> RequestHandler<P> {
    pub fn new(analyzer: Arc<dyn BatchAnalysis>, publisher: P, config: &QueueConfig) -> Self {
        Self {
            analyzer,
            publisher,
            config: config.clone(),
        }
    }

    /// Analyzes one request and writes its result or a dead letter.
    ///
    /// An error means nothing could be written and the message must be
    /// delivered again.
    #[instrument(skip(self, payload))]
    pub async fn handle(&self, payload: &[u8]) -> Result<HandlingOutcome, QueueError> {
        let request: RequestEvent = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                return self
                    .dead_letter(payload, None, format!("malformed request event: {}", e))
                    .await
            }
        };
        tracing::info!("Received analysis request: eventId={}", request.event_id);

        let batch = match request.batch() {
            Ok(batch) => batch,
            Err(e) => {
                return self
                    .dead_letter(payload, Some(request.event_id.as_str()), e.to_string())
                    .await
            }
        };

        let images = batch.as_slice().len();
        if images > self.config.max_batch_size {
            let reason = format!(
                "batch of {} images exceeds the limit of {}",
                images, self.config.max_batch_size
            );
            return self
                .dead_letter(payload, Some(request.event_id.as_str()), reason)
                .await;
        }

        let classification = self.analyzer.analyze_batch(&batch).await;
        let result = ResultEvent::for_request(&request, classification, &self.config.source_service);
        let message = self.result_message(&result)?;

        match self.publish_with_retry(&message).await {
            Ok(()) => {
                tracing::info!(
                    "Sent analysis result: eventId={} correlationId={}",
                    result.event_id,
                    result.correlation_id
                );
                Ok(HandlingOutcome::Published {
                    correlation_id: result.correlation_id,
                })
            }
            Err(e) => {
                self.dead_letter(payload, Some(request.event_id.as_str()), e.to_string())
                    .await
            }
        }
    }

    fn result_message(&self, result: &ResultEvent) -> Result<OutgoingMessage, QueueError> {
        Ok(OutgoingMessage {
            topic: self.config.result_topic.clone(),
            key: Some(result.correlation_id.clone()),
            payload: serde_json::to_vec(result)?,
            headers: vec![
                (TYPE_ID_HEADER.to_string(), self.config.result_type_id.clone()),
                (CORRELATION_ID_HEADER.to_string(), result.correlation_id.clone()),
            ],
        })
    }

    async fn publish_with_retry(&self, message: &OutgoingMessage) -> Result<(), QueueError> {
        let max_attempts = self.config.publish_max_attempts.max(1);
        let mut retry_delay = Duration::from_millis(self.config.publish_initial_backoff_ms);
        let mut attempt = 1;

        loop {
            match self.publisher.publish(message).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= max_attempts => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        "Publish attempt {}/{} to {} failed: {}",
                        attempt,
                        max_attempts,
                        message.topic,
                        e
                    );
                    let jitter = rand::random::<f32>() * 0.2 + 0.9;
                    sleep(retry_delay.mul_f32(jitter)).await;
                    retry_delay = next_backoff(retry_delay);
                    attempt += 1;
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        payload: &[u8],
        event_id: Option<&str>,
        reason: String,
    ) -> Result<HandlingOutcome, QueueError> {
        tracing::warn!("Dead-lettering request eventId={:?}: {}", event_id, reason);

        let message = OutgoingMessage {
            topic: self.config.dead_letter_topic.clone(),
            key: event_id.map(str::to_string),
            payload: payload.to_vec(),
            headers: vec![
                (ERROR_HEADER.to_string(), reason.clone()),
                (
                    ORIGINAL_TOPIC_HEADER.to_string(),
                    self.config.request_topic.clone(),
                ),
            ],
        };
        self.publish_with_retry(&message).await?;

        Ok(HandlingOutcome::DeadLettered { reason })
    }
}

fn next_backoff(delay: Duration) -> Duration {
    delay.saturating_mul(2).min(MAX_PUBLISH_BACKOFF)
}

/// Where a consumed message's position is recorded.
pub trait OffsetStore: Send + Sync + 'static {
    /// Records `next_offset` as the position to resume from.
    fn commit_offset(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), KafkaError>;

    /// Moves the fetch position back so `offset` is delivered again.
    fn rewind_to(&self, topic: &str, partition: i32, offset: i64) -> Result<(), KafkaError>;
}

impl OffsetStore for StreamConsumer {
    fn commit_offset(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), KafkaError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(topic, partition, Offset::Offset(next_offset))?;
        self.commit(&offsets, CommitMode::Async)
    }

    fn rewind_to(&self, topic: &str, partition: i32, offset: i64) -> Result<(), KafkaError> {
        self.seek(topic, partition, Offset::Offset(offset), Timeout::After(SEND_TIMEOUT))
    }
}

pub struct QueueBridge<P: MessagePublisher, C: OffsetStore = StreamConsumer> {
    consumer: C,
    handler: RequestHandler<P>,
    metrics: Arc<Metrics>,
    redelivery_delay: Duration,
}

impl QueueBridge<KafkaPublisher> {
    pub fn new(
        config: &QueueConfig,
        analyzer: Arc<dyn BatchAnalysis>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, QueueError> {
        // librdkafka heartbeats from its own thread, but nothing polls while a
        // message is handled: max.poll.interval.ms must cover the slowest
        // accepted batch, which configuration validation enforces.
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", config.heartbeat_interval_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string())
            .create()?;
        consumer.subscribe(&[config.request_topic.as_str()])?;

        let publisher = KafkaPublisher::new(config)?;

        Ok(Self {
            consumer,
            handler: RequestHandler::new(analyzer, publisher, config),
            metrics,
            redelivery_delay: REDELIVERY_DELAY,
        })
    }
}

impl<P: MessagePublisher> QueueBridge<P> {
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        tracing::info!("Queue consumer started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Queue consumer received shutdown signal");
                    break;
                }
                received = self.consumer.recv() => {
                    match received {
                        Ok(message) => self.process(&message.detach()).await,
                        Err(e) => {
                            tracing::error!("Failed to receive message: {}", e);
                            sleep(self.redelivery_delay).await;
                        }
                    }
                }
            }
        }

        tracing::info!("Queue consumer stopped");
    }
}

impl<P: MessagePublisher, C: OffsetStore> QueueBridge<P, C> {
    /// Commits past the message once something was written for it, otherwise
    /// rewinds so it is consumed again.
    async fn process(&self, message: &OwnedMessage) {
        let payload = message.payload().unwrap_or_default();

        match self.handler.handle(payload).await {
            Ok(outcome) => {
                match &outcome {
                    HandlingOutcome::Published { correlation_id } => {
                        self.metrics.record_analysis("queue");
                        tracing::debug!("Committing offset {} for {}", message.offset(), correlation_id);
                    }
                    HandlingOutcome::DeadLettered { reason } => {
                        tracing::debug!("Committing dead-lettered offset {}: {}", message.offset(), reason);
                    }
                }
                self.metrics.record_queue_message(outcome.as_metric());

                if let Err(e) =
                    self.consumer
                        .commit_offset(message.topic(), message.partition(), message.offset() + 1)
                {
                    tracing::error!("Failed to commit offset {}: {}", message.offset(), e);
                }
            }
            Err(e) => {
                self.metrics.record_queue_message("failed");
                tracing::error!(
                    "Handling failed for offset {} on {}[{}], redelivering: {}",
                    message.offset(),
                    message.topic(),
                    message.partition(),
                    e
                );
                sleep(self.redelivery_delay).await;
                if let Err(e) =
                    self.consumer
                        .rewind_to(message.topic(), message.partition(), message.offset())
                {
                    tracing::error!("Failed to rewind to offset {}: {}", message.offset(), e);
                }
            }
        }
    }
}
