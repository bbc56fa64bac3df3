//! # Queue Runtime & Worker Pool
//!
//! ## Responsibility
//! Guarantee that every accepted request is delivered to exactly one handler
//! invocation and acknowledged at most once per successful handler return,
//! with bounded redelivery on failure. Owns the durable stream, the pull
//! consumer, and the fixed pool of worker tasks that drive fetch/dispatch.
//!
//! ## Guarantees
//! - At-least-once: parse and serialization failures are NAKed and redeliver
//!   up to the consumer's delivery cap; handler failures are responses, not
//!   redeliveries
//! - At-most-one reply publish per message, best-effort
//! - Counters: `pending` brackets dispatch, `active` brackets handler
//!   execution, and both return to zero in steady state
//! - Cancellation has handler granularity: workers check shutdown between
//!   fetches and never interrupt an in-flight model call
//!
//! ## NOT Responsible For
//! - Request semantics (see: `services`)
//! - Load classification (see: `monitoring`)

use crate::config::Config;
use crate::monitoring::QueueCounters;
use crate::services::{
    AudioRequest, AudioService, EmbeddingRequest, EmbeddingService, InferenceRequest,
    InferenceService,
};
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    stream::{RetentionPolicy, StorageType},
    AckKind,
};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Bounded wait for a single pull-fetch round trip.
const FETCH_WAIT: Duration = Duration::from_secs(1);
/// Back-off after a fetch error.
const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Queue runtime errors. Any of these reaching `main` is process-fatal.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("failed to connect to NATS at {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("failed to ensure stream: {0}")]
    Stream(String),

    #[error("failed to create consumer: {0}")]
    Consumer(String),
}

/// Which handler a message's subject routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Inference,
    Embedding,
    Audio,
}

/// Select a handler by subject substring.
///
/// `embedding.request` wins first, then `audio.request`/`transcribe.request`;
/// everything else is text generation.
pub fn route_for_subject(subject: &str) -> HandlerKind {
    if subject.contains("embedding.request") {
        HandlerKind::Embedding
    } else if subject.contains("audio.request") || subject.contains("transcribe.request") {
        HandlerKind::Audio
    } else {
        HandlerKind::Inference
    }
}

/// Unique worker-task id: `worker-<monotonic-nanos>-<random-hex>`.
pub fn generate_worker_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let suffix: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(8)
        .collect();
    format!("worker-{nanos}-{suffix}")
}

/// The durable work-queue consumer plus its worker pool.
pub struct QueueRuntime {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: Arc<Config>,
    counters: Arc<QueueCounters>,
    inference: Arc<InferenceService>,
    embedding: Arc<EmbeddingService>,
    audio: Arc<AudioService>,
}

impl QueueRuntime {
    /// Connect to the bus and assemble the runtime. Connection failure here
    /// is a fatal startup condition.
    pub async fn connect(
        config: Arc<Config>,
        counters: Arc<QueueCounters>,
        inference: Arc<InferenceService>,
        embedding: Arc<EmbeddingService>,
        audio: Arc<AudioService>,
    ) -> Result<Self, QueueError> {
        let client = async_nats::connect(config.nats_url.as_str())
            .await
            .map_err(|e| QueueError::Connect {
                url: config.nats_url.clone(),
                reason: e.to_string(),
            })?;
        let jetstream = jetstream::new(client.clone());

        info!(url = %config.nats_url, "connected to NATS");

        Ok(Self {
            client,
            jetstream,
            config,
            counters,
            inference,
            embedding,
            audio,
        })
    }

    /// The underlying core-NATS client, shared with health and monitoring.
    pub fn client(&self) -> async_nats::Client {
        self.client.clone()
    }

    /// Ensure the durable stream exists and lists our request subject.
    ///
    /// Retention is work-queue (an acknowledgement removes the message) over
    /// file storage. An existing stream is only ever updated additively:
    /// subjects are appended, never removed, and the stream is never
    /// recreated.
    pub async fn ensure_stream(&self) -> Result<(), QueueError> {
        let wanted = jetstream::stream::Config {
            name: self.config.stream.clone(),
            subjects: vec![self.config.subject.clone()],
            max_messages: self.config.max_msgs,
            max_age: self.config.max_age,
            storage: StorageType::File,
            retention: RetentionPolicy::WorkQueue,
            ..Default::default()
        };

        let mut stream = self
            .jetstream
            .get_or_create_stream(wanted)
            .await
            .map_err(|e| QueueError::Stream(e.to_string()))?;

        let info = stream
            .info()
            .await
            .map_err(|e| QueueError::Stream(e.to_string()))?;

        if !info.config.subjects.iter().any(|s| *s == self.config.subject) {
            let mut updated = info.config.clone();
            updated.subjects.push(self.config.subject.clone());
            self.jetstream
                .update_stream(&updated)
                .await
                .map_err(|e| QueueError::Stream(e.to_string()))?;
            info!(
                stream = %self.config.stream,
                subject = %self.config.subject,
                "added subject to existing stream"
            );
        } else {
            info!(
                stream = %self.config.stream,
                messages = info.state.messages,
                "stream ready"
            );
        }

        Ok(())
    }

    async fn create_consumer(&self) -> Result<PullConsumer, QueueError> {
        let stream = self
            .jetstream
            .get_stream(&self.config.stream)
            .await
            .map_err(|e| QueueError::Stream(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                &self.config.durable,
                pull::Config {
                    durable_name: Some(self.config.durable.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.config.ack_wait,
                    max_deliver: self.config.max_deliver,
                    max_ack_pending: self.config.max_ack_pending,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::Consumer(e.to_string()))?;

        info!(durable = %self.config.durable, "created pull consumer");
        Ok(consumer)
    }

    /// Ensure the stream and consumer, then run the worker pool until
    /// shutdown. Returns only once every worker task has exited.
    pub async fn run(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), QueueError> {
        self.ensure_stream().await?;
        let consumer = self.create_consumer().await?;

        info!(
            stream = %self.config.stream,
            subject = %self.config.subject,
            consumer = %self.config.durable,
            concurrency = self.config.concurrency,
            "queue runtime starting"
        );

        let mut handles = Vec::with_capacity(self.config.concurrency);
        for _ in 0..self.config.concurrency {
            let worker_id = generate_worker_id();
            let runtime = Arc::clone(&self);
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                runtime.worker_loop(consumer, worker_id, shutdown).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        info!("queue runtime stopped");
        Ok(())
    }

    /// One worker task: fetch one message with a bounded wait, dispatch it,
    /// repeat. Shutdown is honoured between fetches only.
    async fn worker_loop(
        &self,
        consumer: PullConsumer,
        worker_id: String,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(worker_id = %worker_id, "worker starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let fetch = consumer
                .fetch()
                .max_messages(1)
                .expires(FETCH_WAIT)
                .messages();

            let batch = tokio::select! {
                _ = shutdown.changed() => continue,
                batch = fetch => batch,
            };

            let mut messages = match batch {
                Ok(messages) => messages,
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "failed to fetch messages");
                    tokio::time::sleep(FETCH_ERROR_BACKOFF).await;
                    continue;
                }
            };

            // An empty batch is an ordinary fetch timeout.
            while let Some(message) = messages.next().await {
                match message {
                    Ok(message) => {
                        self.counters.increment_pending();
                        self.dispatch(message, &worker_id).await;
                        self.counters.decrement_pending();
                    }
                    Err(e) => {
                        error!(worker_id = %worker_id, error = %e, "message delivery error");
                        tokio::time::sleep(FETCH_ERROR_BACKOFF).await;
                    }
                }
            }
        }

        info!(worker_id = %worker_id, "worker shutting down");
    }

    async fn dispatch(&self, message: jetstream::Message, worker_id: &str) {
        match route_for_subject(message.subject.as_str()) {
            HandlerKind::Embedding => self.handle_embedding(message, worker_id).await,
            HandlerKind::Audio => self.handle_audio(message, worker_id).await,
            HandlerKind::Inference => self.handle_inference(message, worker_id).await,
        }
    }

    async fn handle_inference(&self, message: jetstream::Message, worker_id: &str) {
        let mut req: InferenceRequest = match serde_json::from_slice(&message.payload) {
            Ok(req) => req,
            Err(e) => {
                error!(
                    worker_id = worker_id,
                    error = %e,
                    payload = %String::from_utf8_lossy(&message.payload),
                    "failed to parse inference request"
                );
                self.nak(&message, worker_id).await;
                return;
            }
        };
        if req.trace_id.is_empty() {
            req.trace_id = req.req_id.clone();
        }

        debug!(
            worker_id = worker_id,
            req_id = %req.req_id,
            trace_id = %req.trace_id,
            subject = %message.subject,
            "processing inference request"
        );

        let req_id = req.req_id.clone();
        let reply_to = req.reply_to.clone();
        let source = format!("nats.{}", message.subject);

        self.counters.increment_active();
        let response = self.inference.process(req, &source, worker_id).await;
        self.counters.decrement_active();

        let had_error = response.error.is_some();
        self.finish(message, &reply_to, &response, worker_id, &req_id)
            .await;

        if had_error {
            error!(
                worker_id = worker_id,
                req_id = %req_id,
                duration_ms = response.duration_ms,
                error = response.error.as_deref().unwrap_or_default(),
                "inference failed"
            );
        } else {
            info!(
                worker_id = worker_id,
                req_id = %req_id,
                duration_ms = response.duration_ms,
                tokens_in = response.tokens_in,
                tokens_out = response.tokens_out,
                "inference completed"
            );
        }
    }

    async fn handle_embedding(&self, message: jetstream::Message, worker_id: &str) {
        let mut req: EmbeddingRequest = match serde_json::from_slice(&message.payload) {
            Ok(req) => req,
            Err(e) => {
                error!(
                    worker_id = worker_id,
                    error = %e,
                    payload = %String::from_utf8_lossy(&message.payload),
                    "failed to parse embedding request"
                );
                self.nak(&message, worker_id).await;
                return;
            }
        };
        if req.trace_id.is_empty() {
            req.trace_id = req.req_id.clone();
        }

        let req_id = req.req_id.clone();
        let reply_to = req.reply_to.clone();
        let source = format!("nats.{}", message.subject);

        self.counters.increment_active();
        let response = self.embedding.process(req, &source, worker_id).await;
        self.counters.decrement_active();

        let had_error = response.error.is_some();
        let count = response.data.len();
        self.finish(message, &reply_to, &response, worker_id, &req_id)
            .await;

        if had_error {
            error!(worker_id = worker_id, req_id = %req_id, "embedding failed");
        } else {
            info!(
                worker_id = worker_id,
                req_id = %req_id,
                embedding_count = count,
                "embedding completed"
            );
        }
    }

    async fn handle_audio(&self, message: jetstream::Message, worker_id: &str) {
        let mut req: AudioRequest = match serde_json::from_slice(&message.payload) {
            Ok(req) => req,
            Err(e) => {
                error!(
                    worker_id = worker_id,
                    error = %e,
                    payload = %String::from_utf8_lossy(&message.payload),
                    "failed to parse audio request"
                );
                self.nak(&message, worker_id).await;
                return;
            }
        };
        if req.trace_id.is_empty() {
            req.trace_id = req.req_id.clone();
        }

        let req_id = req.req_id.clone();
        let reply_to = req.reply_to.clone();
        let source = format!("nats.{}", message.subject);

        self.counters.increment_active();
        let response = self.audio.process(req, &source, worker_id).await;
        self.counters.decrement_active();

        let had_error = response.error.is_some();
        let segments = response.segments.len();
        self.finish(message, &reply_to, &response, worker_id, &req_id)
            .await;

        if had_error {
            error!(worker_id = worker_id, req_id = %req_id, "transcription failed");
        } else {
            info!(
                worker_id = worker_id,
                req_id = %req_id,
                duration_ms = response.duration_ms,
                segments_count = segments,
                "transcription completed"
            );
        }
    }

    /// Serialize, optionally publish the reply, and acknowledge.
    ///
    /// The reply subject lives inside the request payload rather than the
    /// transport envelope so responses can be relayed through intermediaries.
    /// A publish failure does not change the acknowledgement of the inbound
    /// message; an acknowledgement failure only means the message may be
    /// redelivered, which downstream handlers tolerate.
    async fn finish<T: Serialize>(
        &self,
        message: jetstream::Message,
        reply_to: &str,
        response: &T,
        worker_id: &str,
        req_id: &str,
    ) {
        let payload = match serde_json::to_vec(response) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    worker_id = worker_id,
                    req_id = req_id,
                    error = %e,
                    "failed to serialize response"
                );
                self.nak(&message, worker_id).await;
                return;
            }
        };

        if !reply_to.is_empty() {
            if let Err(e) = self
                .client
                .publish(reply_to.to_string(), payload.into())
                .await
            {
                error!(
                    worker_id = worker_id,
                    req_id = req_id,
                    reply_subject = reply_to,
                    error = %e,
                    "failed to publish response"
                );
            }
        }

        if let Err(e) = message.ack().await {
            error!(
                worker_id = worker_id,
                req_id = req_id,
                error = %e,
                "failed to acknowledge message"
            );
        }

        self.counters.record_processed();
    }

    async fn nak(&self, message: &jetstream::Message, worker_id: &str) {
        if let Err(e) = message.ack_with(AckKind::Nak(None)).await {
            error!(worker_id = worker_id, error = %e, "failed to NAK message");
        }
    }
}
