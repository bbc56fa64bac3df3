//! # Inference Client
//!
//! ## Responsibility
//! A thin NATS client for dispatching work to the fabric: publish a typed
//! request to a model-named subject with a unique reply inbox in the
//! payload, then wait for the response on that inbox.
//!
//! ## Guarantees
//! - The reply inbox is subscribed *before* the request is published, so a
//!   fast worker cannot win the race
//! - Every call is bounded by the client timeout (default 30 s)
//!
//! ## NOT Responsible For
//! - Retries: at-least-once delivery is the queue's job; callers decide
//!   whether a timeout warrants a resend

use crate::health::HealthStatus;
use crate::services::{EmbeddingResponse, InferenceRequest, InferenceResponse};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Client-side errors.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to connect to NATS: {0}")]
    Connect(String),

    #[error("failed to subscribe to reply subject: {0}")]
    Subscribe(String),

    #[error("failed to publish request: {0}")]
    Publish(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to parse response: {0}")]
    Parse(String),
}

/// Build the per-request reply subject for a client.
pub fn reply_subject(prefix: &str, client_id: &str, req_id: &str) -> String {
    format!("{prefix}.{client_id}.{req_id}")
}

/// A NATS client for the inference fabric.
pub struct InferenceClient {
    client: async_nats::Client,
    client_id: String,
    timeout: Duration,
}

impl InferenceClient {
    /// Connect to the bus. An empty `client_id` gets a generated one.
    pub async fn connect(nats_url: &str, client_id: &str) -> Result<Self, ClientError> {
        let client = async_nats::connect(nats_url)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let client_id = if client_id.is_empty() {
            format!("client-{}", uuid::Uuid::new_v4().simple())
        } else {
            client_id.to_string()
        };
        Ok(Self {
            client,
            client_id,
            timeout: Duration::from_secs(30),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Text generation through the work queue.
    pub async fn infer(
        &self,
        model: &str,
        input: &str,
        params: serde_json::Map<String, serde_json::Value>,
    ) -> Result<InferenceResponse, ClientError> {
        self.infer_inner(model, input, params, false).await
    }

    /// Text generation with prompt formatting bypassed.
    pub async fn infer_raw(
        &self,
        model: &str,
        input: &str,
        params: serde_json::Map<String, serde_json::Value>,
    ) -> Result<InferenceResponse, ClientError> {
        self.infer_inner(model, input, params, true).await
    }

    async fn infer_inner(
        &self,
        model: &str,
        input: &str,
        params: serde_json::Map<String, serde_json::Value>,
        raw: bool,
    ) -> Result<InferenceResponse, ClientError> {
        let req_id = uuid::Uuid::new_v4().to_string();
        let reply_to = reply_subject("inference.response", &self.client_id, &req_id);
        let request = InferenceRequest {
            req_id,
            input: input.to_string(),
            params,
            raw,
            reply_to: reply_to.clone(),
            ..Default::default()
        };
        self.send_request(&format!("inference.request.{model}"), &reply_to, &request)
            .await
    }

    /// Embeddings through the work queue.
    pub async fn embed(
        &self,
        model: &str,
        input: serde_json::Value,
    ) -> Result<EmbeddingResponse, ClientError> {
        let req_id = uuid::Uuid::new_v4().to_string();
        let reply_to = reply_subject("embedding.response", &self.client_id, &req_id);
        let request = serde_json::json!({
            "req_id": req_id,
            "input": input,
            "model": model,
            "reply_to": reply_to,
        });
        self.send_request(&format!("embedding.request.{model}"), &reply_to, &request)
            .await
    }

    /// On-demand health of one worker (request/reply, bypasses the queue).
    pub async fn check_health(&self, model: &str) -> Result<HealthStatus, ClientError> {
        let subject = crate::health::health_topic(model);
        let response = tokio::time::timeout(
            self.timeout,
            self.client.request(subject, "{}".into()),
        )
        .await
        .map_err(|_| ClientError::Timeout(self.timeout))?
        .map_err(|e| ClientError::Publish(e.to_string()))?;

        serde_json::from_slice(&response.payload).map_err(|e| ClientError::Parse(e.to_string()))
    }

    /// Optional fleet discovery. Workers are not required to answer; callers
    /// should treat a timeout as "no discovery responder on this bus".
    pub async fn list_models(&self) -> Result<Vec<String>, ClientError> {
        let req_id = uuid::Uuid::new_v4().to_string();
        let reply_to = reply_subject("discovery.response", &self.client_id, &req_id);
        let request = serde_json::json!({"req_id": req_id, "reply_to": reply_to});

        let response: serde_json::Value =
            self.send_request("models.discovery", &reply_to, &request).await?;
        let models = response
            .get("models")
            .and_then(|m| m.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    /// Subscribe to the reply inbox, publish the request, await one reply.
    async fn send_request<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        subject: &str,
        reply_to: &str,
        request: &Req,
    ) -> Result<Resp, ClientError> {
        let payload =
            serde_json::to_vec(request).map_err(|e| ClientError::Publish(e.to_string()))?;

        let mut subscriber = self
            .client
            .subscribe(reply_to.to_string())
            .await
            .map_err(|e| ClientError::Subscribe(e.to_string()))?;

        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| ClientError::Publish(e.to_string()))?;

        debug!(subject = subject, reply_subject = reply_to, "published request, awaiting reply");

        let message = tokio::time::timeout(self.timeout, subscriber.next())
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
            .ok_or_else(|| ClientError::Subscribe("reply subscription closed".to_string()))?;

        let _ = subscriber.unsubscribe().await;
        serde_json::from_slice(&message.payload).map_err(|e| ClientError::Parse(e.to_string()))
    }
}
