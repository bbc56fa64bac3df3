//! # Request Services
//!
//! ## Responsibility
//! One service per operation class: text generation, embeddings, audio
//! transcription. Each applies the format engine where relevant, invokes the
//! model adapter, writes its own audit entry, and computes wall-clock timing.
//!
//! ## Guarantees
//! - Services never return errors across the dispatch boundary: every call
//!   yields a response value, with failures carried in its `error` field
//! - Panics inside the inference path are caught, audited with status
//!   `panic`, and converted into error responses; the worker survives
//!
//! ## NOT Responsible For
//! - Acknowledgement and redelivery (see: `queue`)
//! - Transport-level serialization (queue/http layers own that)

pub mod audio;
pub mod embedding;
pub mod inference;

pub use audio::{AudioRequest, AudioResponse, AudioService};
pub use embedding::{EmbeddingRequest, EmbeddingResponse, EmbeddingService};
pub use inference::{InferenceRequest, InferenceResponse, InferenceService};
