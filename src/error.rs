//! Error taxonomy for the communication runtime.
//!
//! Validation errors are synchronous and raised at construction or
//! publication time. Transport and protocol errors are raised out of band
//! on the diagnostic channels described in the Binding contract; most of
//! those are logged and do not propagate as `Result`s because the caller of
//! a one-way publish or an `observe*` call has already moved on.

use uuid::Uuid;

/// Errors surfaced synchronously to application code.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    /// A domain object or event violated one of its structural invariants.
    #[error("validation failed for {what}: {reason}")]
    Validation { what: &'static str, reason: String },

    /// A topic level or whole topic string did not meet the wire-format
    /// rules in the topic codec.
    #[error("invalid topic level {level:?}")]
    InvalidTopicLevel { level: String },

    /// A publication or subscription topic failed to decode.
    #[error("malformed topic {topic:?}: {reason}")]
    MalformedTopic { topic: String, reason: String },

    /// Subscribing to a response stream whose last observer has already
    /// detached. See `spec.md` §4.4, "late resubscribe -> error".
    #[error("cannot resubscribe to response stream for correlation id {correlation_id}: already closed")]
    LateResubscribe { correlation_id: Uuid },

    /// A response event's kind does not match its request's kind, or its
    /// payload violates the request's constraints (§4.1 response
    /// consistency rule).
    #[error("response parameter mismatch for correlation id {correlation_id}: {reason}")]
    ResponseMismatch { correlation_id: Uuid, reason: String },

    /// No observer is registered for an inbound response's correlation id.
    /// Logged and dropped, never propagated to application code; kept here
    /// so internal dispatch can still use `Result` uniformly.
    #[error("no observer registered for correlation id {correlation_id}")]
    UnknownCorrelation { correlation_id: Uuid },

    /// The Binding reported a transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// `start`/`stop`/`join`/`unjoin` called in a state that forbids it.
    #[error("illegal state transition: {0}")]
    IllegalState(String),

    /// `publishRaw` was given a topic that is not a valid publication
    /// topic, or `publishIoValue` was given a source with no active route.
    #[error("cannot publish: {0}")]
    PublishRejected(String),
}

pub type CommResult<T> = Result<T, CommError>;
