//! Wire envelopes.
//!
//! Protobuf messages wrapping correlation metadata around an opaque
//! business payload. Field numbers are fixed; instances of different builds
//! must agree on them. Absent optional fields use proto3 defaults: an empty
//! `target_id`, a zero `sent_at`, an empty `error`.

use std::time::Duration;

use bytes::Bytes;
use prost::Message;
use prost_types::Any;

/// A request as published on a request channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestEnvelope {
    /// Names the response channel the caller listens on.
    #[prost(string, tag = "1")]
    pub correlation_id: String,
    /// Node id of the calling instance.
    #[prost(string, tag = "2")]
    pub sender_id: String,
    /// Addressed entity; empty for un-targeted lookups.
    #[prost(string, tag = "3")]
    pub target_id: String,
    /// Unix time in nanoseconds at publish; zero when unknown.
    #[prost(int64, tag = "4")]
    pub sent_at: i64,
    #[prost(message, optional, tag = "5")]
    pub payload: Option<Any>,
}

/// The answer to one request, published on its response channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseEnvelope {
    /// Copied from the request.
    #[prost(string, tag = "1")]
    pub correlation_id: String,
    /// Handler error text; empty means success.
    #[prost(string, tag = "2")]
    pub error: String,
    #[prost(message, optional, tag = "3")]
    pub payload: Option<Any>,
}

/// Uncorrelated state-change notification.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateEnvelope {
    #[prost(string, tag = "1")]
    pub subject_id: String,
    #[prost(message, optional, tag = "2")]
    pub state: Option<Any>,
}

/// Current Unix time in nanoseconds.
pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Encode any envelope for publishing.
pub fn encode<M: Message>(message: &M) -> Bytes {
    Bytes::from(message.encode_to_vec())
}

impl RequestEnvelope {
    /// Time elapsed since the request was sent, if it carries a send time.
    ///
    /// A send time in the future (clock skew) counts as zero age.
    pub fn age(&self, now_nanos: i64) -> Option<Duration> {
        if self.sent_at <= 0 {
            return None;
        }
        let elapsed = now_nanos.saturating_sub(self.sent_at).max(0);
        Some(Duration::from_nanos(elapsed as u64))
    }

    /// Whether the request targets a specific entity.
    pub fn is_targeted(&self) -> bool {
        !self.target_id.is_empty()
    }
}

impl ResponseEnvelope {
    pub fn success(correlation_id: impl Into<String>, payload: Option<Any>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            error: String::new(),
            payload,
        }
    }

    pub fn failure(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            error: error.into(),
            payload: None,
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}
