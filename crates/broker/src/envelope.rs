//! Message envelope: body plus transport headers.
//!
//! The retry attempt counter travels in the `x-retry-attempt` header and has
//! no storage anywhere else. A retry is a **new** envelope with the counter
//! incremented; envelopes are never mutated in place.

use std::collections::BTreeMap;

/// Header carrying the retry attempt counter. Absent means attempt 0.
pub const RETRY_ATTEMPT_HEADER: &str = "x-retry-attempt";

/// A message as it travels over the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, serde_json::Value>,
    /// Message-type attribute for observability (e.g. "daily_sales_report").
    pub kind: Option<String>,
    pub content_type: Option<String>,
    /// Whether the message should survive a broker restart.
    pub persistent: bool,
}

impl MessageEnvelope {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            headers: BTreeMap::new(),
            kind: None,
            content_type: None,
            persistent: true,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Retry attempt carried by this message; absent or malformed ⇒ 0.
    pub fn retry_attempt(&self) -> u32 {
        self.headers
            .get(RETRY_ATTEMPT_HEADER)
            .and_then(|v| v.as_u64())
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(0)
    }

    /// Build the requeue envelope: same body and headers, attempt counter
    /// incremented from this message's value.
    pub fn next_attempt(&self) -> MessageEnvelope {
        let mut retry = self.clone();
        retry.headers.insert(
            RETRY_ATTEMPT_HEADER.to_string(),
            serde_json::Value::from(self.retry_attempt() + 1),
        );
        retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_header_means_attempt_zero() {
        let envelope = MessageEnvelope::new(b"{}".to_vec());
        assert_eq!(envelope.retry_attempt(), 0);
    }

    #[test]
    fn malformed_header_means_attempt_zero() {
        let envelope = MessageEnvelope::new(b"{}".to_vec())
            .with_header(RETRY_ATTEMPT_HEADER, "three");
        assert_eq!(envelope.retry_attempt(), 0);
    }

    #[test]
    fn next_attempt_increments_and_preserves_other_headers() {
        let envelope = MessageEnvelope::new(b"{}".to_vec())
            .with_header("x-trace-id", "abc")
            .with_header(RETRY_ATTEMPT_HEADER, 3);

        let retry = envelope.next_attempt();
        assert_eq!(retry.retry_attempt(), 4);
        assert_eq!(retry.headers["x-trace-id"], "abc");
        assert_eq!(retry.body, envelope.body);
        // Original is untouched.
        assert_eq!(envelope.retry_attempt(), 3);
    }
}
