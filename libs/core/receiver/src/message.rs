//! Per-message data: the key/value context, the derived envelope and the
//! persistable wrapper stored in the error storage and message log.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Prefix of ids generated for messages whose source supplied none
pub const SYNTHETIC_ID_PREFIX: &str = "synthetic-message-id-";

/// Well-known context keys
pub mod keys {
    pub const MESSAGE_ID: &str = "message_id";
    pub const CORRELATION_ID: &str = "correlation_id";
    pub const TECHNICAL_CORRELATION_ID: &str = "technical_correlation_id";
    pub const RECEIVED_AT: &str = "received_at";
    /// Set to `"true"` when the message is known to be seen before
    pub const RETRY_FLAG: &str = "retry";
}

/// Mutable scratch space that travels with a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContext {
    values: BTreeMap<String, String>,
}

impl MessageContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.values.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_retry(&self) -> bool {
        self.get(keys::RETRY_FLAG) == Some("true")
    }

    pub fn mark_retry(&mut self) {
        self.insert(keys::RETRY_FLAG, "true");
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl From<BTreeMap<String, String>> for MessageContext {
    fn from(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }
}

/// Identity of one delivery, derived once per fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub message_id: String,
    pub technical_correlation_id: Option<String>,
    pub business_correlation_id: String,
    pub received_at: DateTime<Utc>,
}

impl MessageEnvelope {
    /// Derive the envelope of a fetched message.
    ///
    /// A blank id is replaced by a synthetic one. The business correlation id
    /// comes from `pattern` when it matches the payload, then from the
    /// technical correlation id, then from the message id.
    pub fn derive(
        message_id: Option<String>,
        technical_correlation_id: Option<String>,
        payload: &str,
        pattern: Option<&Regex>,
        received_at: DateTime<Utc>,
    ) -> Self {
        let message_id = ensure_message_id(message_id);
        let technical_correlation_id = technical_correlation_id.filter(|cid| !cid.trim().is_empty());

        let extracted = pattern.and_then(|regex| extract_correlation_id(regex, payload));
        if pattern.is_some() && extracted.is_none() {
            info!(
                message_id = %message_id,
                "Correlation id pattern did not match, reverting to transport correlation id"
            );
        }

        let business_correlation_id = extracted
            .or_else(|| technical_correlation_id.clone())
            .unwrap_or_else(|| message_id.clone());

        Self {
            message_id,
            technical_correlation_id,
            business_correlation_id,
            received_at,
        }
    }

    /// Write the identity keys into `ctx`
    pub fn populate(&self, ctx: &mut MessageContext) {
        ctx.insert(keys::MESSAGE_ID, self.message_id.clone());
        ctx.insert(keys::CORRELATION_ID, self.business_correlation_id.clone());
        ctx.insert(keys::RECEIVED_AT, self.received_at.to_rfc3339());
        if let Some(cid) = &self.technical_correlation_id {
            ctx.insert(keys::TECHNICAL_CORRELATION_ID, cid.clone());
        }
    }
}

fn ensure_message_id(message_id: Option<String>) -> String {
    match message_id.filter(|id| !id.trim().is_empty()) {
        Some(id) => id,
        None => {
            let id = format!("{}{}", SYNTHETIC_ID_PREFIX, Uuid::new_v4().simple());
            debug!(message_id = %id, "Message without id, generated synthetic id");
            id
        }
    }
}

fn extract_correlation_id(regex: &Regex, payload: &str) -> Option<String> {
    let captures = regex.captures(payload)?;
    captures
        .get(1)
        .or_else(|| captures.get(0))
        .map(|m| m.as_str().trim().to_string())
        .filter(|cid| !cid.is_empty())
}

/// Persistable form of a message, independent of the listener's raw type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageWrapper {
    pub id: String,
    pub correlation_id: String,
    pub payload: String,
    pub context: BTreeMap<String, String>,
}

impl MessageWrapper {
    pub fn new(envelope: &MessageEnvelope, payload: impl Into<String>, ctx: &MessageContext) -> Self {
        Self {
            id: envelope.message_id.clone(),
            correlation_id: envelope.business_correlation_id.clone(),
            payload: payload.into(),
            context: ctx.values.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_message_id() {
        let envelope = MessageEnvelope::derive(Some("  ".into()), None, "", None, Utc::now());
        assert!(envelope.message_id.starts_with(SYNTHETIC_ID_PREFIX));
        assert_eq!(envelope.business_correlation_id, envelope.message_id);
    }

    #[test]
    fn test_correlation_id_fallbacks() {
        let now = Utc::now();
        let envelope = MessageEnvelope::derive(Some("m1".into()), Some("t1".into()), "", None, now);
        assert_eq!(envelope.business_correlation_id, "t1");

        let envelope = MessageEnvelope::derive(Some("m1".into()), Some("".into()), "", None, now);
        assert_eq!(envelope.business_correlation_id, "m1");
        assert_eq!(envelope.technical_correlation_id, None);
    }

    #[test]
    fn test_correlation_id_from_pattern() {
        let regex = Regex::new(r"<orderId>(\w+)</orderId>").unwrap();
        let payload = "<order><orderId>A42</orderId></order>";
        let envelope = MessageEnvelope::derive(Some("m1".into()), Some("t1".into()), payload, Some(&regex), Utc::now());
        assert_eq!(envelope.business_correlation_id, "A42");

        let envelope = MessageEnvelope::derive(Some("m1".into()), Some("t1".into()), "<order/>", Some(&regex), Utc::now());
        assert_eq!(envelope.business_correlation_id, "t1");
    }

    #[test]
    fn test_populate_context() {
        let envelope = MessageEnvelope::derive(Some("m1".into()), Some("t1".into()), "", None, Utc::now());
        let mut ctx = MessageContext::new();
        envelope.populate(&mut ctx);
        assert_eq!(ctx.get(keys::MESSAGE_ID), Some("m1"));
        assert_eq!(ctx.get(keys::CORRELATION_ID), Some("t1"));
        assert!(ctx.contains_key(keys::RECEIVED_AT));
        assert!(!ctx.is_retry());
        ctx.mark_retry();
        assert!(ctx.is_retry());
    }

    #[test]
    fn test_wrapper_json() {
        let envelope = MessageEnvelope::derive(Some("m1".into()), None, "", None, Utc::now());
        let mut ctx = MessageContext::new();
        ctx.insert("tenant", "acme");
        let wrapper = MessageWrapper::new(&envelope, "<payload/>", &ctx);

        let json = wrapper.to_json().unwrap();
        let back = MessageWrapper::from_json(&json).unwrap();
        assert_eq!(back.payload, "<payload/>");
        assert_eq!(back.context.get("tenant").map(String::as_str), Some("acme"));
    }
}
