use serde_json::Value;

use crate::error::Error;

pub const DEFAULT_MAX_RETRY: i64 = 25;

/// Whether and how often a failed job should be retried, decoded from the
/// envelope's `retry` field. Sidekiq allows both `true` (default max) and an
/// integer (custom max) here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Disabled,
    DefaultMax,
    Max(i64),
}

impl RetryPolicy {
    pub fn max_retries(&self) -> Option<i64> {
        match self {
            RetryPolicy::Disabled => None,
            RetryPolicy::DefaultMax => Some(DEFAULT_MAX_RETRY),
            RetryPolicy::Max(max) => Some(*max),
        }
    }
}

/// A job envelope fetched from a queue.
///
/// The exact text the envelope was fetched with is kept alongside the parsed
/// fields. Acknowledgement must `LREM` the very bytes that were moved onto
/// the inprogress list, so mutations made by middleware never touch
/// `original_json`, only the re-serialized form written to the retry set.
#[derive(Debug, Clone)]
pub struct Message {
    value: Value,
    original: String,
}

impl Message {
    pub fn from_json(json: &str) -> Result<Message, Error> {
        let value = serde_json::from_str(json)?;
        Ok(Message {
            value,
            original: json.to_string(),
        })
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.value.get(field)
    }

    pub fn set(&mut self, field: &str, value: Value) {
        if let Value::Object(map) = &mut self.value {
            map.insert(field.to_string(), value);
        }
    }

    pub fn jid(&self) -> Option<&str> {
        self.get("jid").and_then(Value::as_str)
    }

    pub fn class(&self) -> Option<&str> {
        self.get("class").and_then(Value::as_str)
    }

    pub fn args(&self) -> Option<&Value> {
        self.get("args")
    }

    pub fn queue(&self) -> Option<&str> {
        self.get("queue").and_then(Value::as_str)
    }

    pub fn retry(&self) -> RetryPolicy {
        match self.get("retry") {
            Some(Value::Bool(true)) => RetryPolicy::DefaultMax,
            Some(Value::Number(n)) => match n.as_i64() {
                Some(max) => RetryPolicy::Max(max),
                None => RetryPolicy::Disabled,
            },
            _ => RetryPolicy::Disabled,
        }
    }

    pub fn retry_count(&self) -> Option<i64> {
        self.get("retry_count").and_then(Value::as_i64)
    }

    /// The exact text this message was fetched with.
    pub fn original_json(&self) -> &str {
        &self.original
    }

    /// Serialize the current state, including any fields set since the fetch.
    pub fn to_json(&self) -> String {
        self.value.to_string()
    }
}
