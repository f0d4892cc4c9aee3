//! Validated identifiers: queue names and message ids.

use std::fmt;

use crate::core::error::QueueError;

pub const MAX_QUEUE_NAME_LEN: usize = 160;
pub const MESSAGE_ID_LEN: usize = 16;

/// Queue name matching `[A-Za-z0-9_-]{1,160}` after trimming.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl AsRef<str>) -> Result<Self, QueueError> {
        let name = name.as_ref().trim();
        if name.is_empty() {
            return Err(QueueError::invalid("queue name", "missing"));
        }
        if name.len() > MAX_QUEUE_NAME_LEN {
            return Err(QueueError::invalid(
                "queue name",
                format!("longer than {MAX_QUEUE_NAME_LEN} characters"),
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(QueueError::invalid(
                "queue name",
                format!("`{name}` may only contain A-Z, a-z, 0-9, `_` and `-`"),
            ));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for QueueName {
    type Error = QueueError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Fixed-width, time-ordered message id matching `[A-Z0-9:]{16}`.
///
/// Lexicographic order of ids follows creation order, which the visibility
/// index relies on to break score ties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl AsRef<str>) -> Result<Self, QueueError> {
        let id = id.as_ref().trim();
        if id.is_empty() {
            return Err(QueueError::invalid("message id", "missing"));
        }
        if id.len() != MESSAGE_ID_LEN
            || !id
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == ':')
        {
            return Err(QueueError::invalid(
                "message id",
                format!("`{id}` is not {MESSAGE_ID_LEN} characters of [A-Z0-9:]"),
            ));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for MessageId {
    type Error = QueueError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_are_trimmed_and_checked() {
        assert_eq!(QueueName::new("  jobs-1_a ").unwrap().as_str(), "jobs-1_a");
        assert!(QueueName::new("").is_err());
        assert!(QueueName::new("   ").is_err());
        assert!(QueueName::new("has space").is_err());
        assert!(QueueName::new("colon:name").is_err());
        assert!(QueueName::new("x".repeat(160)).is_ok());
        assert!(QueueName::new("x".repeat(161)).is_err());
    }

    #[test]
    fn message_ids_are_fixed_width_uppercase() {
        assert!(MessageId::new("0123456789ABCDEF").is_ok());
        assert!(MessageId::new("0123456789abcdef").is_err());
        assert!(MessageId::new("0123456789ABCDE").is_err());
        assert!(MessageId::new("").is_err());

        let err = MessageId::new("nope").unwrap_err();
        assert!(matches!(err, QueueError::Validation { field: "message id", .. }));
    }
}
