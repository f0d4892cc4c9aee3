//! Backend key schema.
//!
//! | key                         | type       | contents                           |
//! |-----------------------------|------------|------------------------------------|
//! | `[ns:]queues`               | set        | registered queue names             |
//! | `[ns:]queue:<name>:P`       | hash       | queue attributes and counters      |
//! | `[ns:]queue:<name>:M`       | sorted set | Ready index, score = ready time    |
//! | `[ns:]queue:<name>:H`       | sorted set | Leased index, score = lease expiry |
//! | `[ns:]messages:<id>`        | hash       | message record                     |

use crate::core::names::{MessageId, QueueName};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Keys prefixed with `namespace:`; a blank namespace means no prefix.
    pub fn new(namespace: Option<&str>) -> Self {
        let prefix = match namespace.map(str::trim) {
            Some(ns) if !ns.is_empty() => format!("{ns}:"),
            _ => String::new(),
        };
        Self { prefix }
    }

    pub fn registry(&self) -> String {
        format!("{}queues", self.prefix)
    }

    pub fn queue_config(&self, queue: &QueueName) -> String {
        format!("{}queue:{}:P", self.prefix, queue)
    }

    pub fn ready(&self, queue: &QueueName) -> String {
        format!("{}queue:{}:M", self.prefix, queue)
    }

    pub fn leased(&self, queue: &QueueName) -> String {
        format!("{}queue:{}:H", self.prefix, queue)
    }

    pub fn message(&self, id: &MessageId) -> String {
        format!("{}messages:{}", self.prefix, id)
    }
}
