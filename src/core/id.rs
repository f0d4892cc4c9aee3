//! Message identifier source.
//!
//! Ids are 64-bit flake values rendered as 16 uppercase hex digits:
//!
//! ```text
//!  63                    22 21        12 11          0
//! +-----------------------+------------+-------------+
//! |  unix millis (42 bit) | worker (10)| sequence(12)|
//! +-----------------------+------------+-------------+
//! ```
//!
//! Fixed width keeps lexicographic order equal to numeric order, so ids sort
//! by creation time across every generator sharing a clock.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::core::error::QueueError;
use crate::core::names::MessageId;
use crate::store::BackendError;

const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_WORKER: u16 = (1 << WORKER_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// Produces globally unique, time-ordered message ids.
pub trait IdGenerator: Send + Sync + std::fmt::Debug {
    fn next_id(&self) -> Result<MessageId, QueueError>;
}

#[derive(Debug, Default)]
struct FlakeState {
    last_ms: u64,
    sequence: u64,
}

#[derive(Debug)]
pub struct FlakeIdGenerator {
    worker: u64,
    state: Mutex<FlakeState>,
}

impl FlakeIdGenerator {
    /// Generator for `worker`; only the low 10 bits are used.
    pub fn new(worker: u16) -> Self {
        Self {
            worker: u64::from(worker & MAX_WORKER),
            state: Mutex::new(FlakeState::default()),
        }
    }

    /// Generator with a worker id drawn from a random UUID.
    pub fn random() -> Self {
        let worker = (uuid::Uuid::new_v4().as_u128() & u128::from(MAX_WORKER)) as u16;
        Self::new(worker)
    }

    pub fn worker(&self) -> u16 {
        self.worker as u16
    }

    fn wall_clock_ms() -> Result<u64, QueueError> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .map_err(|e| BackendError::Unavailable(format!("system clock: {e}")).into())
    }

    fn next_raw(&self) -> Result<u64, QueueError> {
        let mut state = self.state.lock();
        // A clock that steps backwards keeps using the last timestamp.
        let mut now = Self::wall_clock_ms()?.max(state.last_ms);

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                while now <= state.last_ms {
                    std::hint::spin_loop();
                    now = Self::wall_clock_ms()?;
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        Ok((now << (WORKER_BITS + SEQUENCE_BITS)) | (self.worker << SEQUENCE_BITS) | state.sequence)
    }
}

impl Default for FlakeIdGenerator {
    fn default() -> Self {
        Self::random()
    }
}

impl IdGenerator for FlakeIdGenerator {
    fn next_id(&self) -> Result<MessageId, QueueError> {
        MessageId::new(format!("{:016X}", self.next_raw()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_and_ordered() {
        let ids = FlakeIdGenerator::new(7);
        let generated: Vec<MessageId> = (0..10_000).map(|_| ids.next_id().unwrap()).collect();

        let unique: HashSet<&MessageId> = generated.iter().collect();
        assert_eq!(unique.len(), generated.len());
        assert!(generated.windows(2).all(|w| w[0] < w[1]));
        assert!(generated.iter().all(|id| id.as_str().len() == 16));
    }

    #[test]
    fn worker_is_masked_to_ten_bits() {
        assert_eq!(FlakeIdGenerator::new(0xFFFF).worker(), 1023);
        assert!(FlakeIdGenerator::random().worker() <= 1023);
    }
}
