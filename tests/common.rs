#![allow(dead_code)]

use std::sync::{Arc, Once};

use xsmq::{Config, ManualClock, MemoryBackend, QueueRegistry, QueueSettings};

/// Backend clock at the start of every test, in ms.
pub const START: i64 = 1_700_000_000_000;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = xsmq::logging::try_init_logging();
    });
}

pub fn registry() -> (QueueRegistry, ManualClock) {
    registry_with(Config::default())
}

pub fn registry_with(config: Config) -> (QueueRegistry, ManualClock) {
    init_logging();
    let clock = ManualClock::new(START);
    let backend = Arc::new(MemoryBackend::with_clock(clock.clone()));
    (QueueRegistry::from_config(backend, &config), clock)
}

pub fn settings(htimeout: i64, etimeout: i64, plimit: i64) -> QueueSettings {
    QueueSettings {
        htimeout,
        etimeout,
        plimit,
    }
}
