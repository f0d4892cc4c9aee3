//! Background sweep returning lapsed leases to Ready.
//!
//! `peek`, `receive` and `pop` already requeue their own queue before reading
//! it. The reaper covers queues nobody is reading, so their leased messages
//! show up as ready in `pending` and `stats` too.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::registry::QueueRegistry;

pub struct Reaper;

impl Reaper {
    /// Sweeps every `interval` until `shutdown` turns `true` or its sender
    /// is dropped.
    pub fn spawn(
        registry: Arc<QueueRegistry>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "reaper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match registry.reap_all().await {
                            Ok(0) => {}
                            Ok(requeued) => debug!(requeued, "reaper requeued expired leases"),
                            Err(e) => warn!(error = %e, "reaper sweep failed"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("reaper stopped");
        })
    }
}
