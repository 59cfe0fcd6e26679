use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Source of the current instant for lease bookkeeping.
///
/// The server takes the clock as a trait object so tests can drive lease
/// expiry without waiting on wall time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
