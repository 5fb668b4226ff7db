use std::time::{SystemTime, UNIX_EPOCH};

mod err;
pub use err::*;

pub mod announce;
pub mod control;
pub mod dispatch;
pub mod fsutil;
pub mod product;
pub mod queue;
pub mod record;
pub mod recv;
pub mod sender;
pub mod wire;

/// Wall-clock seconds since the Unix epoch. Queue times travel on the wire
/// in this form.
pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
