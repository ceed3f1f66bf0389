//! Identifier generation

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique id such as `flow-0000018f3a2b9c10-0001`
///
/// Wall-clock nanoseconds keep ids unique across restarts; the counter keeps
/// them unique within one process when the clock does not advance.
pub fn generate_id(prefix: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) & 0xFFFF;
    format!("{}-{:016x}-{:04x}", prefix, nanos, seq)
}
