//! Optimistic-lock tokens.

use entigraph_core::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST_TOKEN: AtomicI64 = AtomicI64::new(0);

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Mint a new lock token: a millisecond timestamp, strictly greater than
/// any token minted before in this process.
pub fn next_lock_token() -> Value {
    let now = now_millis();
    let mut last = LAST_TOKEN.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_TOKEN.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return Value::Timestamp(next),
            Err(actual) => last = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_strictly_increase() {
        let mut previous = next_lock_token().as_i64().unwrap();
        for _ in 0..1000 {
            let token = next_lock_token().as_i64().unwrap();
            assert!(token > previous);
            previous = token;
        }
    }
}
