use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, taken from the wall clock.
///
/// Deliberately `SystemTime`, not `Instant`: the t1/t2/t3 timers and the
/// k-buffer's `sent_time` need to detect the operator stepping the system
/// clock backward, which a monotonic clock can never observe.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Guards a stored wall-clock timestamp against the clock having moved
/// backward since it was recorded. Returns the timestamp to use, resetting
/// to `now` when the stored value is in the future.
pub fn guard_clock_jump(stored_ms: u64, now_ms: u64) -> u64 {
    if stored_ms > now_ms {
        now_ms
    } else {
        stored_ms
    }
}

/// `now - stored`, saturating at zero after a clock-jump guard so a
/// backward jump never produces a negative/huge elapsed value.
pub fn elapsed_ms(stored_ms: u64, now_ms: u64) -> u64 {
    now_ms.saturating_sub(guard_clock_jump(stored_ms, now_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_jump_is_guarded() {
        assert_eq!(guard_clock_jump(1_000_000, 500), 500);
        assert_eq!(guard_clock_jump(100, 500), 100);
    }

    #[test]
    fn elapsed_never_underflows() {
        assert_eq!(elapsed_ms(1_000_000, 500), 0);
        assert_eq!(elapsed_ms(100, 500), 400);
    }
}
