//! Debug assertion macros for the ring index protocol.
//!
//! Active only in debug builds; zero overhead in release. Both rings share
//! the same rules: indices are free-running u64 counters, readers never pass
//! writers, and the in-flight count never exceeds the capacity.

/// Assert that the in-flight count does not exceed the ring capacity.
///
/// Holds for the request ring by the full-check on enqueue, and for the
/// response ring because outstanding responses are bounded by outstanding
/// requests.
macro_rules! debug_assert_bounded_count {
    ($count:expr, $capacity:expr) => {
        debug_assert!(
            $count <= $capacity,
            "ring overfull: {} in flight exceeds capacity {}",
            $count,
            $capacity
        )
    };
}

/// Assert that a read index never claims past the matching write index.
macro_rules! debug_assert_read_behind_write {
    ($read:expr, $write:expr) => {
        debug_assert!(
            $read <= $write,
            "read index {} passed write index {}",
            $read,
            $write
        )
    };
}

/// Assert that an index only moves forward. At one claim per nanosecond a
/// u64 takes centuries to wrap; a decrease is always a bug.
macro_rules! debug_assert_monotonic {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old,
            "{} decreased from {} to {}",
            $name,
            $old,
            $new
        )
    };
}

pub(crate) use debug_assert_bounded_count;
pub(crate) use debug_assert_monotonic;
pub(crate) use debug_assert_read_behind_write;
