//! Fixed-period schedule arithmetic. All functions take unix seconds and a
//! validated `repeat_sec > 0`.

/// True when `t` is a trigger instant: `(t - offset_sec) mod repeat_sec == 0`.
///
/// Offsets are reduced with Euclidean remainder, so negative offsets and
/// offsets larger than the period behave as their positive residue and
/// extreme values cannot overflow.
#[inline]
pub fn is_due(t: i64, repeat_sec: i64, offset_sec: i64) -> bool {
    debug_assert!(repeat_sec > 0, "repeat_sec must be validated before matching");
    t.rem_euclid(repeat_sec) == offset_sec.rem_euclid(repeat_sec)
}

/// The first trigger instant strictly after `t`.
pub fn next_tick_after(t: i64, repeat_sec: i64, offset_sec: i64) -> i64 {
    let phase = (t.rem_euclid(repeat_sec) - offset_sec.rem_euclid(repeat_sec)).rem_euclid(repeat_sec);
    t.saturating_add(repeat_sec - phase)
}

/// Milliseconds from `now_ms` until the tick following `tick`.
///
/// Negative when the successor tick is already in the past.
pub fn millis_until_next_tick(tick: i64, repeat_sec: i64, now_ms: i64) -> i64 {
    tick.saturating_add(repeat_sec)
        .saturating_mul(1_000)
        .saturating_sub(now_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_exactly_once_per_window() {
        for repeat in 1..=13_i64 {
            for offset in -40..=40_i64 {
                for window_start in (-3 * repeat..3 * repeat).step_by(repeat as usize) {
                    let due: Vec<i64> = (window_start..window_start + repeat)
                        .filter(|t| is_due(*t, repeat, offset))
                        .collect();
                    assert_eq!(due.len(), 1, "repeat={repeat} offset={offset} window={window_start}");
                    assert_eq!((due[0] - offset).rem_euclid(repeat), 0);
                }
            }
        }
    }

    #[test]
    fn negative_offset_matches_positive_residue() {
        // -15 ≡ 45 (mod 60)
        assert!(is_due(45, 60, -15));
        assert!(is_due(105, 60, -15));
        assert!(!is_due(60, 60, -15));
        assert_eq!(
            (0..600).filter(|t| is_due(*t, 60, -15)).collect::<Vec<_>>(),
            (0..600).filter(|t| is_due(*t, 60, 45)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn offset_larger_than_period() {
        assert!(is_due(10, 60, 70));
        assert!(is_due(1_800_000_010, 60, 130));
        assert!(!is_due(1_800_000_000, 60, 130));
    }

    #[test]
    fn negative_timestamps() {
        assert!(is_due(-60, 60, 0));
        assert!(is_due(-55, 60, 5));
        assert!(!is_due(-1, 60, 0));
    }

    #[test]
    fn extreme_values_do_not_overflow() {
        assert!(is_due(i64::MIN, 1, i64::MAX));
        let _ = is_due(i64::MAX, 7, i64::MIN);
    }

    #[test]
    fn next_tick_is_strictly_later_and_due() {
        for repeat in 1..=10_i64 {
            for offset in -12..=12_i64 {
                for t in -30..30_i64 {
                    let next = next_tick_after(t, repeat, offset);
                    assert!(next > t);
                    assert!(next - t <= repeat);
                    assert!(is_due(next, repeat, offset));
                }
            }
        }
    }

    #[test]
    fn next_tick_from_a_tick_is_one_period_later() {
        assert_eq!(next_tick_after(1_800_000_000, 60, 0), 1_800_000_060);
        assert_eq!(next_tick_after(1_800_000_005, 60, 5), 1_800_000_065);
    }

    #[test]
    fn millis_until_next_tick_counts_down() {
        let tick = 1_800_000_000;
        assert_eq!(millis_until_next_tick(tick, 60, tick * 1_000), 60_000);
        assert_eq!(millis_until_next_tick(tick, 60, tick * 1_000 + 59_500), 500);
        assert_eq!(millis_until_next_tick(tick, 60, tick * 1_000 + 61_000), -1_000);
    }
}
