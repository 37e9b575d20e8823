//! Deterministic replay of a draw session.
//!
//! Every replica maps wall-clock time to reel position with the same pure
//! function, so all of them land on `entries[target_index]` at `ends_at()`
//! without exchanging any per-frame state. Only the pixel path depends on
//! the local [`Layout`].

use crate::types::{DrawSession, Layout};

/// One rendered frame of a session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    /// Linear time progress in [0, 1]
    pub progress: f64,
    /// Eased progress in [0, 1]
    pub eased: f64,
    /// Reel offset in layout units
    pub offset: f64,
}

impl Frame {
    pub fn is_terminal(&self) -> bool {
        self.progress >= 1.0
    }
}

pub fn ease_out_cubic(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    1.0 - (1.0 - t).powi(3)
}

/// Linear progress of `session` at `now_ms`, clamped to [0, 1]
pub fn progress(session: &DrawSession, now_ms: i64) -> f64 {
    if session.duration_ms == 0 {
        return 1.0;
    }
    let elapsed = now_ms.saturating_sub(session.started_at) as f64;
    (elapsed / session.duration_ms as f64).clamp(0.0, 1.0)
}

/// Reel offset for an eased progress value
pub fn offset_at(session: &DrawSession, eased: f64, layout: Layout) -> f64 {
    layout.center_offset - session.travel_units() as f64 * layout.unit_width * eased
}

/// Pure frame computation: same session + same `now_ms` + same layout
/// always yields the same frame.
pub fn tick(session: &DrawSession, now_ms: i64, layout: Layout) -> Frame {
    let progress = progress(session, now_ms);
    let eased = ease_out_cubic(progress);
    Frame {
        progress,
        eased,
        offset: offset_at(session, eased, layout),
    }
}

/// Offset at which the session comes to rest
pub fn terminal_offset(session: &DrawSession, layout: Layout) -> f64 {
    offset_at(session, 1.0, layout)
}

/// Entry index currently under the center marker for a given offset.
///
/// Wraps around the entry list, matching a reel that repeats its entries.
pub fn index_at(session: &DrawSession, offset: f64, layout: Layout) -> usize {
    let len = session.entries.len();
    if len == 0 || layout.unit_width <= 0.0 {
        return 0;
    }
    let units = ((layout.center_offset - offset) / layout.unit_width).round() as i64;
    units.rem_euclid(len as i64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    fn session() -> DrawSession {
        DrawSession {
            run_id: ulid::Ulid::new(),
            started_by: "Alice".to_string(),
            started_at: T0,
            duration_ms: 6_000,
            entries: vec!["Alice".into(), "Bob".into(), "Carol".into(), "Dave".into()],
            target_index: 2,
            loops: 6,
            is_spinning: true,
            winner: None,
            cancelled: false,
        }
    }

    fn layout() -> Layout {
        Layout {
            center_offset: 240.0,
            unit_width: 100.0,
        }
    }

    #[test]
    fn test_tick_at_start_is_unmoved() {
        let frame = tick(&session(), T0, layout());
        assert_eq!(frame.progress, 0.0);
        assert_eq!(frame.offset, 240.0);
        assert!(!frame.is_terminal());
    }

    #[test]
    fn test_tick_before_start_clamps() {
        let frame = tick(&session(), T0 - 300, layout());
        assert_eq!(frame.progress, 0.0);
        assert_eq!(frame.offset, 240.0);
    }

    #[test]
    fn test_tick_at_end_lands_on_target() {
        let s = session();
        let frame = tick(&s, T0 + 6_000, layout());
        assert_eq!(frame.progress, 1.0);
        assert!(frame.is_terminal());
        assert_eq!(frame.offset, 240.0 - 26.0 * 100.0);
        assert_eq!(index_at(&s, frame.offset, layout()), 2);
        assert_eq!(s.target().map(String::as_str), Some("Carol"));

        // Past the end stays at rest
        assert_eq!(tick(&s, T0 + 60_000, layout()), frame);
    }

    #[test]
    fn test_tick_with_extreme_clocks_stays_finite() {
        let mut s = session();
        s.started_at = i64::MAX - 1_000;
        let frame = tick(&s, i64::MIN, layout());
        assert_eq!(frame.progress, 0.0);
        assert_eq!(frame.offset, 240.0);

        s.started_at = i64::MIN;
        let frame = tick(&s, i64::MAX, layout());
        assert!(frame.is_terminal());
        assert!(frame.offset.is_finite());
    }

    #[test]
    fn test_tick_midpoint_is_eased() {
        let frame = tick(&session(), T0 + 3_000, layout());
        assert_eq!(frame.progress, 0.5);
        assert!((frame.eased - 0.875).abs() < 1e-12);
        assert!((frame.offset - (240.0 - 26.0 * 100.0 * 0.875)).abs() < 1e-9);
    }

    #[test]
    fn test_tick_is_deterministic() {
        let s = session();
        for now in [T0 - 1, T0 + 17, T0 + 2_999, T0 + 5_999, T0 + 9_000] {
            assert_eq!(tick(&s, now, layout()), tick(&s, now, layout()));
        }
    }

    #[test]
    fn test_layout_changes_path_not_landing_index() {
        let s = session();
        let narrow = Layout {
            center_offset: 0.0,
            unit_width: 64.0,
        };
        let wide = Layout {
            center_offset: 500.0,
            unit_width: 180.0,
        };

        let mid_narrow = tick(&s, T0 + 2_000, narrow).offset;
        let mid_wide = tick(&s, T0 + 2_000, wide).offset;
        assert_ne!(mid_narrow, mid_wide);

        assert_eq!(index_at(&s, terminal_offset(&s, narrow), narrow), 2);
        assert_eq!(index_at(&s, terminal_offset(&s, wide), wide), 2);
    }

    #[test]
    fn test_ease_out_cubic_bounds() {
        assert_eq!(ease_out_cubic(0.0), 0.0);
        assert_eq!(ease_out_cubic(1.0), 1.0);
        assert_eq!(ease_out_cubic(-3.0), 0.0);
        assert_eq!(ease_out_cubic(4.0), 1.0);

        // Monotonic
        let mut prev = 0.0;
        for i in 1..=100 {
            let v = ease_out_cubic(i as f64 / 100.0);
            assert!(v >= prev);
            prev = v;
        }
    }
}
