//! Pointer-driven drag/fling of the reel.
//!
//! Purely local presentation: the controller only moves this client's
//! offset and never writes shared state. A draw session adopting the reel
//! cancels any drag or momentum in progress.

/// Pixels the pointer must travel before a press becomes a drag
pub const DRAG_THRESHOLD: f64 = 6.0;
/// Below this speed (units per frame) motion stops
pub const MIN_VELOCITY: f64 = 0.5;
/// Momentum multiplier applied each frame
pub const DECAY: f64 = 0.95;
/// Weight of the previous velocity estimate
pub const VELOCITY_SMOOTHING: f64 = 0.8;
/// Nominal frame length used to express velocity per frame
pub const FRAME_MS: f64 = 16.0;

pub type PointerId = u32;

/// Ephemeral pointer tracking, local to this client
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrubState {
    pub pointer_id: PointerId,
    pub origin_x: f64,
    pub last_x: f64,
    pub last_t_ms: i64,
    /// Smoothed velocity in units per frame
    pub velocity: f64,
    pub dragging: bool,
}

/// What the host UI should do with the pointer after a move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerEffect {
    /// Not ours (yet): let the event reach its target
    PassThrough,
    /// Threshold crossed: capture the pointer from now on
    Capture(PointerId),
    /// Already captured and consumed
    Consumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Never crossed the drag threshold; treat as a click
    Tap,
    /// Released too slowly for a fling
    Stopped,
    /// Momentum loop should start
    Fling,
}

#[derive(Debug, Clone, Default)]
pub struct InertialScrubController {
    offset: f64,
    pointer: Option<ScrubState>,
    /// Momentum velocity while coasting
    coasting: Option<f64>,
}

impl InertialScrubController {
    pub fn new(offset: f64) -> Self {
        Self {
            offset,
            ..Self::default()
        }
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Hand the offset over (e.g. to the terminal pose of a draw)
    pub fn set_offset(&mut self, offset: f64) {
        self.offset = offset;
    }

    pub fn is_dragging(&self) -> bool {
        self.pointer.is_some_and(|p| p.dragging)
    }

    pub fn is_coasting(&self) -> bool {
        self.coasting.is_some()
    }

    pub fn velocity(&self) -> f64 {
        match (self.coasting, self.pointer) {
            (Some(v), _) => v,
            (None, Some(p)) => p.velocity,
            _ => 0.0,
        }
    }

    /// Record the press origin. Capture is deferred until the pointer moves.
    pub fn on_press_start(&mut self, pointer_id: PointerId, origin_x: f64, t_ms: i64) {
        // A new press always interrupts coasting
        self.coasting = None;
        self.pointer = Some(ScrubState {
            pointer_id,
            origin_x,
            last_x: origin_x,
            last_t_ms: t_ms,
            velocity: 0.0,
            dragging: false,
        });
    }

    pub fn on_move(&mut self, pointer_id: PointerId, x: f64, t_ms: i64) -> PointerEffect {
        let Some(state) = self.pointer.as_mut().filter(|p| p.pointer_id == pointer_id) else {
            return PointerEffect::PassThrough;
        };

        let mut effect = PointerEffect::Consumed;
        if !state.dragging {
            if (x - state.origin_x).abs() <= DRAG_THRESHOLD {
                return PointerEffect::PassThrough;
            }
            state.dragging = true;
            effect = PointerEffect::Capture(pointer_id);
        }

        let dx = x - state.last_x;
        let dt = (t_ms - state.last_t_ms).max(1) as f64;
        let instantaneous = dx / dt * FRAME_MS;
        state.velocity =
            VELOCITY_SMOOTHING * state.velocity + (1.0 - VELOCITY_SMOOTHING) * instantaneous;
        state.last_x = x;
        state.last_t_ms = t_ms;
        self.offset += dx;

        effect
    }

    pub fn on_release(&mut self, pointer_id: PointerId) -> ReleaseOutcome {
        let Some(state) = self.pointer.filter(|p| p.pointer_id == pointer_id) else {
            return ReleaseOutcome::Tap;
        };
        self.pointer = None;

        if !state.dragging {
            return ReleaseOutcome::Tap;
        }
        if state.velocity.abs() < MIN_VELOCITY {
            return ReleaseOutcome::Stopped;
        }
        tracing::debug!(velocity = state.velocity, "Fling started");
        self.coasting = Some(state.velocity);
        ReleaseOutcome::Fling
    }

    /// One momentum frame: `pos += v; v *= decay`. Returns false once stopped.
    pub fn step(&mut self) -> bool {
        let Some(v) = self.coasting else {
            return false;
        };
        self.offset += v;
        let v = v * DECAY;
        if v.abs() < MIN_VELOCITY {
            self.coasting = None;
            false
        } else {
            self.coasting = Some(v);
            true
        }
    }

    /// Window blur or a draw session taking control: drop drag and momentum
    pub fn cancel(&mut self) {
        if self.pointer.is_some() || self.coasting.is_some() {
            tracing::debug!("Scrub cancelled");
        }
        self.pointer = None;
        self.coasting = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_passes_through() {
        let mut scrub = InertialScrubController::new(0.0);
        scrub.on_press_start(1, 100.0, 0);

        assert_eq!(scrub.on_move(1, 103.0, 16), PointerEffect::PassThrough);
        assert_eq!(scrub.on_release(1), ReleaseOutcome::Tap);
        assert_eq!(scrub.offset(), 0.0);
        assert!(!scrub.is_coasting());
    }

    #[test]
    fn test_drag_captures_and_tracks_one_to_one() {
        let mut scrub = InertialScrubController::new(50.0);
        scrub.on_press_start(7, 100.0, 0);

        assert_eq!(scrub.on_move(7, 110.0, 16), PointerEffect::Capture(7));
        assert!(scrub.is_dragging());
        assert_eq!(scrub.offset(), 60.0);

        assert_eq!(scrub.on_move(7, 90.0, 32), PointerEffect::Consumed);
        assert_eq!(scrub.offset(), 40.0);

        // Other pointers are ignored
        assert_eq!(scrub.on_move(8, 500.0, 40), PointerEffect::PassThrough);
        assert_eq!(scrub.offset(), 40.0);
    }

    #[test]
    fn test_velocity_is_smoothed() {
        let mut scrub = InertialScrubController::new(0.0);
        scrub.on_press_start(1, 0.0, 0);

        // 20px in one frame: 0.8 * 0 + 0.2 * 20
        scrub.on_move(1, 20.0, 16);
        assert!((scrub.velocity() - 4.0).abs() < 1e-9);

        // Another 20px frame: 0.8 * 4 + 0.2 * 20
        scrub.on_move(1, 40.0, 32);
        assert!((scrub.velocity() - 7.2).abs() < 1e-9);
    }

    #[test]
    fn test_slow_release_stops() {
        let mut scrub = InertialScrubController::new(0.0);
        scrub.on_press_start(1, 0.0, 0);
        scrub.on_move(1, 10.0, 1_000);

        assert_eq!(scrub.on_release(1), ReleaseOutcome::Stopped);
        assert!(!scrub.step());
        assert_eq!(scrub.offset(), 10.0);
    }

    #[test]
    fn test_fling_decays_to_rest() {
        let mut scrub = InertialScrubController::new(0.0);
        scrub.on_press_start(1, 0.0, 0);
        for i in 1..=10 {
            scrub.on_move(1, i as f64 * 30.0, i * 16);
        }
        let released_at = scrub.offset();
        assert_eq!(scrub.on_release(1), ReleaseOutcome::Fling);

        let mut frames = 0;
        while scrub.step() {
            frames += 1;
            assert!(frames < 1_000);
        }
        assert!(!scrub.is_coasting());
        assert!(scrub.offset() > released_at);
    }

    #[test]
    fn test_new_press_cancels_momentum() {
        let mut scrub = InertialScrubController::new(0.0);
        scrub.on_press_start(1, 0.0, 0);
        scrub.on_move(1, 100.0, 16);
        assert_eq!(scrub.on_release(1), ReleaseOutcome::Fling);
        assert!(scrub.step());

        let offset = scrub.offset();
        scrub.on_press_start(2, 0.0, 100);
        assert!(!scrub.is_coasting());
        assert!(!scrub.step());
        assert_eq!(scrub.offset(), offset);
    }

    #[test]
    fn test_cancel_drops_drag_and_momentum() {
        let mut scrub = InertialScrubController::new(0.0);
        scrub.on_press_start(1, 0.0, 0);
        scrub.on_move(1, 100.0, 16);
        scrub.cancel();

        assert!(!scrub.is_dragging());
        assert_eq!(scrub.on_release(1), ReleaseOutcome::Tap);
        assert!(!scrub.step());
    }
}
