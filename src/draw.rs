//! Starting (and cancelling) a draw.
//!
//! Only the room owner creates sessions. The outcome is fixed at creation
//! time and travels inside the session, so replicas never need a separate
//! "who won" message to agree.

use crate::channel::{publish_json, read_json, SharedStateChannel};
use crate::config::DrawConfig;
use crate::error::{DrawError, DrawResult};
use crate::types::{
    keys, now_ms, same_identity, Candidate, DrawEvent, DrawSession, RoomId, RoomMeta,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// How long past its scheduled end an unfinished session still blocks new draws
pub const FINISH_GRACE_MS: i64 = 5_000;

/// Average reel speed in units per second for a given travel
pub fn reel_speed(travel_units: u64, unit_width: f64, duration_ms: u64) -> f64 {
    if duration_ms == 0 {
        return f64::INFINITY;
    }
    travel_units as f64 * unit_width / (duration_ms as f64 / 1000.0)
}

/// Smallest loop count >= `loops` that satisfies the speed floor
pub fn loops_for_speed(
    loops: u32,
    len: usize,
    target_index: usize,
    duration_ms: u64,
    config: &DrawConfig,
) -> u32 {
    let len = len.max(1) as u64;
    let travel = |loops: u32| {
        (loops as u64)
            .saturating_mul(len)
            .saturating_add(target_index as u64)
    };

    let required = (config.min_speed * duration_ms as f64 / 1000.0 / config.unit_width).ceil();
    let mut loops = loops;
    if required.is_finite() && required > travel(loops) as f64 {
        let missing = required as u64 - target_index as u64;
        loops = loops.max(missing.div_ceil(len).min(u32::MAX as u64) as u32);
    }
    // Float rounding can leave the closed form one loop short
    while loops < u32::MAX
        && reel_speed(travel(loops), config.unit_width, duration_ms) < config.min_speed
    {
        loops += 1;
    }
    loops
}

/// Build a new session over `entries`. Pure apart from the random source.
pub fn plan_session<R: Rng>(
    entries: &[Candidate],
    started_by: &str,
    now_ms: i64,
    config: &DrawConfig,
    rng: &mut R,
) -> DrawResult<DrawSession> {
    if entries.is_empty() {
        return Err(DrawError::EmptyRoster);
    }

    let target_index = rng.random_range(0..entries.len());
    let duration_ms = rng
        .random_range(config.spin_band_min_ms..=config.spin_band_max_ms)
        .clamp(config.min_spin_ms, config.max_spin_ms);
    let loops = rng.random_range(config.min_loops..=config.max_random_loops);
    let loops = loops_for_speed(loops, entries.len(), target_index, duration_ms, config);
    let start_pad = i64::try_from(config.start_pad_ms).unwrap_or(i64::MAX);

    Ok(DrawSession {
        run_id: ulid::Ulid::new(),
        started_by: started_by.trim().to_string(),
        started_at: now_ms.saturating_add(start_pad),
        duration_ms,
        entries: entries.to_vec(),
        target_index,
        loops,
        is_spinning: true,
        winner: None,
        cancelled: false,
    })
}

/// True if `session` should still block a new draw at `now_ms`
pub fn blocks_new_draw(session: &DrawSession, now_ms: i64) -> bool {
    session.is_spinning && now_ms <= session.ends_at().saturating_add(FINISH_GRACE_MS)
}

pub struct DrawCoordinator {
    room: RoomId,
    channel: Arc<dyn SharedStateChannel>,
    config: DrawConfig,
}

impl DrawCoordinator {
    pub fn new(room: RoomId, channel: Arc<dyn SharedStateChannel>, config: DrawConfig) -> Self {
        Self {
            room,
            channel,
            config,
        }
    }

    pub fn config(&self) -> &DrawConfig {
        &self.config
    }

    async fn ensure_owner(&self, requested_by: &str) -> DrawResult<()> {
        let meta = read_json::<RoomMeta>(self.channel.as_ref(), &keys::meta(&self.room)).await?;
        match meta {
            Some((_, meta)) if same_identity(&meta.owner, requested_by) => Ok(()),
            _ => {
                tracing::info!(
                    room = %self.room,
                    requested_by,
                    "Rejected draw request from non-owner"
                );
                Err(DrawError::PermissionDenied {
                    requested_by: requested_by.to_string(),
                })
            }
        }
    }

    /// Stored session version and record; undecodable records keep their
    /// version (for compare-and-swap) but are otherwise treated as absent
    async fn stored_session(&self) -> DrawResult<(Option<u64>, Option<DrawSession>)> {
        let key = keys::session(&self.room);
        let Some(stored) = self.channel.read(&key).await? else {
            return Ok((None, None));
        };
        match stored.decode::<DrawSession>() {
            Ok(session) => Ok((Some(stored.version), Some(session))),
            Err(e) => {
                tracing::warn!("Ignoring unreadable session record in {}: {}", key, e);
                Ok((Some(stored.version), None))
            }
        }
    }

    pub async fn start_draw(
        &self,
        candidates: &[Candidate],
        requested_by: &str,
    ) -> DrawResult<DrawSession> {
        // Seeded from the thread rng; ThreadRng itself cannot be held across awaits
        let mut rng = StdRng::from_rng(&mut rand::rng());
        self.start_draw_at(candidates, requested_by, now_ms(), &mut rng)
            .await
    }

    /// Guards: owner, single-flight, non-empty. Then plan, store, broadcast.
    pub async fn start_draw_at<R: Rng>(
        &self,
        candidates: &[Candidate],
        requested_by: &str,
        now_ms: i64,
        rng: &mut R,
    ) -> DrawResult<DrawSession> {
        self.ensure_owner(requested_by).await?;

        let (expected, active) = self.stored_session().await?;
        if let Some(active) = &active {
            if blocks_new_draw(active, now_ms) {
                return Err(DrawError::AlreadySpinning(active.run_id));
            }
        }

        let session = plan_session(candidates, requested_by, now_ms, &self.config, rng)?;

        let value = serde_json::to_value(&session)
            .map_err(|e| DrawError::InvalidSession(e.to_string()))?;
        match self
            .channel
            .compare_and_swap(&keys::session(&self.room), expected, value)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // Another start won the race between our read and write
                let (_, current) = self.stored_session().await?;
                let run_id = current.map_or(session.run_id, |s| s.run_id);
                return Err(DrawError::AlreadySpinning(run_id));
            }
            Err(e) => {
                tracing::warn!(
                    run_id = %session.run_id,
                    "Durable session write failed, continuing with broadcast only: {}",
                    e
                );
            }
        }

        publish_json(
            self.channel.as_ref(),
            &keys::draw_topic(&self.room),
            &DrawEvent::Started {
                session: session.clone(),
            },
        )
        .await;

        tracing::info!(
            room = %self.room,
            run_id = %session.run_id,
            entries = session.entries.len(),
            duration_ms = session.duration_ms,
            loops = session.loops,
            "Draw started"
        );
        Ok(session)
    }

    pub async fn cancel_draw(&self, requested_by: &str) -> DrawResult<Option<DrawSession>> {
        self.cancel_draw_at(requested_by, now_ms()).await
    }

    /// Owner-only abort of the spinning session. `Ok(None)` if nothing spins.
    pub async fn cancel_draw_at(
        &self,
        requested_by: &str,
        now_ms: i64,
    ) -> DrawResult<Option<DrawSession>> {
        self.ensure_owner(requested_by).await?;

        let (Some(version), Some(active)) = self.stored_session().await? else {
            return Ok(None);
        };
        if !blocks_new_draw(&active, now_ms) {
            return Ok(None);
        }

        let cancelled = DrawSession {
            is_spinning: false,
            cancelled: true,
            winner: None,
            ..active
        };
        let value = serde_json::to_value(&cancelled)
            .map_err(|e| DrawError::InvalidSession(e.to_string()))?;
        match self
            .channel
            .compare_and_swap(&keys::session(&self.room), Some(version), value)
            .await
        {
            Ok(true) => {}
            // Finished or replaced meanwhile
            Ok(false) => return Ok(None),
            Err(e) => tracing::warn!(run_id = %cancelled.run_id, "Cancel write failed: {}", e),
        }

        publish_json(
            self.channel.as_ref(),
            &keys::draw_topic(&self.room),
            &DrawEvent::Cancelled {
                run_id: cancelled.run_id,
            },
        )
        .await;

        tracing::info!(room = %self.room, run_id = %cancelled.run_id, "Draw cancelled");
        Ok(Some(cancelled))
    }
}
