use serde::{Deserialize, Serialize};

/// Display-name identity of a draw candidate (case-sensitive, non-empty)
pub type Candidate = String;

/// Identity of a participant (owner comparison is trimmed + case-insensitive)
pub type Identity = String;

pub type RoomId = String;

/// Unique token of one draw session.
///
/// ULIDs sort by creation time, so comparing two run ids tells which
/// session is newer.
pub type RunId = ulid::Ulid;

/// Frozen, shareable description of one randomized selection.
///
/// Used identically for the durable record and the broadcast payload.
/// Unknown fields are ignored on deserialize.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DrawSession {
    pub run_id: RunId,
    pub started_by: Identity,
    /// Epoch millis at which the animation logically begins (scheduled in the future)
    pub started_at: i64,
    pub duration_ms: u64,
    pub entries: Vec<Candidate>,
    pub target_index: usize,
    pub loops: u32,
    #[serde(default = "default_is_spinning")]
    pub is_spinning: bool,
    #[serde(default)]
    pub winner: Option<Candidate>,
    /// Set when the owner aborted the draw before it landed
    #[serde(default)]
    pub cancelled: bool,
}

/// Longest spin accepted off the wire
pub const MAX_SESSION_DURATION_MS: u64 = 10 * 60 * 1_000;

fn default_is_spinning() -> bool {
    true
}

impl DrawSession {
    /// The candidate this session lands on, derived locally on every replica
    pub fn target(&self) -> Option<&Candidate> {
        self.entries.get(self.target_index)
    }

    /// Total number of units the reel travels: `loops * len + target_index`
    pub fn travel_units(&self) -> u64 {
        (self.loops as u64)
            .saturating_mul(self.entries.len() as u64)
            .saturating_add(self.target_index as u64)
    }

    /// Epoch millis at which the animation reaches progress 1
    pub fn ends_at(&self) -> i64 {
        let duration = i64::try_from(self.duration_ms).unwrap_or(i64::MAX);
        self.started_at.saturating_add(duration)
    }

    /// Structural checks applied to every session read off the wire
    pub fn validate(&self) -> Result<(), String> {
        if self.entries.is_empty() {
            return Err("session has no entries".to_string());
        }
        if self.target_index >= self.entries.len() {
            return Err(format!(
                "target index {} out of range for {} entries",
                self.target_index,
                self.entries.len()
            ));
        }
        if self.duration_ms == 0 || self.duration_ms > MAX_SESSION_DURATION_MS {
            return Err(format!(
                "session duration {} ms outside (0, {}]",
                self.duration_ms, MAX_SESSION_DURATION_MS
            ));
        }
        if self.started_at < 0 {
            return Err(format!("session start {} is before the epoch", self.started_at));
        }
        if let Some(winner) = &self.winner {
            if Some(winner) != self.target() {
                return Err(format!("winner {winner:?} does not match target entry"));
            }
        }
        Ok(())
    }

    /// Copy of this session in its terminal state with the derived winner
    pub fn finished(&self) -> Self {
        Self {
            is_spinning: false,
            winner: self.target().cloned(),
            ..self.clone()
        }
    }
}

/// Durable per-room metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomMeta {
    pub owner: Identity,
}

/// Roster broadcast: full selection, replacing whatever the receiver had
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RosterUpdate {
    pub selected: Vec<Candidate>,
    pub updated_by: Identity,
}

/// Best-effort messages sent on a room's draw topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum DrawEvent {
    Started { session: DrawSession },
    Result { run_id: RunId, winner: Candidate },
    Cancelled { run_id: RunId },
}

/// Per-client layout used to turn index distance into a pixel offset.
///
/// Recomputed from the local viewport on every tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Layout {
    /// Offset at which the first entry sits under the center marker
    pub center_offset: f64,
    /// Linear size of one candidate cell
    pub unit_width: f64,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            center_offset: 0.0,
            unit_width: 120.0,
        }
    }
}

/// Durable keys and broadcast topics for a room
pub mod keys {
    pub fn meta(room: &str) -> String {
        format!("rooms/{room}/meta")
    }

    pub fn roster(room: &str) -> String {
        format!("rooms/{room}/roster")
    }

    pub fn session(room: &str) -> String {
        format!("rooms/{room}/session")
    }

    pub fn draw_topic(room: &str) -> String {
        format!("rooms/{room}/draw")
    }

    pub fn roster_topic(room: &str) -> String {
        format!("rooms/{room}/roster")
    }
}

/// Trimmed, case-insensitive identity comparison
pub fn same_identity(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// Current wall-clock time in epoch millis
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
