//! Editable candidate selection mirrored across the room.
//!
//! Edits apply locally first and are then published. While a draw is
//! spinning every edit is rejected; after it lands the frozen entries stay
//! authoritative until the next local edit unlocks the roster.

use crate::channel::{publish_json, SharedStateChannel};
use crate::error::{DrawError, DrawResult};
use crate::types::{keys, Candidate, Identity, RoomId, RosterUpdate, RunId};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
struct RosterLock {
    run_id: RunId,
    entries: Vec<Candidate>,
    spinning: bool,
}

pub struct RosterCoordinator {
    room: RoomId,
    identity: Identity,
    channel: Arc<dyn SharedStateChannel>,
    /// Every known candidate, in display order
    pool: Vec<Candidate>,
    selected: Vec<Candidate>,
    lock: Option<RosterLock>,
}

/// Keep first occurrence order, drop blanks and duplicates
fn dedup(candidates: impl IntoIterator<Item = Candidate>) -> Vec<Candidate> {
    let mut out: Vec<Candidate> = Vec::new();
    for c in candidates {
        if !c.is_empty() && !out.contains(&c) {
            out.push(c);
        }
    }
    out
}

impl RosterCoordinator {
    pub fn new(room: RoomId, identity: Identity, channel: Arc<dyn SharedStateChannel>) -> Self {
        Self {
            room,
            identity,
            channel,
            pool: Vec::new(),
            selected: Vec::new(),
            lock: None,
        }
    }

    /// Replace the set of known candidates (selection is left untouched)
    pub fn set_pool(&mut self, candidates: Vec<Candidate>) {
        self.pool = dedup(candidates);
    }

    pub fn pool(&self) -> &[Candidate] {
        &self.pool
    }

    /// The roster as it should be rendered: frozen entries win while locked
    pub fn selected(&self) -> &[Candidate] {
        match &self.lock {
            Some(lock) => &lock.entries,
            None => &self.selected,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// True while edits must be rejected (UI disables roster controls)
    pub fn is_spinning(&self) -> bool {
        self.lock.as_ref().is_some_and(|l| l.spinning)
    }

    /// Freeze the roster to a session's entries
    pub fn freeze(&mut self, run_id: RunId, entries: Vec<Candidate>) {
        tracing::debug!(%run_id, entries = entries.len(), "Roster frozen");
        self.lock = Some(RosterLock {
            run_id,
            entries,
            spinning: true,
        });
    }

    /// The frozen session landed (or was cancelled); edits are allowed again
    pub fn mark_landed(&mut self, run_id: RunId) {
        if let Some(lock) = self.lock.as_mut().filter(|l| l.run_id == run_id) {
            lock.spinning = false;
        }
    }

    /// Check the spinning guard and drop a finished lock, keeping its entries
    fn begin_edit(&mut self) -> DrawResult<()> {
        if let Some(lock) = &self.lock {
            if lock.spinning {
                return Err(DrawError::AlreadySpinning(lock.run_id));
            }
        }
        if let Some(lock) = self.lock.take() {
            tracing::debug!(run_id = %lock.run_id, "Roster unlocked by edit");
            self.selected = lock.entries;
        }
        Ok(())
    }

    pub async fn toggle(&mut self, candidate: &str) -> DrawResult<()> {
        self.begin_edit()?;
        if let Some(pos) = self.selected.iter().position(|c| c == candidate) {
            self.selected.remove(pos);
        } else if !candidate.is_empty() {
            self.selected.push(candidate.to_string());
            if !self.pool.iter().any(|c| c == candidate) {
                self.pool.push(candidate.to_string());
            }
        }
        self.broadcast().await;
        Ok(())
    }

    pub async fn select_all(&mut self) -> DrawResult<()> {
        self.begin_edit()?;
        self.selected = dedup(self.pool.iter().chain(self.selected.iter()).cloned());
        self.broadcast().await;
        Ok(())
    }

    pub async fn select_none(&mut self) -> DrawResult<()> {
        self.begin_edit()?;
        self.selected.clear();
        self.broadcast().await;
        Ok(())
    }

    /// Apply a roster update from another client unless frozen by a session.
    /// Returns whether the local selection changed.
    pub fn on_remote(&mut self, update: RosterUpdate) -> bool {
        if let Some(lock) = &self.lock {
            tracing::debug!(
                run_id = %lock.run_id,
                from = %update.updated_by,
                "Ignoring remote roster update while frozen"
            );
            return false;
        }
        let selected = dedup(update.selected);
        if selected == self.selected {
            return false;
        }
        for c in &selected {
            if !self.pool.contains(c) {
                self.pool.push(c.clone());
            }
        }
        self.selected = selected;
        true
    }

    /// Publish the local selection durably and on the roster topic.
    /// Failures are logged; the local state already changed.
    async fn broadcast(&self) {
        let update = RosterUpdate {
            selected: self.selected.clone(),
            updated_by: self.identity.clone(),
        };

        match serde_json::to_value(&update) {
            Ok(value) => {
                if let Err(e) = self.channel.write(&keys::roster(&self.room), value).await {
                    tracing::warn!("Roster write failed for room {}: {}", self.room, e);
                }
            }
            Err(e) => tracing::error!("Failed to encode roster: {}", e),
        }
        publish_json(
            self.channel.as_ref(),
            &keys::roster_topic(&self.room),
            &update,
        )
        .await;
    }
}
