//! Per-client reconciliation of incoming draw sessions.
//!
//! The same logical event usually arrives twice (durable-key notification
//! and topic broadcast) and transports may redeliver, so every observation
//! is classified once here before it can touch replay state.

use crate::types::{Candidate, DrawSession, RunId};

/// Classification of an observed session
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingSessionEvent {
    /// Newer run that is still spinning: adopt it and start replay
    Fresh(DrawSession),
    /// Terminal state for the active run, or for a newer run whose start
    /// was missed: jump straight to the terminal pose
    ResultOnly(DrawSession),
    /// Older run, duplicate delivery, or malformed payload
    Stale,
}

/// Where a session came to rest on this replica
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalPose {
    pub run_id: RunId,
    pub target_index: usize,
    /// None when the draw was cancelled
    pub winner: Option<Candidate>,
}

/// Ephemeral, derived replay state of one client. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayState {
    pub active: Option<DrawSession>,
    pub progress: f64,
    /// Roster snapshot frozen from the active session
    pub locked_entries: Vec<Candidate>,
    pub terminal: Option<TerminalPose>,
}

#[derive(Debug, Default)]
pub struct SessionReplicator {
    state: ReplayState,
}

impl SessionReplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ReplayState {
        &self.state
    }

    pub fn active(&self) -> Option<&DrawSession> {
        self.state.active.as_ref()
    }

    pub fn active_run_id(&self) -> Option<RunId> {
        self.state.active.as_ref().map(|s| s.run_id)
    }

    /// True while the active session is adopted but has not landed
    pub fn is_spinning(&self) -> bool {
        self.state.active.is_some() && self.state.terminal.is_none()
    }

    /// Classify without changing state
    pub fn classify(&self, incoming: &DrawSession) -> IncomingSessionEvent {
        if let Err(e) = incoming.validate() {
            tracing::warn!(run_id = %incoming.run_id, "Dropping malformed session: {}", e);
            return IncomingSessionEvent::Stale;
        }

        let Some(current) = &self.state.active else {
            return Self::adopt(incoming);
        };

        if incoming.run_id > current.run_id {
            Self::adopt(incoming)
        } else if incoming.run_id == current.run_id
            && self.state.terminal.is_none()
            && !incoming.is_spinning
        {
            IncomingSessionEvent::ResultOnly(incoming.clone())
        } else {
            IncomingSessionEvent::Stale
        }
    }

    fn adopt(incoming: &DrawSession) -> IncomingSessionEvent {
        if incoming.is_spinning {
            IncomingSessionEvent::Fresh(incoming.clone())
        } else {
            IncomingSessionEvent::ResultOnly(incoming.clone())
        }
    }

    /// Classify and apply an observed session
    pub fn on_incoming(&mut self, incoming: DrawSession) -> IncomingSessionEvent {
        let event = self.classify(&incoming);
        match &event {
            IncomingSessionEvent::Fresh(session) => {
                tracing::info!(run_id = %session.run_id, "Adopted draw session");
                self.state = ReplayState {
                    active: Some(session.clone()),
                    progress: 0.0,
                    locked_entries: session.entries.clone(),
                    terminal: None,
                };
            }
            IncomingSessionEvent::ResultOnly(session) => {
                tracing::info!(
                    run_id = %session.run_id,
                    cancelled = session.cancelled,
                    "Snapping to terminal pose"
                );
                self.state = ReplayState {
                    active: Some(session.clone()),
                    progress: 1.0,
                    locked_entries: session.entries.clone(),
                    terminal: Some(Self::pose(session)),
                };
            }
            IncomingSessionEvent::Stale => {
                tracing::debug!(run_id = %incoming.run_id, "Ignoring stale session event");
            }
        }
        event
    }

    /// A `(run_id, winner)` result broadcast, applied to the active session
    pub fn on_result(&mut self, run_id: RunId, winner: Candidate) -> IncomingSessionEvent {
        match self.state.active.as_ref().filter(|s| s.run_id == run_id) {
            Some(active) => {
                let finished = DrawSession {
                    is_spinning: false,
                    winner: Some(winner),
                    ..active.clone()
                };
                self.on_incoming(finished)
            }
            None => {
                // Without the session we cannot render it; the durable read covers this
                tracing::debug!(%run_id, "Result for unknown run ignored");
                IncomingSessionEvent::Stale
            }
        }
    }

    /// The owner aborted `run_id`
    pub fn on_cancelled(&mut self, run_id: RunId) -> IncomingSessionEvent {
        match self.state.active.as_ref().filter(|s| s.run_id == run_id) {
            Some(active) => {
                let cancelled = DrawSession {
                    is_spinning: false,
                    cancelled: true,
                    winner: None,
                    ..active.clone()
                };
                self.on_incoming(cancelled)
            }
            None => IncomingSessionEvent::Stale,
        }
    }

    /// Record replay progress for the active run
    pub fn record_progress(&mut self, run_id: RunId, progress: f64) {
        if self.active_run_id() == Some(run_id) && self.state.terminal.is_none() {
            self.state.progress = progress;
        }
    }

    /// Local replay of `run_id` reached progress 1. Returns the finished
    /// session (with the locally derived winner) the first time only.
    pub fn land(&mut self, run_id: RunId) -> Option<DrawSession> {
        if self.state.terminal.is_some() {
            return None;
        }
        let active = self.state.active.as_ref().filter(|s| s.run_id == run_id)?;
        let finished = active.finished();
        self.state.progress = 1.0;
        self.state.terminal = Some(Self::pose(&finished));
        tracing::info!(
            %run_id,
            winner = ?finished.winner,
            "Draw landed"
        );
        Some(finished)
    }

    fn pose(session: &DrawSession) -> TerminalPose {
        TerminalPose {
            run_id: session.run_id,
            target_index: session.target_index,
            winner: if session.cancelled {
                None
            } else {
                session.target().cloned()
            },
        }
    }
}
