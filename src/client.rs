//! One replica: wires the roster, draw protocol, replicator, replay loop,
//! persister and scrub controller to a shared state channel.
//!
//! All incoming traffic (durable-key notifications and topic broadcasts) is
//! funnelled through the same handlers, so duplicates from the two paths are
//! filtered by the replicator before they reach the reel.

use crate::channel::{read_json, SharedStateChannel};
use crate::config::DrawConfig;
use crate::draw::DrawCoordinator;
use crate::error::{DrawError, DrawResult};
use crate::frame::{FrameLoop, FRAME_INTERVAL};
use crate::persist::OutcomePersister;
use crate::replay;
use crate::replicator::{IncomingSessionEvent, SessionReplicator};
use crate::roster::RosterCoordinator;
use crate::scrub::{InertialScrubController, PointerEffect, PointerId, ReleaseOutcome};
use crate::types::{
    keys, now_ms, Candidate, DrawEvent, DrawSession, Identity, Layout, RoomId, RoomMeta,
    RosterUpdate, RunId,
};
use serde_json::Value;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// What the UI needs to render one frame
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSnapshot {
    pub offset: f64,
    pub progress: f64,
    pub spinning: bool,
    pub run_id: Option<RunId>,
    pub winner: Option<Candidate>,
    pub roster: Vec<Candidate>,
    pub roster_locked: bool,
    /// A drag or fling currently owns the offset
    pub scrubbing: bool,
}

#[derive(Debug, Clone, Copy)]
enum Feed {
    SessionKey,
    DrawTopic,
    RosterTopic,
}

struct ClientView {
    roster: RosterCoordinator,
    replicator: SessionReplicator,
    scrub: InertialScrubController,
    layout: Layout,
    offset: f64,
    replay: Option<FrameLoop>,
    momentum: Option<FrameLoop>,
}

struct ClientInner {
    room: RoomId,
    identity: Identity,
    channel: Arc<dyn SharedStateChannel>,
    coordinator: DrawCoordinator,
    persister: OutcomePersister,
    view: Mutex<ClientView>,
    listeners: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct DrawClient {
    inner: Arc<ClientInner>,
}

impl DrawClient {
    pub fn new(
        room: impl Into<RoomId>,
        identity: impl Into<Identity>,
        channel: Arc<dyn SharedStateChannel>,
        config: DrawConfig,
    ) -> Self {
        let room = room.into();
        let identity = identity.into();
        let layout = Layout {
            center_offset: 0.0,
            unit_width: config.unit_width,
        };

        let inner = ClientInner {
            room: room.clone(),
            identity: identity.clone(),
            channel: channel.clone(),
            coordinator: DrawCoordinator::new(room.clone(), channel.clone(), config),
            persister: OutcomePersister::new(room.clone(), channel.clone()),
            view: Mutex::new(ClientView {
                roster: RosterCoordinator::new(room, identity, channel),
                replicator: SessionReplicator::new(),
                scrub: InertialScrubController::new(layout.center_offset),
                layout,
                offset: layout.center_offset,
                replay: None,
                momentum: None,
            }),
            listeners: std::sync::Mutex::new(Vec::new()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// Become the room owner if the room has none yet. Returns whether this
    /// client is now the recorded owner.
    pub async fn claim_ownership(&self) -> DrawResult<bool> {
        let meta = RoomMeta {
            owner: self.inner.identity.clone(),
        };
        let value =
            serde_json::to_value(&meta).map_err(|e| DrawError::InvalidSession(e.to_string()))?;
        let claimed = self
            .inner
            .channel
            .compare_and_swap(&keys::meta(&self.inner.room), None, value)
            .await?;
        if claimed {
            tracing::info!(room = %self.inner.room, owner = %meta.owner, "Room ownership claimed");
        }
        Ok(claimed)
    }

    /// Load durable room state, then subscribe to live updates
    pub async fn join(&self) -> DrawResult<()> {
        let inner = &self.inner;

        // Subscribe before reading so nothing written in between is missed
        let session_rx = inner.channel.subscribe_key(&keys::session(&inner.room));
        let draw_rx = inner.channel.subscribe_topic(&keys::draw_topic(&inner.room));
        let roster_rx = inner.channel.subscribe_topic(&keys::roster_topic(&inner.room));

        match read_json::<RosterUpdate>(inner.channel.as_ref(), &keys::roster(&inner.room)).await
        {
            Ok(Some((_, update))) => {
                inner.view.lock().await.roster.on_remote(update);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(room = %inner.room, "Could not load roster: {}", e),
        }
        ClientInner::resync(inner).await;

        let weak = Arc::downgrade(inner);
        let handles = vec![
            spawn_listener(weak.clone(), session_rx, Feed::SessionKey),
            spawn_listener(weak.clone(), draw_rx, Feed::DrawTopic),
            spawn_listener(weak, roster_rx, Feed::RosterTopic),
        ];
        inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(handles);

        tracing::info!(room = %inner.room, identity = %inner.identity, "Joined room");
        Ok(())
    }

    /// Unmount: stop listening and cancel every pending frame
    pub async fn leave(&self) {
        for handle in self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            handle.abort();
        }
        let mut view = self.inner.view.lock().await;
        view.replay = None;
        view.momentum = None;
        view.scrub.cancel();
        tracing::info!(room = %self.inner.room, identity = %self.inner.identity, "Left room");
    }

    pub async fn set_pool(&self, candidates: Vec<Candidate>) {
        self.inner.view.lock().await.roster.set_pool(candidates);
    }

    pub async fn toggle(&self, candidate: &str) -> DrawResult<()> {
        self.inner.view.lock().await.roster.toggle(candidate).await
    }

    pub async fn select_all(&self) -> DrawResult<()> {
        self.inner.view.lock().await.roster.select_all().await
    }

    pub async fn select_none(&self) -> DrawResult<()> {
        self.inner.view.lock().await.roster.select_none().await
    }

    /// Start a draw over the current roster and adopt it locally right away.
    /// The view stays unlocked while the store round trips are in flight.
    pub async fn start_draw(&self) -> DrawResult<DrawSession> {
        let inner = &self.inner;
        let candidates = {
            let view = inner.view.lock().await;
            if view.replicator.is_spinning() {
                if let Some(run_id) = view.replicator.active_run_id() {
                    return Err(DrawError::AlreadySpinning(run_id));
                }
            }
            view.roster.selected().to_vec()
        };

        let session = match inner
            .coordinator
            .start_draw(&candidates, &inner.identity)
            .await
        {
            Ok(session) => session,
            Err(DrawError::EmptyRoster) => {
                tracing::debug!(room = %inner.room, "Draw requested with empty roster");
                return Err(DrawError::EmptyRoster);
            }
            Err(e) => return Err(e),
        };

        // Optimistic local echo; a round-trip copy that got here first makes this stale
        let mut view = inner.view.lock().await;
        ClientInner::apply_session(inner, &mut view, session.clone());
        Ok(session)
    }

    pub async fn cancel_draw(&self) -> DrawResult<Option<DrawSession>> {
        let cancelled = self
            .inner
            .coordinator
            .cancel_draw(&self.inner.identity)
            .await?;
        if let Some(session) = &cancelled {
            let mut view = self.inner.view.lock().await;
            ClientInner::apply_session(&self.inner, &mut view, session.clone());
        }
        Ok(cancelled)
    }

    /// Update the local layout; takes effect on the next tick
    pub async fn set_layout(&self, layout: Layout) {
        let mut view = self.inner.view.lock().await;
        view.layout = layout;
        if !view.replicator.is_spinning() {
            if let Some(session) = view.replicator.active().cloned() {
                let offset = replay::terminal_offset(&session, layout);
                view.offset = offset;
                view.scrub.set_offset(offset);
            }
        }
    }

    pub async fn snapshot(&self) -> ClientSnapshot {
        let view = self.inner.view.lock().await;
        let state = view.replicator.state();
        ClientSnapshot {
            offset: view.offset,
            progress: state.progress,
            spinning: view.replicator.is_spinning(),
            run_id: view.replicator.active_run_id(),
            winner: state.terminal.as_ref().and_then(|t| t.winner.clone()),
            roster: view.roster.selected().to_vec(),
            roster_locked: view.roster.is_locked(),
            scrubbing: view.scrub.is_dragging() || view.scrub.is_coasting(),
        }
    }

    /// Pointer down on the reel; ignored while a draw owns the offset
    pub async fn press_start(&self, pointer_id: PointerId, x: f64) {
        let mut view = self.inner.view.lock().await;
        if view.replicator.is_spinning() {
            return;
        }
        view.momentum = None;
        view.scrub.on_press_start(pointer_id, x, now_ms());
    }

    pub async fn pointer_move(&self, pointer_id: PointerId, x: f64) -> PointerEffect {
        let mut view = self.inner.view.lock().await;
        let effect = view.scrub.on_move(pointer_id, x, now_ms());
        if effect != PointerEffect::PassThrough {
            view.offset = view.scrub.offset();
        }
        effect
    }

    pub async fn release(&self, pointer_id: PointerId) -> ReleaseOutcome {
        let mut view = self.inner.view.lock().await;
        let outcome = view.scrub.on_release(pointer_id);
        if outcome == ReleaseOutcome::Fling {
            view.momentum = Some(spawn_momentum(Arc::downgrade(&self.inner)));
        }
        outcome
    }

    /// Window lost focus: stop any drag or fling
    pub async fn blur(&self) {
        let mut view = self.inner.view.lock().await;
        view.momentum = None;
        view.scrub.cancel();
    }
}

impl ClientInner {
    /// Re-read the durable session (after join or a lagged subscription)
    async fn resync(inner: &Arc<Self>) {
        if !inner.persister.reconcile().await {
            tracing::debug!(room = %inner.room, "Winner commit still pending");
        }
        match read_json::<DrawSession>(inner.channel.as_ref(), &keys::session(&inner.room)).await {
            Ok(Some((_, session))) => {
                let mut view = inner.view.lock().await;
                Self::apply_session(inner, &mut view, session);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(room = %inner.room, "Could not load session: {}", e),
        }
    }

    async fn on_feed(inner: &Arc<Self>, feed: Feed, value: Value) {
        match feed {
            Feed::SessionKey => match serde_json::from_value::<DrawSession>(value) {
                Ok(session) => {
                    let mut view = inner.view.lock().await;
                    Self::apply_session(inner, &mut view, session);
                }
                Err(e) => tracing::warn!("Undecodable session record: {}", e),
            },
            Feed::DrawTopic => match serde_json::from_value::<DrawEvent>(value) {
                Ok(event) => {
                    let mut view = inner.view.lock().await;
                    Self::apply_draw_event(inner, &mut view, event);
                }
                Err(e) => tracing::debug!("Ignoring unknown draw event: {}", e),
            },
            Feed::RosterTopic => match serde_json::from_value::<RosterUpdate>(value) {
                Ok(update) => {
                    inner.view.lock().await.roster.on_remote(update);
                }
                Err(e) => tracing::debug!("Ignoring unknown roster message: {}", e),
            },
        }
    }

    fn apply_draw_event(inner: &Arc<Self>, view: &mut ClientView, event: DrawEvent) {
        let outcome = match event {
            DrawEvent::Started { session } => view.replicator.on_incoming(session),
            DrawEvent::Result { run_id, winner } => view.replicator.on_result(run_id, winner),
            DrawEvent::Cancelled { run_id } => view.replicator.on_cancelled(run_id),
        };
        Self::react(inner, view, outcome);
    }

    fn apply_session(inner: &Arc<Self>, view: &mut ClientView, session: DrawSession) {
        let outcome = view.replicator.on_incoming(session);
        Self::react(inner, view, outcome);
    }

    fn react(inner: &Arc<Self>, view: &mut ClientView, event: IncomingSessionEvent) {
        match event {
            IncomingSessionEvent::Fresh(session) => {
                // The session takes the reel: stop local scrubbing first
                view.momentum = None;
                view.scrub.cancel();
                view.roster.freeze(session.run_id, session.entries.clone());
                view.replay = Some(spawn_replay(Arc::downgrade(inner), session.run_id));
            }
            IncomingSessionEvent::ResultOnly(session) => {
                view.replay = None;
                view.momentum = None;
                view.scrub.cancel();
                view.roster.freeze(session.run_id, session.entries.clone());
                view.roster.mark_landed(session.run_id);
                let offset = if session.cancelled {
                    view.layout.center_offset
                } else {
                    replay::terminal_offset(&session, view.layout)
                };
                view.offset = offset;
                view.scrub.set_offset(offset);
            }
            IncomingSessionEvent::Stale => {}
        }
    }

    /// One replay frame for `run_id`
    async fn replay_frame(inner: &Arc<Self>, run_id: RunId) -> ControlFlow<()> {
        let finished = {
            let mut view = inner.view.lock().await;
            let Some(session) = view
                .replicator
                .active()
                .filter(|s| s.run_id == run_id)
                .cloned()
            else {
                return ControlFlow::Break(());
            };
            if !view.replicator.is_spinning() {
                return ControlFlow::Break(());
            }

            let frame = replay::tick(&session, now_ms(), view.layout);
            view.offset = frame.offset;
            view.replicator.record_progress(run_id, frame.progress);
            if !frame.is_terminal() {
                return ControlFlow::Continue(());
            }

            let Some(finished) = view.replicator.land(run_id) else {
                return ControlFlow::Break(());
            };
            view.roster.mark_landed(run_id);
            view.scrub.set_offset(frame.offset);
            finished
        };

        // Unmounting stops the frames but must not abort a commit in flight
        let inner = inner.clone();
        tokio::spawn(async move {
            let outcome = inner.persister.finish(&finished).await;
            tracing::debug!(%run_id, ?outcome, "Finish reported");
        });
        ControlFlow::Break(())
    }

    async fn momentum_frame(inner: &Arc<Self>) -> ControlFlow<()> {
        let mut view = inner.view.lock().await;
        let moving = view.scrub.step();
        view.offset = view.scrub.offset();
        if moving {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    }
}

fn spawn_replay(weak: Weak<ClientInner>, run_id: RunId) -> FrameLoop {
    FrameLoop::spawn(FRAME_INTERVAL, move || {
        let weak = weak.clone();
        async move {
            match weak.upgrade() {
                Some(inner) => ClientInner::replay_frame(&inner, run_id).await,
                None => ControlFlow::Break(()),
            }
        }
    })
}

fn spawn_momentum(weak: Weak<ClientInner>) -> FrameLoop {
    FrameLoop::spawn(FRAME_INTERVAL, move || {
        let weak = weak.clone();
        async move {
            match weak.upgrade() {
                Some(inner) => ClientInner::momentum_frame(&inner).await,
                None => ControlFlow::Break(()),
            }
        }
    })
}

fn spawn_listener(
    weak: Weak<ClientInner>,
    mut rx: broadcast::Receiver<Value>,
    feed: Feed,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(value) => {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    ClientInner::on_feed(&inner, feed, value).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(?feed, skipped, "Subscription lagged, resyncing");
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    ClientInner::resync(&inner).await;
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
