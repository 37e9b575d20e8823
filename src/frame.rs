//! Cancellable per-frame loop.
//!
//! Replaces a platform animation callback: the body runs on a fixed interval
//! until it returns `ControlFlow::Break` or the loop is cancelled. Dropping
//! the handle cancels the loop.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default frame interval (~60 fps)
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

pub struct FrameLoop {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl FrameLoop {
    pub fn spawn<F, Fut>(interval: Duration, mut on_frame: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Throttled/backgrounded runtimes skip frames instead of bursting
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            while flag.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !flag.load(Ordering::SeqCst) {
                    break;
                }
                if on_frame().await.is_break() {
                    break;
                }
            }
            flag.store(false, Ordering::SeqCst);
        });

        Self { running, handle }
    }

    /// Stop the loop; no frame body starts after this returns
    pub fn cancel(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.handle.is_finished()
    }
}

impl Drop for FrameLoop {
    fn drop(&mut self) {
        self.cancel();
    }
}
