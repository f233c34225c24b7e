//! Audio route control
//!
//! Platform audio-session reconfiguration can briefly block on configuration
//! locks, so route requests run on their own worker thread instead of the
//! engine callback context. Requests are best-effort: failures are logged and
//! swallowed, never surfaced to the caller.

use crate::session::SessionError;
use log::{debug, warn};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

/// Platform hook that actually reconfigures the audio route.
///
/// Implemented outside this crate (the platform audio session is an external
/// collaborator).
pub trait AudioRouter: Send + Sync {
    fn route_to_speaker(&self) -> Result<(), SessionError>;
}

enum RouteCommand {
    Speaker,
}

/// Serial worker owning the audio route.
///
/// Dropping the worker closes the queue and lets the thread exit after the
/// in-flight request, if any.
pub struct AudioRouteWorker {
    tx: mpsc::Sender<RouteCommand>,
}

impl AudioRouteWorker {
    pub fn spawn(router: Arc<dyn AudioRouter>) -> Self {
        let (tx, rx) = mpsc::channel::<RouteCommand>();

        thread::spawn(move || {
            while let Ok(command) = rx.recv() {
                match command {
                    RouteCommand::Speaker => {
                        if let Err(e) = router.route_to_speaker() {
                            warn!("Speaker route failed: {}", e);
                        }
                    }
                }
            }
            debug!("Audio route worker stopped");
        });

        Self { tx }
    }

    /// Queue a speaker route request.
    pub fn request_speaker(&self) {
        if self.tx.send(RouteCommand::Speaker).is_err() {
            warn!("Audio route worker is gone, dropping speaker request");
        }
    }
}
