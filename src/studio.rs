//! Async host for the playback controller
//!
//! The controller is owned by one task which handles commands from any
//! number of [`StudioHandle`]s and the controller's own session events, one
//! at a time. Dropping every handle shuts the host down and releases the
//! active session.

use crate::config::StudioConfig;
use crate::controller::{Backend, PlaybackController, PlaybackStatus, SessionId};
use crate::error::{EvalResult, EvaluationError};
use crate::pattern_engine::PatternEngine;
use crate::snippet::Snippet;
use crate::tone::AudioLibrary;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub type EvaluateReply = oneshot::Sender<EvalResult<Option<SessionId>>>;

#[derive(Debug)]
pub enum StudioCommand {
    Evaluate {
        backend: Backend,
        snippet: Snippet,
        reply: Option<EvaluateReply>,
    },
    Stop {
        reply: Option<oneshot::Sender<bool>>,
    },
    /// Pattern tempo in cycles per second
    SetTempo {
        cps: f64,
        reply: Option<oneshot::Sender<bool>>,
    },
    Shutdown,
}

pub struct Studio<A: AudioLibrary, P: PatternEngine> {
    controller: PlaybackController<A, P>,
    commands: mpsc::UnboundedReceiver<StudioCommand>,
}

impl<A: AudioLibrary, P: PatternEngine> Studio<A, P> {
    /// Spawn the host on the current runtime
    pub fn spawn(
        audio: Arc<A>,
        pattern: Arc<P>,
        config: &StudioConfig,
    ) -> (StudioHandle, JoinHandle<()>) {
        let controller = PlaybackController::new(audio, pattern, config);
        let status = controller.subscribe();
        let (commands_tx, commands) = mpsc::unbounded_channel();

        let studio = Studio {
            controller,
            commands,
        };
        let task = tokio::spawn(studio.run());

        let handle = StudioHandle {
            commands: commands_tx,
            status,
            default_backend: config.session.default_backend,
        };
        (handle, task)
    }

    async fn run(mut self) {
        debug!("Studio host started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(StudioCommand::Evaluate { backend, snippet, reply }) => {
                        let result = self.controller.start(backend, snippet).await;
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                    }
                    Some(StudioCommand::Stop { reply }) => {
                        let stopped = self.controller.stop();
                        if let Some(reply) = reply {
                            let _ = reply.send(stopped);
                        }
                    }
                    Some(StudioCommand::SetTempo { cps, reply }) => {
                        let applied = self.controller.set_cps(cps);
                        if let Some(reply) = reply {
                            let _ = reply.send(applied);
                        }
                    }
                    Some(StudioCommand::Shutdown) | None => break,
                },
                Some(event) = self.controller.next_event() => {
                    if self.controller.handle_event(event) {
                        debug!("Session {} ended by {:?}", event.session(), event);
                    }
                }
            }
        }
        self.controller.shutdown();
        info!("Studio host stopped");
    }
}

/// Cloneable front end to a running [`Studio`]
#[derive(Clone, Debug)]
pub struct StudioHandle {
    commands: mpsc::UnboundedSender<StudioCommand>,
    status: watch::Receiver<PlaybackStatus>,
    default_backend: Backend,
}

impl StudioHandle {
    pub fn default_backend(&self) -> Backend {
        self.default_backend
    }

    /// Evaluate on the default backend
    pub async fn evaluate(&self, code: impl Into<Snippet>) -> EvalResult<Option<SessionId>> {
        self.evaluate_with(self.default_backend, code).await
    }

    pub async fn evaluate_with(
        &self,
        backend: Backend,
        code: impl Into<Snippet>,
    ) -> EvalResult<Option<SessionId>> {
        let (reply, response) = oneshot::channel();
        self.send(StudioCommand::Evaluate {
            backend,
            snippet: code.into(),
            reply: Some(reply),
        })?;
        response.await.map_err(|_| host_gone())?
    }

    /// Fire-and-forget evaluation; the outcome shows up in [`Self::status`]
    pub fn request_evaluate(&self, backend: Backend, code: impl Into<Snippet>) -> bool {
        self.send(StudioCommand::Evaluate {
            backend,
            snippet: code.into(),
            reply: None,
        })
        .is_ok()
    }

    /// Returns true if a running session was stopped
    pub async fn stop(&self) -> bool {
        let (reply, response) = oneshot::channel();
        if self.send(StudioCommand::Stop { reply: Some(reply) }).is_err() {
            return false;
        }
        response.await.unwrap_or(false)
    }

    pub fn request_stop(&self) -> bool {
        self.send(StudioCommand::Stop { reply: None }).is_ok()
    }

    /// Set the pattern tempo; false if it was rejected or the host is gone
    pub async fn set_cps(&self, cps: f64) -> bool {
        let (reply, response) = oneshot::channel();
        if self
            .send(StudioCommand::SetTempo {
                cps,
                reply: Some(reply),
            })
            .is_err()
        {
            return false;
        }
        response.await.unwrap_or(false)
    }

    /// Tempo in cycles per minute
    pub async fn set_cpm(&self, cpm: f64) -> bool {
        self.set_cps(cpm / 60.0).await
    }

    pub fn request_cps(&self, cps: f64) -> bool {
        self.send(StudioCommand::SetTempo { cps, reply: None }).is_ok()
    }

    pub fn status(&self) -> watch::Receiver<PlaybackStatus> {
        self.status.clone()
    }

    pub fn current(&self) -> PlaybackStatus {
        self.status.borrow().clone()
    }

    pub fn is_playing(&self) -> bool {
        self.status.borrow().is_playing()
    }

    pub fn error(&self) -> Option<String> {
        self.status.borrow().error.clone()
    }

    /// Resolve once no session is running
    pub async fn wait_idle(&self) {
        let mut status = self.status.clone();
        let _ = status.wait_for(|s| !s.is_playing()).await;
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(StudioCommand::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn send(&self, command: StudioCommand) -> EvalResult<()> {
        self.commands.send(command).map_err(|_| host_gone())
    }
}

fn host_gone() -> EvaluationError {
    EvaluationError::initialization("the studio host is not running")
}
