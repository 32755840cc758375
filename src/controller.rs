//! Playback lifecycle controller
//!
//! Two observable states, `Idle` and `Running`. Starting always retires the
//! current session first, so at most one session owns the output at any
//! time. A session ends through exactly one of: an explicit stop, its
//! deadline, the pattern engine reporting it stopped playing, a restart, or
//! the controller being dropped. Every path runs the session's release
//! action, and the action runs only once.
//!
//! Timers are [`ScheduledTask`]s that report back as [`SessionEvent`]s
//! tagged with the session id. Events for a session that is no longer
//! current are ignored, which is what makes a deadline racing a manual stop
//! resolve to a single transition.

use crate::config::StudioConfig;
use crate::error::EvalResult;
use crate::pattern_engine::PatternEngine;
use crate::script::Evaluator;
use crate::snippet::Snippet;
use crate::tone::AudioLibrary;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Execution backend for a snippet
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Imperative calls on the audio library namespace
    #[default]
    Tone,
    /// Code handed to the pattern engine
    Pattern,
}

impl Backend {
    pub fn label(&self) -> &'static str {
        match self {
            Backend::Tone => "tone",
            Backend::Pattern => "pattern",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Backend::Tone => Backend::Pattern,
            Backend::Pattern => Backend::Tone,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tone" | "direct" => Ok(Backend::Tone),
            "pattern" | "strudel" => Ok(Backend::Pattern),
            other => Err(format!(
                "unknown backend '{}' (expected 'tone' or 'pattern')",
                other
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlaybackState {
    #[default]
    Idle,
    Running,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Snapshot published to the presentation shell
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub error: Option<String>,
    pub backend: Option<Backend>,
    pub session: Option<SessionId>,
    pub deadline: Option<Instant>,
}

impl PlaybackStatus {
    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Running
    }

    /// Time left before the deadline stops the session
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// Notifications from a session's scheduled tasks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    DeadlineElapsed(SessionId),
    PlaybackEnded(SessionId),
}

impl SessionEvent {
    pub fn session(&self) -> SessionId {
        match self {
            SessionEvent::DeadlineElapsed(id) | SessionEvent::PlaybackEnded(id) => *id,
        }
    }
}

/// A spawned timer or interval, aborted on cancel or drop
#[derive(Debug)]
pub struct ScheduledTask {
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Run `f` once after `delay`
    pub fn after<F>(delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Run `f` every `period`, starting one period from now, until it
    /// returns false
    pub fn every<F>(period: Duration, mut f: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !f() {
                    break;
                }
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Cleanup that runs at most once; dropping it unrun runs it
pub struct ReleaseAction {
    action: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ReleaseAction {
    pub fn new<F>(action: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            action: Some(Box::new(action)),
        }
    }

    /// Returns true if this call performed the release
    pub fn run(&mut self) -> bool {
        match self.action.take() {
            Some(action) => {
                action();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.action.is_some()
    }
}

impl Drop for ReleaseAction {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for ReleaseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseAction")
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// One run of a snippet and the resources it holds
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    backend: Backend,
    snippet: Snippet,
    started_at: Instant,
    deadline: Instant,
    deadline_task: ScheduledTask,
    poll_task: Option<ScheduledTask>,
    release: ReleaseAction,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn snippet(&self) -> &Snippet {
        &self.snippet
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Cancel timers, then release backend resources. Idempotent.
    fn release(&mut self) -> bool {
        self.deadline_task.cancel();
        if let Some(poll) = self.poll_task.as_mut() {
            poll.cancel();
        }
        self.release.run()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.release() {
            debug!("Session {} released on drop", self.id);
        }
    }
}

/// What a successful launch leaves behind for the session to own
struct Launch {
    release: ReleaseAction,
    poll_task: Option<ScheduledTask>,
}

/// The lifecycle state machine.
///
/// The audio library and pattern engine are injected once and shared with
/// the release actions; nothing here is global.
pub struct PlaybackController<A: AudioLibrary, P: PatternEngine> {
    audio: Arc<A>,
    pattern: Arc<P>,
    evaluator: Evaluator,
    timeout: Duration,
    poll_interval: Duration,
    session: Option<Session>,
    last_id: u64,
    error: Option<String>,
    status_tx: watch::Sender<PlaybackStatus>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl<A: AudioLibrary, P: PatternEngine> PlaybackController<A, P> {
    pub fn new(audio: Arc<A>, pattern: Arc<P>, config: &StudioConfig) -> Self {
        let (status_tx, _) = watch::channel(PlaybackStatus::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            audio,
            pattern,
            evaluator: Evaluator::new(&config.sandbox),
            timeout: config.session.timeout(),
            poll_interval: config.session.poll_interval(),
            session: None,
            last_id: 0,
            error: None,
            status_tx,
            events_tx,
            events_rx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status_tx.borrow().clone()
    }

    pub fn state(&self) -> PlaybackState {
        if self.session.is_some() {
            PlaybackState::Running
        } else {
            PlaybackState::Idle
        }
    }

    pub fn is_playing(&self) -> bool {
        self.session.is_some()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Retire any running session, then evaluate `snippet` on `backend`.
    ///
    /// Blank snippets leave the controller idle without touching either
    /// backend. On failure the controller is idle and the error is published.
    pub async fn start(
        &mut self,
        backend: Backend,
        snippet: impl Into<Snippet>,
    ) -> EvalResult<Option<SessionId>> {
        let snippet = snippet.into();

        self.retire_current("restart");
        self.error = None;
        self.publish();

        if snippet.is_blank() {
            debug!("Blank snippet, nothing to evaluate");
            return Ok(None);
        }

        self.last_id += 1;
        let id = SessionId(self.last_id);

        let launched = match backend {
            Backend::Tone => self.launch_tone(&snippet).await,
            Backend::Pattern => self.launch_pattern(id, &snippet).await,
        };

        match launched {
            Ok(launch) => {
                let events = self.events_tx.clone();
                let deadline_task = ScheduledTask::after(self.timeout, move || {
                    let _ = events.send(SessionEvent::DeadlineElapsed(id));
                });
                let started_at = Instant::now();
                info!(
                    "▶ Session {} started on {} backend: {}",
                    id,
                    backend,
                    snippet.summary(60)
                );
                self.session = Some(Session {
                    id,
                    backend,
                    snippet,
                    started_at,
                    deadline: started_at + self.timeout,
                    deadline_task,
                    poll_task: launch.poll_task,
                    release: launch.release,
                });
                self.publish();
                Ok(Some(id))
            }
            Err(e) => {
                warn!("Evaluation failed ({}): {}", e.kind(), e);
                self.error = Some(e.to_string());
                self.publish();
                Err(e)
            }
        }
    }

    async fn launch_tone(&self, snippet: &Snippet) -> EvalResult<Launch> {
        self.audio.start().await?;

        let program = self
            .evaluator
            .compile(self.audio.binding_name(), snippet.as_str())?;

        if let Err(e) = program.invoke(self.audio.namespace()) {
            // Whatever the snippet scheduled before failing has no session to own it
            self.audio.transport_stop();
            self.audio.transport_cancel();
            return Err(e);
        }

        let audio = Arc::clone(&self.audio);
        Ok(Launch {
            release: ReleaseAction::new(move || {
                audio.transport_stop();
                audio.transport_cancel();
            }),
            poll_task: None,
        })
    }

    async fn launch_pattern(&self, id: SessionId, snippet: &Snippet) -> EvalResult<Launch> {
        self.pattern.init().await?;
        if let Err(e) = self.pattern.evaluate(snippet.as_str()).await {
            // A server that never answered may still have taken the code
            self.pattern.stop();
            return Err(e);
        }

        let engine = Arc::clone(&self.pattern);
        let events = self.events_tx.clone();
        let poll_task = ScheduledTask::every(self.poll_interval, move || {
            if engine.is_playing() {
                true
            } else {
                let _ = events.send(SessionEvent::PlaybackEnded(id));
                false
            }
        });

        let engine = Arc::clone(&self.pattern);
        Ok(Launch {
            release: ReleaseAction::new(move || engine.stop()),
            poll_task: Some(poll_task),
        })
    }

    /// Stop the running session and clear the error. No-op when idle.
    pub fn stop(&mut self) -> bool {
        match self.retire_current("stop") {
            Some(_) => {
                self.error = None;
                self.publish();
                true
            }
            None => {
                debug!("Stop while idle ignored");
                false
            }
        }
    }

    /// Change the pattern tempo in cycles per second. Applies to the running
    /// pattern and to later ones; returns false for a tempo that is not
    /// positive.
    pub fn set_cps(&self, cps: f64) -> bool {
        if !(cps.is_finite() && cps > 0.0) {
            warn!("Ignoring tempo {} cps", cps);
            return false;
        }
        info!("🥁 Tempo set to {:.3} cps", cps);
        self.pattern.set_cps(cps);
        true
    }

    /// Wait for the next timer or poll notification
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }

    /// Apply a timer or poll notification. Returns true if it ended the
    /// current session.
    pub fn handle_event(&mut self, event: SessionEvent) -> bool {
        let current = self.session.as_ref().map(Session::id);
        if current != Some(event.session()) {
            debug!("Ignoring {:?} for retired session", event);
            return false;
        }

        let reason = match event {
            SessionEvent::DeadlineElapsed(_) => "deadline",
            SessionEvent::PlaybackEnded(_) => "playback ended",
        };
        self.retire_current(reason);
        self.publish();
        true
    }

    /// Release any running session and consume the controller
    pub fn shutdown(mut self) {
        if self.retire_current("shutdown").is_some() {
            self.publish();
        }
    }

    fn retire_current(&mut self, reason: &str) -> Option<SessionId> {
        let mut session = self.session.take()?;
        let id = session.id;
        session.release();
        info!(
            "⏹ Session {} retired ({}) after {:.1}s",
            id,
            reason,
            session.started_at.elapsed().as_secs_f64()
        );
        Some(id)
    }

    fn publish(&self) {
        let status = PlaybackStatus {
            state: self.state(),
            error: self.error.clone(),
            backend: self.session.as_ref().map(Session::backend),
            session: self.session.as_ref().map(Session::id),
            deadline: self.session.as_ref().map(Session::deadline),
        };
        self.status_tx.send_replace(status);
    }
}

impl<A: AudioLibrary, P: PatternEngine> Drop for PlaybackController<A, P> {
    fn drop(&mut self) {
        if let Some(id) = self.retire_current("teardown") {
            debug!("Controller dropped with session {} active", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backend_parsing() {
        assert_eq!("tone".parse::<Backend>(), Ok(Backend::Tone));
        assert_eq!("Strudel".parse::<Backend>(), Ok(Backend::Pattern));
        assert!("csound".parse::<Backend>().is_err());
        assert_eq!(Backend::Tone.toggled(), Backend::Pattern);
    }

    #[test]
    fn test_release_action_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut release = ReleaseAction::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(release.run());
        assert!(!release.run());
        drop(release);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_action_runs_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        drop(ReleaseAction::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_task_never_fires() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut task = ScheduledTask::after(Duration::from_secs(1), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(task.is_active());
        task.cancel();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!task.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_task_stops_when_closure_returns_false() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _task = ScheduledTask::every(Duration::from_millis(100), move || {
            c.fetch_add(1, Ordering::SeqCst) < 2
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
