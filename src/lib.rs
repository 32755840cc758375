//! # Phonon Studio - live coding host
//!
//! Phonon Studio evaluates short music snippets on one of two backends and
//! manages the lifetime of whatever they start playing.
//!
//! ## Backends
//!
//! - **Tone**: the snippet is a sequence of calls on a Tone-style audio
//!   namespace (`Tone.Synth`, `triggerAttackRelease`, `Tone.Transport`).
//!   It runs in a small sandboxed interpreter; scheduled notes are sent as
//!   `/dirt/play` OSC messages to a synthesis server such as SuperDirt.
//! - **Pattern**: the snippet is handed verbatim to an external pattern
//!   engine over OSC (`/eval`, `/hush`, `/cps`), which may acknowledge it
//!   and report when playback ends.
//!
//! ## Lifecycle
//!
//! The [`controller::PlaybackController`] is a two-state machine (`Idle`,
//! `Running`). Every evaluation retires the previous session first, every
//! session has a deadline, and every session's release action runs exactly
//! once no matter which path ends it.
//!
//! ```no_run
//! use phonon_studio::config::StudioConfig;
//! use phonon_studio::pattern_engine::OscPatternEngine;
//! use phonon_studio::studio::Studio;
//! use phonon_studio::tone::ToneLibrary;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StudioConfig::default();
//! let audio = Arc::new(ToneLibrary::new(config.tone.clone()));
//! let pattern = Arc::new(OscPatternEngine::new(config.pattern.clone()));
//! let (studio, host) = Studio::spawn(audio, pattern, &config);
//!
//! studio
//!     .evaluate("const synth = new Tone.Synth().toDestination();\nsynth.triggerAttackRelease('C4', '8n');")
//!     .await?;
//! studio.wait_idle().await;
//!
//! studio.shutdown();
//! host.await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Front ends
//!
//! - [`editor`]: terminal editor with an example browser and console
//! - [`live`]: re-evaluates a file whenever it is saved

pub mod catalog;
pub mod config;
pub mod controller;
pub mod editor;
pub mod error;
pub mod live;
pub mod pattern_engine;
pub mod script;
pub mod snippet;
pub mod studio;
pub mod tone;

pub use config::StudioConfig;
pub use controller::{Backend, PlaybackController, PlaybackState, PlaybackStatus, SessionId};
pub use error::{ConfigError, EvalResult, EvaluationError};
pub use snippet::Snippet;
pub use studio::{Studio, StudioHandle};
