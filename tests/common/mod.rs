//! Recording stand-ins for the audio library and pattern engine

#![allow(dead_code)]

use phonon_studio::config::StudioConfig;
use phonon_studio::error::{EvalResult, EvaluationError};
use phonon_studio::pattern_engine::PatternEngine;
use phonon_studio::script::{HostRef, Namespace, Value};
use phonon_studio::tone::AudioLibrary;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Audio library bound as `Audio`. `Audio.fail()` raises, everything else
/// is recorded.
#[derive(Default)]
pub struct FakeAudio {
    pub unlocks: AtomicUsize,
    pub stops: AtomicUsize,
    pub cancels: AtomicUsize,
    pub fail_unlock: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl FakeAudio {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn unlocks(&self) -> usize {
        self.unlocks.load(Ordering::SeqCst)
    }
}

impl Namespace for FakeAudio {
    fn root(&self) -> HostRef {
        HostRef::new("Audio", 0)
    }

    fn get(&self, target: &HostRef, property: &str) -> Result<Value, String> {
        Err(format!("{}.{} is undefined", target.class, property))
    }

    fn call(&self, _target: &HostRef, method: &str, args: &[Value]) -> Result<Value, String> {
        if method == "fail" {
            return Err("device unplugged".to_string());
        }
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}({})", method, args.join(", ")));
        Ok(Value::Undefined)
    }

    fn construct(&self, _target: &HostRef, class: &str, _args: &[Value]) -> Result<Value, String> {
        Ok(Value::Host(HostRef::new(class, 1)))
    }
}

impl AudioLibrary for FakeAudio {
    async fn start(&self) -> EvalResult<()> {
        if self.fail_unlock.load(Ordering::SeqCst) {
            return Err(EvaluationError::initialization("no output device"));
        }
        self.unlocks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn binding_name(&self) -> &str {
        "Audio"
    }

    fn namespace(&self) -> &dyn Namespace {
        self
    }

    fn transport_stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn transport_cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// Pattern engine that plays whatever it is given until told otherwise
#[derive(Default)]
pub struct FakeEngine {
    pub playing: AtomicBool,
    pub inits: AtomicUsize,
    pub stops: AtomicUsize,
    pub reject: Mutex<Option<String>>,
    evaluated: Mutex<Vec<String>>,
    tempos: Mutex<Vec<f64>>,
}

impl FakeEngine {
    pub fn evaluated(&self) -> Vec<String> {
        self.evaluated.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn tempos(&self) -> Vec<f64> {
        self.tempos.lock().unwrap().clone()
    }

    /// Simulate the engine finishing on its own
    pub fn finish(&self) {
        self.playing.store(false, Ordering::SeqCst);
    }
}

impl PatternEngine for FakeEngine {
    async fn init(&self) -> EvalResult<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn evaluate(&self, code: &str) -> EvalResult<()> {
        if let Some(message) = self.reject.lock().unwrap().clone() {
            return Err(EvaluationError::runtime(message));
        }
        self.evaluated.lock().unwrap().push(code.to_string());
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn set_cps(&self, cps: f64) {
        self.tempos.lock().unwrap().push(cps);
    }
}

/// Five second deadline, 50ms pattern polling
pub fn test_config() -> StudioConfig {
    let mut config = StudioConfig::default();
    config.session.timeout_secs = 5.0;
    config.session.poll_interval_ms = 50;
    config
}
