//! Tone-style audio library backed by an OSC synthesis server
//!
//! Snippets build instruments and trigger notes through the namespace; each
//! note becomes a `/dirt/play` message held by a dispatcher task until it is
//! due. Nothing is synthesised in-process.

use crate::config::{parse_addr, ToneConfig};
use crate::error::{EvalResult, EvaluationError};
use crate::script::{HostRef, Namespace, Value};
use rosc::{OscMessage, OscPacket, OscType};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The direct backend as seen by the playback controller
pub trait AudioLibrary: Send + Sync + 'static {
    /// Unlock the audio output. Later calls are no-ops.
    fn start(&self) -> impl Future<Output = EvalResult<()>> + Send;

    /// Identifier the namespace is bound to inside snippets
    fn binding_name(&self) -> &str;

    fn namespace(&self) -> &dyn Namespace;

    /// Stop the global transport
    fn transport_stop(&self);

    /// Drop every scheduled event
    fn transport_cancel(&self);
}

const TRANSPORT: &str = "Transport";
const CONSTRUCTOR: &str = "Constructor";

/// How far ahead of the library clock a note may be scheduled, in seconds
const MAX_LOOKAHEAD: f64 = 3600.0;

/// A single note for the synthesis server
#[derive(Debug, Clone, PartialEq)]
pub struct NoteEvent {
    pub synth: String,
    pub midinote: f64,
    pub sustain: f64,
    pub gain: f64,
    pub orbit: i32,
}

impl NoteEvent {
    pub fn to_osc(&self) -> OscMessage {
        OscMessage {
            addr: "/dirt/play".to_string(),
            args: vec![
                OscType::String("s".to_string()),
                OscType::String(self.synth.clone()),
                OscType::String("midinote".to_string()),
                OscType::Float(self.midinote as f32),
                OscType::String("sustain".to_string()),
                OscType::Float(self.sustain as f32),
                OscType::String("gain".to_string()),
                OscType::Float(self.gain as f32),
                OscType::String("orbit".to_string()),
                OscType::Int(self.orbit),
            ],
        }
    }
}

struct Scheduled {
    due: Instant,
    seq: u64,
    note: NoteEvent,
}

// Min-heap on (due, seq)
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

/// Pending notes shared between the namespace and the dispatcher
#[derive(Default)]
struct NoteQueue {
    events: Mutex<BinaryHeap<Scheduled>>,
    wake: Notify,
    seq: AtomicU64,
}

impl NoteQueue {
    fn lock(&self) -> MutexGuard<'_, BinaryHeap<Scheduled>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, due: Instant, note: NoteEvent) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.lock().push(Scheduled { due, seq, note });
        self.wake.notify_one();
    }

    fn clear(&self) -> usize {
        let mut events = self.lock();
        let dropped = events.len();
        events.clear();
        drop(events);
        self.wake.notify_one();
        dropped
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn next_due(&self) -> Option<Instant> {
        self.lock().peek().map(|s| s.due)
    }

    fn take_due(&self, now: Instant) -> Vec<NoteEvent> {
        let mut events = self.lock();
        let mut due = Vec::new();
        while events.peek().map_or(false, |s| s.due <= now) {
            if let Some(s) = events.pop() {
                due.push(s.note);
            }
        }
        due
    }
}

async fn dispatch(queue: Arc<NoteQueue>, socket: UdpSocket, target: SocketAddr) {
    loop {
        match queue.next_due() {
            Some(due) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(due) => {}
                    _ = queue.wake.notified() => continue,
                }
            }
            None => {
                queue.wake.notified().await;
                continue;
            }
        }

        for note in queue.take_due(Instant::now()) {
            let packet = OscPacket::Message(note.to_osc());
            match rosc::encoder::encode(&packet) {
                Ok(buf) => {
                    if let Err(e) = socket.send_to(&buf, target).await {
                        warn!("Failed to send /dirt/play to {}: {}", target, e);
                    }
                }
                Err(e) => warn!("Failed to encode note {:?}: {}", note, e),
            }
        }
    }
}

/// Unlocked output: clock origin plus the dispatcher feeding the server
struct Output {
    origin: Instant,
    target: SocketAddr,
    dispatcher: JoinHandle<()>,
}

impl Drop for Output {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

struct Instrument {
    class: String,
    synth: String,
    disposed: bool,
}

#[derive(Default)]
struct Objects {
    instruments: HashMap<u64, Instrument>,
    last_id: u64,
}

enum Target<'a> {
    Root,
    Transport,
    Constructor(&'a str),
    Instrument,
    /// A constructor handle this library never handed out
    Unknown,
}

/// OSC-backed implementation of the `Tone` namespace
pub struct ToneLibrary {
    config: ToneConfig,
    classes: Vec<String>,
    queue: Arc<NoteQueue>,
    output: OnceCell<Output>,
    objects: Mutex<Objects>,
}

impl ToneLibrary {
    pub fn new(config: ToneConfig) -> Self {
        let classes = config.instruments.keys().cloned().collect();
        Self {
            config,
            classes,
            queue: Arc::new(NoteQueue::default()),
            output: OnceCell::new(),
            objects: Mutex::new(Objects::default()),
        }
    }

    pub fn config(&self) -> &ToneConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.output.initialized()
    }

    /// Seconds on the library clock, zero before unlock
    pub fn now(&self) -> f64 {
        self.output
            .get()
            .map_or(0.0, |o| o.origin.elapsed().as_secs_f64())
    }

    /// Notes waiting for their due time
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// Instruments created and not yet disposed
    pub fn live_instruments(&self) -> usize {
        self.objects()
            .instruments
            .values()
            .filter(|i| !i.disposed)
            .count()
    }

    /// Schedule a note `at` seconds on the library clock
    pub fn schedule(&self, at: f64, note: NoteEvent) -> Result<(), String> {
        let output = self
            .output
            .get()
            .ok_or_else(|| "The audio context has not been started".to_string())?;
        let ahead = at - output.origin.elapsed().as_secs_f64();
        if !at.is_finite() || ahead > MAX_LOOKAHEAD {
            return Err(format!(
                "Time {}s is out of range (at most {}s ahead)",
                at, MAX_LOOKAHEAD
            ));
        }
        let due = output
            .origin
            .checked_add(Duration::from_secs_f64(at.max(0.0)))
            .ok_or_else(|| format!("Time {}s is out of range", at))?;
        debug!("Scheduling {} note {:.2} at {:.3}s", note.synth, note.midinote, at);
        self.queue.push(due, note);
        Ok(())
    }

    fn objects(&self) -> MutexGuard<'_, Objects> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resolve<'a>(&'a self, host: &HostRef) -> Target<'a> {
        match &*host.class {
            TRANSPORT => Target::Transport,
            CONSTRUCTOR => match self.classes.get(host.id as usize) {
                Some(name) => Target::Constructor(name.as_str()),
                None => Target::Unknown,
            },
            _ if host.id == 0 => Target::Root,
            _ => Target::Instrument,
        }
    }

    fn constructor_ref(&self, class: &str) -> Option<Value> {
        self.classes
            .iter()
            .position(|c| c == class)
            .map(|i| Value::Host(HostRef::new(CONSTRUCTOR, i as u64)))
    }

    fn create_instrument(&self, class: &str, args: &[Value]) -> Result<Value, String> {
        let default_synth = self
            .config
            .instruments
            .get(class)
            .ok_or_else(|| format!("{}.{} is not a constructor", self.config.binding, class))?;

        // new Tone.PolySynth(Tone.FMSynth) plays the voice's synth
        let synth = match args.first().and_then(Value::as_host) {
            Some(voice) if class == "PolySynth" => match self.resolve(voice) {
                Target::Constructor(name) => self
                    .config
                    .instruments
                    .get(name)
                    .unwrap_or(default_synth)
                    .clone(),
                _ => default_synth.clone(),
            },
            _ => default_synth.clone(),
        };

        let mut objects = self.objects();
        objects.last_id += 1;
        let id = objects.last_id;
        objects.instruments.insert(
            id,
            Instrument {
                class: class.to_string(),
                synth,
                disposed: false,
            },
        );
        debug!("Created {} #{}", class, id);
        Ok(Value::Host(HostRef::new(class, id)))
    }

    fn call_root(&self, method: &str) -> Result<Value, String> {
        match method {
            "now" | "immediate" => Ok(Value::Number(self.now())),
            "start" => Ok(Value::Undefined),
            "getTransport" => Ok(Value::Host(HostRef::new(TRANSPORT, 0))),
            _ if self.config.instruments.contains_key(method) => Err(format!(
                "Class constructor {} cannot be invoked without 'new'",
                method
            )),
            _ => Err(format!(
                "{}.{} is not a function",
                self.config.binding, method
            )),
        }
    }

    fn call_transport(&self, method: &str) -> Result<Value, String> {
        match method {
            "start" => Ok(Value::Undefined),
            "stop" => {
                self.transport_stop();
                Ok(Value::Undefined)
            }
            "cancel" => {
                self.transport_cancel();
                Ok(Value::Undefined)
            }
            _ => Err(format!("Transport.{} is not a function", method)),
        }
    }

    fn call_instrument(&self, host: &HostRef, method: &str, args: &[Value]) -> Result<Value, String> {
        let (class, synth) = {
            let objects = self.objects();
            let instrument = objects
                .instruments
                .get(&host.id)
                .ok_or_else(|| format!("{}.{} is not a function", host.class, method))?;
            if instrument.disposed && method != "dispose" {
                return Err(format!("{} has been disposed", instrument.class));
            }
            (instrument.class.clone(), instrument.synth.clone())
        };

        match method {
            "toDestination" | "toMaster" | "connect" | "chain" => Ok(Value::Host(host.clone())),
            "triggerAttackRelease" => {
                self.trigger(&class, &synth, args)?;
                Ok(Value::Host(host.clone()))
            }
            "dispose" => {
                if let Some(instrument) = self.objects().instruments.get_mut(&host.id) {
                    instrument.disposed = true;
                }
                Ok(Value::Host(host.clone()))
            }
            _ => Err(format!("{}.{} is not a function", class, method)),
        }
    }

    fn trigger(&self, class: &str, synth: &str, args: &[Value]) -> Result<(), String> {
        let notes = match args.first() {
            Some(Value::Array(items)) => items
                .iter()
                .map(parse_note)
                .collect::<Result<Vec<_>, _>>()?,
            Some(value) => vec![parse_note(value)?],
            None => {
                return Err(format!(
                    "{}.triggerAttackRelease requires a note and a duration",
                    class
                ))
            }
        };
        let sustain = match args.get(1) {
            Some(value) => parse_duration(value, self.config.bpm)?,
            None => {
                return Err(format!(
                    "{}.triggerAttackRelease requires a note and a duration",
                    class
                ))
            }
        };
        let at = parse_time(args.get(2), self.now(), self.config.bpm)?;
        let gain = match args.get(3) {
            None | Some(Value::Undefined) => 1.0,
            Some(value) => value.to_number(),
        };
        if !gain.is_finite() {
            return Err(format!("Invalid velocity '{}'", args[3]));
        }

        for midinote in notes {
            self.schedule(
                at,
                NoteEvent {
                    synth: synth.to_string(),
                    midinote,
                    sustain,
                    gain: gain.clamp(0.0, 1.0),
                    orbit: self.config.orbit,
                },
            )?;
        }
        Ok(())
    }
}

impl AudioLibrary for ToneLibrary {
    async fn start(&self) -> EvalResult<()> {
        self.output
            .get_or_try_init(|| async {
                let target = parse_addr("tone.target", &self.config.target)
                    .map_err(|e| EvaluationError::initialization(e.to_string()))?;
                let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let socket = UdpSocket::bind(bind).await.map_err(|e| {
                    EvaluationError::initialization(format!("cannot open OSC socket: {}", e))
                })?;
                let dispatcher = tokio::spawn(dispatch(Arc::clone(&self.queue), socket, target));
                info!("🔊 Audio output ready, sending to {}", target);
                Ok::<_, EvaluationError>(Output {
                    origin: Instant::now(),
                    target,
                    dispatcher,
                })
            })
            .await
            .map(|output| debug!("Audio output active on {}", output.target))
    }

    fn binding_name(&self) -> &str {
        &self.config.binding
    }

    fn namespace(&self) -> &dyn Namespace {
        self
    }

    fn transport_stop(&self) {
        let dropped = self.queue.clear();
        if dropped > 0 {
            debug!("Transport stopped, {} pending notes dropped", dropped);
        }
    }

    fn transport_cancel(&self) {
        let dropped = self.queue.clear();
        if dropped > 0 {
            debug!("Transport cancelled {} pending notes", dropped);
        }
    }
}

impl Namespace for ToneLibrary {
    fn root(&self) -> HostRef {
        HostRef::new(self.config.binding.as_str(), 0)
    }

    fn get(&self, target: &HostRef, property: &str) -> Result<Value, String> {
        match self.resolve(target) {
            Target::Root => match property {
                TRANSPORT => Ok(Value::Host(HostRef::new(TRANSPORT, 0))),
                _ => Ok(self.constructor_ref(property).unwrap_or(Value::Undefined)),
            },
            Target::Transport => match property {
                "bpm" => Ok(Value::Number(self.config.bpm)),
                "seconds" => Ok(Value::Number(self.now())),
                _ => Ok(Value::Undefined),
            },
            Target::Constructor(_) | Target::Instrument | Target::Unknown => Ok(Value::Undefined),
        }
    }

    fn call(&self, target: &HostRef, method: &str, args: &[Value]) -> Result<Value, String> {
        match self.resolve(target) {
            Target::Root => self.call_root(method),
            Target::Transport => self.call_transport(method),
            Target::Constructor(name) => Err(format!("{}.{} is not a function", name, method)),
            Target::Instrument => self.call_instrument(target, method, args),
            Target::Unknown => Err(format!("{}.{} is not a function", target.class, method)),
        }
    }

    fn construct(&self, target: &HostRef, class: &str, args: &[Value]) -> Result<Value, String> {
        match self.resolve(target) {
            Target::Root => self.create_instrument(class, args),
            _ => Err(format!("{}.{} is not a constructor", target.class, class)),
        }
    }
}

/// MIDI note number from a pitch name, MIDI number or frequency
pub fn parse_note(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(n) if n.is_finite() && *n > 127.0 => Ok(hz_to_midi(*n)),
        Value::Number(n) if n.is_finite() && *n >= 0.0 => Ok(*n),
        Value::Str(s) => parse_note_name(s.trim()).ok_or_else(|| format!("Invalid note '{}'", s)),
        other => Err(format!("Invalid note '{}'", other)),
    }
}

fn hz_to_midi(hz: f64) -> f64 {
    69.0 + 12.0 * (hz / 440.0).log2()
}

fn parse_note_name(s: &str) -> Option<f64> {
    let lower = s.to_ascii_lowercase();
    if let Some(hz) = lower.strip_suffix("hz") {
        return hz.trim().parse::<f64>().ok().filter(|f| *f > 0.0).map(hz_to_midi);
    }
    if let Ok(n) = s.parse::<f64>() {
        return parse_note(&Value::Number(n)).ok();
    }

    let mut chars = s.chars().peekable();
    let pitch_class = match chars.next()?.to_ascii_uppercase() {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };
    let mut accidental = 0;
    while let Some(&c) = chars.peek() {
        match c {
            '#' => accidental += 1,
            'b' => accidental -= 1,
            _ => break,
        }
        chars.next();
    }
    let octave: i32 = chars.collect::<String>().parse().ok()?;
    if !(-1..=9).contains(&octave) || !(-2..=2).contains(&accidental) {
        return None;
    }
    let midi = (octave + 1) * 12 + pitch_class + accidental;
    (0..=127).contains(&midi).then(|| f64::from(midi))
}

/// Seconds from a number or a notation like "8n", "4t", "1m", "4n."
pub fn parse_duration(value: &Value, bpm: f64) -> Result<f64, String> {
    let seconds = match value {
        Value::Number(n) => Some(*n),
        Value::Str(s) => parse_notation(s.trim(), bpm),
        _ => None,
    };
    seconds
        .filter(|s| s.is_finite() && *s >= 0.0)
        .ok_or_else(|| format!("Invalid duration '{}'", value))
}

fn parse_notation(s: &str, bpm: f64) -> Option<f64> {
    notation_seconds(s, bpm).filter(|n| n.is_finite())
}

fn notation_seconds(s: &str, bpm: f64) -> Option<f64> {
    if let Ok(n) = s.parse::<f64>() {
        return Some(n);
    }
    let (body, dotted) = match s.strip_suffix('.') {
        Some(body) => (body, true),
        None => (s, false),
    };
    let unit = body.chars().last()?;
    let count: f64 = body[..body.len() - unit.len_utf8()].parse().ok()?;
    if count <= 0.0 {
        return None;
    }
    let whole = 4.0 * 60.0 / bpm;
    let base = match unit {
        'n' => whole / count,
        't' => whole / count * 2.0 / 3.0,
        'm' => whole * count,
        _ => return None,
    };
    Some(if dotted { base * 1.5 } else { base })
}

/// Absolute library time for an optional time argument
pub fn parse_time(value: Option<&Value>, now: f64, bpm: f64) -> Result<f64, String> {
    match value {
        None | Some(Value::Undefined) => Ok(now),
        Some(Value::Number(n)) if n.is_finite() => Ok(*n),
        Some(Value::Str(s)) => {
            let s = s.trim();
            match s.strip_prefix('+') {
                Some(offset) => parse_duration(&Value::Str(offset.to_string()), bpm)
                    .map(|d| now + d)
                    .map_err(|_| format!("Invalid time '{}'", s)),
                None => parse_notation(s, bpm).ok_or_else(|| format!("Invalid time '{}'", s)),
            }
        }
        Some(other) => Err(format!("Invalid time '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Evaluator;

    fn library() -> ToneLibrary {
        ToneLibrary::new(ToneConfig::default())
    }

    #[test]
    fn test_note_names() {
        let note = |s: &str| parse_note(&Value::Str(s.to_string())).unwrap();
        assert_eq!(note("C4"), 60.0);
        assert_eq!(note("A4"), 69.0);
        assert_eq!(note("Eb3"), 51.0);
        assert_eq!(note("F#5"), 78.0);
        assert_eq!(note("c-1"), 0.0);
        assert!((note("440hz") - 69.0).abs() < 1e-9);
        assert!((parse_note(&Value::Number(880.0)).unwrap() - 81.0).abs() < 1e-9);
        assert_eq!(parse_note(&Value::Number(64.0)).unwrap(), 64.0);
        assert!(parse_note(&Value::Str("H2".into())).is_err());
        assert!(parse_note(&Value::Str("C".into())).is_err());
    }

    #[test]
    fn test_note_names_out_of_range() {
        let note = |s: &str| parse_note(&Value::Str(s.to_string()));
        assert!(note("C2147483647").is_err());
        assert!(note("C-2147483648").is_err());
        assert!(note("C10").is_err());
        assert!(note("B#9").is_err());
        assert!(note("Cb-1").is_err());
        assert_eq!(note("G9").unwrap(), 127.0);
    }

    #[test]
    fn test_durations_follow_tempo() {
        let dur = |s: &str| parse_duration(&Value::Str(s.to_string()), 120.0).unwrap();
        assert_eq!(dur("4n"), 0.5);
        assert_eq!(dur("8n"), 0.25);
        assert_eq!(dur("1m"), 2.0);
        assert_eq!(dur("4n."), 0.75);
        assert!((dur("8t") - 1.0 / 6.0).abs() < 1e-9);
        assert_eq!(parse_duration(&Value::Number(0.3), 120.0).unwrap(), 0.3);
        assert!(parse_duration(&Value::Str("soon".into()), 120.0).is_err());
        assert!(parse_duration(&Value::Number(-1.0), 120.0).is_err());
    }

    #[test]
    fn test_times() {
        assert_eq!(parse_time(None, 2.0, 120.0).unwrap(), 2.0);
        assert_eq!(parse_time(Some(&Value::Number(5.0)), 2.0, 120.0).unwrap(), 5.0);
        assert_eq!(
            parse_time(Some(&Value::Str("+0.5".into())), 2.0, 120.0).unwrap(),
            2.5
        );
        assert_eq!(
            parse_time(Some(&Value::Str("+4n".into())), 1.0, 120.0).unwrap(),
            1.5
        );
        assert!(parse_time(Some(&Value::Bool(true)), 0.0, 120.0).is_err());
    }

    #[test]
    fn test_non_finite_times_are_rejected() {
        let time = |s: &str| parse_time(Some(&Value::Str(s.to_string())), 0.0, 120.0);
        assert!(time("inf").is_err());
        assert!(time("-inf").is_err());
        assert!(time("NaN").is_err());
        assert!(time("+1e400").is_err());
        assert!(time("1e400m").is_err());
        assert!(parse_duration(&Value::Str("inf".into()), 120.0).is_err());
    }

    #[test]
    fn test_dirt_play_message_layout() {
        let msg = NoteEvent {
            synth: "superfm".to_string(),
            midinote: 60.0,
            sustain: 0.25,
            gain: 0.8,
            orbit: 1,
        }
        .to_osc();
        assert_eq!(msg.addr, "/dirt/play");
        assert_eq!(msg.args[0], OscType::String("s".to_string()));
        assert_eq!(msg.args[1], OscType::String("superfm".to_string()));
        assert_eq!(msg.args[3], OscType::Float(60.0));
        assert_eq!(msg.args[9], OscType::Int(1));
    }

    #[test]
    fn test_notes_require_unlock() {
        let tone = library();
        let program = Evaluator::default()
            .compile("Tone", "new Tone.Synth().triggerAttackRelease('C4', '8n')")
            .unwrap();
        let err = program.invoke(&tone).unwrap_err();
        assert_eq!(
            err,
            EvaluationError::runtime("The audio context has not been started")
        );
    }

    #[test]
    fn test_constructor_errors() {
        let tone = library();
        let run = |src: &str| {
            Evaluator::default()
                .compile("Tone", src)
                .unwrap()
                .invoke(&tone)
        };
        assert_eq!(
            run("new Tone.Sampler()"),
            Err(EvaluationError::runtime("Tone.Sampler is not a constructor"))
        );
        assert_eq!(
            run("Tone.Synth()"),
            Err(EvaluationError::runtime(
                "Class constructor Synth cannot be invoked without 'new'"
            ))
        );
        assert_eq!(
            run("Tone.play()"),
            Err(EvaluationError::runtime("Tone.play is not a function"))
        );
    }

    #[test]
    fn test_foreign_constructor_handle_is_inert() {
        let tone = library();
        let forged = HostRef::new(CONSTRUCTOR, 999);
        assert_eq!(tone.get(&forged, "volume"), Ok(Value::Undefined));
        assert_eq!(
            tone.call(&forged, "triggerAttack", &[]),
            Err("Constructor.triggerAttack is not a function".to_string())
        );
        assert!(tone.construct(&forged, "Synth", &[]).is_err());
        assert_eq!(tone.live_instruments(), 0);
    }

    #[tokio::test]
    async fn test_scheduled_notes_reach_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = ToneConfig {
            target: server.local_addr().unwrap().to_string(),
            ..ToneConfig::default()
        };
        let tone = ToneLibrary::new(config);
        tone.start().await.unwrap();
        assert!(tone.is_started());

        let program = Evaluator::default()
            .compile(
                "Tone",
                "const synth = new Tone.PolySynth(Tone.FMSynth).toDestination()\n\
                 synth.triggerAttackRelease(['C4', 'E4'], '8n', Tone.now(), 0.5)",
            )
            .unwrap();
        program.invoke(&tone).unwrap();
        assert_eq!(tone.live_instruments(), 1);

        let mut buf = [0u8; 1024];
        let mut notes = Vec::new();
        for _ in 0..2 {
            let (size, _) = tokio::time::timeout(Duration::from_secs(2), server.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            match rosc::decoder::decode_udp(&buf[..size]).unwrap().1 {
                OscPacket::Message(msg) => notes.push(msg),
                other => panic!("unexpected packet {:?}", other),
            }
        }
        assert!(notes.iter().all(|m| m.addr == "/dirt/play"));
        assert!(notes
            .iter()
            .all(|m| m.args[1] == OscType::String("superfm".to_string())));
        assert_eq!(notes[0].args[3], OscType::Float(60.0));
        assert_eq!(notes[1].args[3], OscType::Float(64.0));
        assert_eq!(notes[0].args[7], OscType::Float(0.5));
    }

    #[tokio::test]
    async fn test_transport_cancel_drops_pending_notes() {
        let tone = library();
        tone.start().await.unwrap();
        let program = Evaluator::default()
            .compile(
                "Tone",
                "const s = new Tone.Synth()\ns.triggerAttackRelease('C4', 1, '+30')\ns.triggerAttackRelease(72, 1, Tone.now() + 40)",
            )
            .unwrap();
        program.invoke(&tone).unwrap();
        assert_eq!(tone.pending_events(), 2);

        tone.transport_cancel();
        assert_eq!(tone.pending_events(), 0);
    }

    #[tokio::test]
    async fn test_far_future_notes_are_runtime_errors() {
        let tone = library();
        tone.start().await.unwrap();
        for src in [
            "new Tone.Synth().triggerAttackRelease('C4', '8n', 1e20)",
            "new Tone.Synth().triggerAttackRelease('C4', '8n', '+1e300')",
            "new Tone.Synth().triggerAttackRelease('C4', '8n', Tone.now() + 7200)",
        ] {
            let err = Evaluator::default()
                .compile("Tone", src)
                .unwrap()
                .invoke(&tone)
                .unwrap_err();
            assert_eq!(err.kind(), "runtime");
            assert!(err.to_string().contains("out of range"), "{}", err);
        }
        assert_eq!(tone.pending_events(), 0);

        // An hour ahead is still accepted
        Evaluator::default()
            .compile("Tone", "new Tone.Synth().triggerAttackRelease('C4', '8n', '+3500')")
            .unwrap()
            .invoke(&tone)
            .unwrap();
        assert_eq!(tone.pending_events(), 1);
    }

    #[tokio::test]
    async fn test_snippet_transport_stop() {
        let tone = library();
        tone.start().await.unwrap();
        let program = Evaluator::default()
            .compile(
                "Tone",
                "new Tone.MembraneSynth().triggerAttackRelease('C2', '4n', '+10')\nTone.Transport.stop()",
            )
            .unwrap();
        program.invoke(&tone).unwrap();
        assert_eq!(tone.pending_events(), 0);
    }

    #[tokio::test]
    async fn test_disposed_instrument_rejects_notes() {
        let tone = library();
        tone.start().await.unwrap();
        let program = Evaluator::default()
            .compile(
                "Tone",
                "const s = new Tone.Synth()\ns.dispose()\ns.triggerAttackRelease('C4', '8n')",
            )
            .unwrap();
        assert_eq!(
            program.invoke(&tone),
            Err(EvaluationError::runtime("Synth has been disposed"))
        );
        assert_eq!(tone.live_instruments(), 0);
    }

    #[tokio::test]
    async fn test_unresolvable_target_is_initialization_error() {
        let tone = ToneLibrary::new(ToneConfig {
            target: "not-an-address".to_string(),
            ..ToneConfig::default()
        });
        let err = tone.start().await.unwrap_err();
        assert_eq!(err.kind(), "initialization");
        assert!(!tone.is_started());
    }
}
