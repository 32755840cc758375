//! Client for an external pattern server
//!
//! The server speaks the live-coding OSC protocol: `/eval <code>` replaces
//! the running pattern, `/hush` silences it and `/cps <f>` sets the tempo.
//! Servers that acknowledge reply with `/eval/ok` or `/eval/error <message>`
//! and may announce `/playing <0|1>` when their state changes.

use crate::config::{parse_addr, PatternConfig};
use crate::error::{EvalResult, EvaluationError};
use rosc::{OscMessage, OscPacket, OscType};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The pattern backend as seen by the playback controller
pub trait PatternEngine: Send + Sync + 'static {
    /// Connect once; later calls are no-ops
    fn init(&self) -> impl Future<Output = EvalResult<()>> + Send;

    /// Replace the running pattern with `code`
    fn evaluate(&self, code: &str) -> impl Future<Output = EvalResult<()>> + Send;

    /// Silence everything
    fn stop(&self);

    fn is_playing(&self) -> bool;

    /// Tempo in cycles per second
    fn set_cps(&self, cps: f64);

    /// Tempo in cycles per minute
    fn set_cpm(&self, cpm: f64) {
        self.set_cps(cpm / 60.0)
    }
}

/// Reply to an `/eval`
#[derive(Debug, Clone, PartialEq)]
enum Ack {
    Ok,
    Error(String),
}

struct Link {
    socket: Arc<UdpSocket>,
    /// Clone of `socket` for sends from sync code (`stop`, `set_cps`)
    sync_socket: std::net::UdpSocket,
    server: SocketAddr,
    acks: Mutex<mpsc::UnboundedReceiver<Ack>>,
    listener: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// OSC implementation of [`PatternEngine`]
pub struct OscPatternEngine {
    config: PatternConfig,
    link: OnceCell<Link>,
    playing: Arc<AtomicBool>,
    /// Last tempo asked for; sent again whenever a link is opened
    tempo: std::sync::Mutex<Option<f64>>,
}

impl OscPatternEngine {
    pub fn new(config: PatternConfig) -> Self {
        Self {
            tempo: std::sync::Mutex::new(config.cps),
            config,
            link: OnceCell::new(),
            playing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Tempo the server was last told, or will be told on connect
    pub fn cps(&self) -> Option<f64> {
        self.tempo.lock().ok().and_then(|t| *t)
    }

    pub fn is_connected(&self) -> bool {
        self.link.initialized()
    }

    /// Local address replies should be sent to, once connected
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link.get().and_then(|l| l.socket.local_addr().ok())
    }

    async fn connect(&self) -> EvalResult<Link> {
        let server = parse_addr("pattern.server", &self.config.server)
            .map_err(|e| EvaluationError::initialization(e.to_string()))?;
        let bind = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let open_error =
            |e: std::io::Error| EvaluationError::initialization(format!("cannot open OSC socket: {}", e));

        let std_socket = std::net::UdpSocket::bind(bind).map_err(open_error)?;
        std_socket.set_nonblocking(true).map_err(open_error)?;
        let sync_socket = std_socket.try_clone().map_err(open_error)?;
        let socket = Arc::new(UdpSocket::from_std(std_socket).map_err(open_error)?);

        if let Some(cps) = self.cps() {
            send(&socket, server, "/cps", vec![OscType::Float(cps as f32)])
                .await
                .map_err(EvaluationError::initialization)?;
        }

        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let listener = tokio::spawn(listen(
            Arc::clone(&socket),
            ack_tx,
            Arc::clone(&self.playing),
        ));

        info!("🎛  Pattern engine connected to {}", server);

        Ok(Link {
            socket,
            sync_socket,
            server,
            acks: Mutex::new(ack_rx),
            listener,
        })
    }

    /// Fire-and-forget send for callers that cannot await
    fn send_now(&self, link: &Link, addr: &str, args: Vec<OscType>) -> Result<(), String> {
        let buf = encode(addr, args)?;
        link.sync_socket
            .send_to(&buf, link.server)
            .map(|_| ())
            .map_err(|e| format!("cannot send {} to {}: {}", addr, link.server, e))
    }
}

async fn send(socket: &UdpSocket, server: SocketAddr, addr: &str, args: Vec<OscType>) -> Result<(), String> {
    let buf = encode(addr, args)?;
    socket
        .send_to(&buf, server)
        .await
        .map(|_| ())
        .map_err(|e| format!("cannot send {} to {}: {}", addr, server, e))
}

fn encode(addr: &str, args: Vec<OscType>) -> Result<Vec<u8>, String> {
    let packet = OscPacket::Message(OscMessage {
        addr: addr.to_string(),
        args,
    });
    rosc::encoder::encode(&packet).map_err(|e| format!("cannot encode {}: {}", addr, e))
}

/// Route replies from the server
async fn listen(socket: Arc<UdpSocket>, acks: mpsc::UnboundedSender<Ack>, playing: Arc<AtomicBool>) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (size, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                error!("Pattern server socket error: {}", e);
                break;
            }
        };
        match rosc::decoder::decode_udp(&buf[..size]) {
            Ok((_, packet)) => handle_packet(packet, &acks, &playing),
            Err(e) => warn!("Undecodable packet from {}: {}", from, e),
        }
    }
}

fn handle_packet(packet: OscPacket, acks: &mpsc::UnboundedSender<Ack>, playing: &AtomicBool) {
    match packet {
        OscPacket::Message(msg) => handle_message(msg, acks, playing),
        OscPacket::Bundle(bundle) => {
            for content in bundle.content {
                handle_packet(content, acks, playing);
            }
        }
    }
}

fn handle_message(msg: OscMessage, acks: &mpsc::UnboundedSender<Ack>, playing: &AtomicBool) {
    debug!("Pattern server: {} with {} args", msg.addr, msg.args.len());
    match msg.addr.as_str() {
        "/eval/ok" => {
            let _ = acks.send(Ack::Ok);
        }
        "/eval/error" => {
            let message = match msg.args.first() {
                Some(OscType::String(s)) => s.clone(),
                _ => "pattern evaluation failed".to_string(),
            };
            let _ = acks.send(Ack::Error(message));
        }
        "/playing" => {
            let now_playing = match msg.args.first() {
                Some(OscType::Int(i)) => *i != 0,
                Some(OscType::Float(f)) => *f != 0.0,
                Some(OscType::Bool(b)) => *b,
                _ => return,
            };
            playing.store(now_playing, Ordering::SeqCst);
        }
        _ => debug!("Ignoring {}", msg.addr),
    }
}

impl PatternEngine for OscPatternEngine {
    async fn init(&self) -> EvalResult<()> {
        self.link.get_or_try_init(|| self.connect()).await?;
        Ok(())
    }

    async fn evaluate(&self, code: &str) -> EvalResult<()> {
        let link = self
            .link
            .get()
            .ok_or_else(|| EvaluationError::initialization("pattern engine not initialised"))?;

        if !self.config.acknowledge {
            send(&link.socket, link.server, "/eval", vec![OscType::String(code.to_string())])
                .await
                .map_err(EvaluationError::initialization)?;
            self.playing.store(true, Ordering::SeqCst);
            return Ok(());
        }

        let mut acks = link.acks.lock().await;
        // Replies to earlier evaluations that timed out
        while acks.try_recv().is_ok() {}

        send(&link.socket, link.server, "/eval", vec![OscType::String(code.to_string())])
            .await
            .map_err(EvaluationError::initialization)?;

        match tokio::time::timeout(self.config.reply_timeout(), acks.recv()).await {
            Ok(Some(Ack::Ok)) => {
                self.playing.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(Some(Ack::Error(message))) => Err(EvaluationError::runtime(message)),
            Ok(None) => Err(EvaluationError::initialization(
                "pattern server connection closed",
            )),
            Err(_) => Err(EvaluationError::initialization(format!(
                "pattern server at {} did not answer within {}ms",
                link.server, self.config.reply_timeout_ms
            ))),
        }
    }

    fn stop(&self) {
        self.playing.store(false, Ordering::SeqCst);
        if let Some(link) = self.link.get() {
            match self.send_now(link, "/hush", Vec::new()) {
                Ok(()) => debug!("🔇 /hush sent"),
                Err(e) => warn!("{}", e),
            }
        }
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn set_cps(&self, cps: f64) {
        if !(cps.is_finite() && cps > 0.0) {
            warn!("Ignoring tempo {} cps", cps);
            return;
        }
        if let Ok(mut tempo) = self.tempo.lock() {
            *tempo = Some(cps);
        }
        match self.link.get() {
            Some(link) => {
                if let Err(e) = self.send_now(link, "/cps", vec![OscType::Float(cps as f32)]) {
                    warn!("{}", e);
                }
            }
            None => debug!("Tempo {} cps held until the pattern engine connects", cps),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn fake_server() -> (UdpSocket, PatternConfig) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = PatternConfig {
            server: server.local_addr().unwrap().to_string(),
            acknowledge: true,
            reply_timeout_ms: 500,
            cps: None,
        };
        (server, config)
    }

    async fn receive(server: &UdpSocket) -> (OscMessage, SocketAddr) {
        let mut buf = [0u8; 4096];
        let (size, from) = tokio::time::timeout(Duration::from_secs(2), server.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        match rosc::decoder::decode_udp(&buf[..size]).unwrap().1 {
            OscPacket::Message(msg) => (msg, from),
            other => panic!("unexpected packet {:?}", other),
        }
    }

    async fn reply(server: &UdpSocket, to: SocketAddr, addr: &str, args: Vec<OscType>) {
        let buf = encode(addr, args).unwrap();
        server.send_to(&buf, to).await.unwrap();
    }

    #[tokio::test]
    async fn test_evaluate_acknowledged() {
        let (server, config) = fake_server().await;
        let engine = Arc::new(OscPatternEngine::new(config));
        engine.init().await.unwrap();

        let e = Arc::clone(&engine);
        let eval = tokio::spawn(async move { e.evaluate("s \"bd sn\"").await });

        let (msg, from) = receive(&server).await;
        assert_eq!(msg.addr, "/eval");
        assert_eq!(msg.args, vec![OscType::String("s \"bd sn\"".to_string())]);
        reply(&server, from, "/eval/ok", vec![]).await;

        eval.await.unwrap().unwrap();
        assert!(engine.is_playing());

        engine.stop();
        assert!(!engine.is_playing());
        let (msg, _) = receive(&server).await;
        assert_eq!(msg.addr, "/hush");
    }

    #[tokio::test]
    async fn test_evaluate_error_reply_is_runtime_error() {
        let (server, config) = fake_server().await;
        let engine = Arc::new(OscPatternEngine::new(config));
        engine.init().await.unwrap();

        let e = Arc::clone(&engine);
        let eval = tokio::spawn(async move { e.evaluate("nonsense(").await });

        let (_, from) = receive(&server).await;
        reply(
            &server,
            from,
            "/eval/error",
            vec![OscType::String("unexpected end of pattern".to_string())],
        )
        .await;

        let err = eval.await.unwrap().unwrap_err();
        assert_eq!(err, EvaluationError::runtime("unexpected end of pattern"));
        assert!(!engine.is_playing());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let (_server, config) = fake_server().await;
        let engine = OscPatternEngine::new(config);
        engine.init().await.unwrap();
        let err = engine.evaluate("s \"bd\"").await.unwrap_err();
        assert_eq!(err.kind(), "initialization");
    }

    #[tokio::test]
    async fn test_server_reports_playback_stopped() {
        let (server, config) = fake_server().await;
        let engine = OscPatternEngine::new(PatternConfig {
            acknowledge: false,
            cps: Some(0.75),
            ..config
        });
        engine.init().await.unwrap();

        let (msg, from) = receive(&server).await;
        assert_eq!(msg.addr, "/cps");
        assert_eq!(msg.args, vec![OscType::Float(0.75)]);

        engine.evaluate("s \"hh*8\"").await.unwrap();
        assert!(engine.is_playing());

        reply(&server, from, "/playing", vec![OscType::Int(0)]).await;
        for _ in 0..100 {
            if !engine.is_playing() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!engine.is_playing());
    }

    #[tokio::test]
    async fn test_evaluate_before_init_fails() {
        let engine = OscPatternEngine::new(PatternConfig::default());
        let err = engine.evaluate("s \"bd\"").await.unwrap_err();
        assert_eq!(err.kind(), "initialization");
        engine.stop();
        assert!(!engine.is_connected());
    }

    #[tokio::test]
    async fn test_first_evaluation_right_after_connect_is_sent() {
        let (server, config) = fake_server().await;
        let engine = OscPatternEngine::new(PatternConfig {
            acknowledge: false,
            ..config
        });

        engine.init().await.unwrap();
        engine.evaluate("s \"bd*4\"").await.unwrap();

        let (msg, _) = receive(&server).await;
        assert_eq!(msg.addr, "/eval");
        assert_eq!(msg.args, vec![OscType::String("s \"bd*4\"".to_string())]);
        assert!(engine.is_playing());
    }

    #[tokio::test]
    async fn test_tempo_is_held_until_connect_then_sent_live() {
        let (server, config) = fake_server().await;
        let engine = OscPatternEngine::new(PatternConfig {
            acknowledge: false,
            ..config
        });

        engine.set_cpm(36.0);
        engine.set_cps(f64::NAN);
        engine.set_cps(-1.0);
        assert_eq!(engine.cps(), Some(0.6));

        engine.init().await.unwrap();
        let (msg, _) = receive(&server).await;
        assert_eq!(msg.addr, "/cps");
        assert_eq!(msg.args, vec![OscType::Float(0.6)]);

        engine.set_cps(1.25);
        let (msg, _) = receive(&server).await;
        assert_eq!(msg.addr, "/cps");
        assert_eq!(msg.args, vec![OscType::Float(1.25)]);
        assert_eq!(engine.cps(), Some(1.25));
    }
}
