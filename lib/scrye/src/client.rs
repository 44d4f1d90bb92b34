use crate::display::Display;
use crate::keys::{self, KeyCode, MouseButton};
use crate::protocol::instruction::{Instruction, ParseError};
use crate::stream::Streams;
use flint::logging::{self, debug, info, warn, Logger};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use image::RgbaImage;
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const PING_FREQUENCY: Duration = Duration::from_secs(5);
const QUEUE_DEPTH: usize = 100;

/// Connection parameters for one remote desktop session. Serialized as the
/// login request body.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectConfig {
    pub protocol: String,
    pub host: String,
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
struct TokenReply {
    token: String,
}

/// Lifecycle of a client session. Transitions only move forward; a closed
/// session is never reopened.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    Handshake = 0,
    Active = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(v: u8) -> SessionState {
        match v {
            0 => SessionState::Handshake,
            1 => SessionState::Active,
            _ => SessionState::Closed,
        }
    }
}

/// Client-side errors.
#[derive(Debug)]
pub enum ClientError {
    /// The session is not in the `Active` state.
    NotConnected,
    /// The logical key has no keysym mapping.
    InvalidKeyCode,
    /// The login endpoint refused the credentials.
    Login(String),
    /// HTTP transport failure during the handshake.
    Http(reqwest::Error),
    /// WebSocket failure.
    WebSocket(tokio_tungstenite::tungstenite::Error),
    /// A malformed frame arrived from the proxy.
    Parse(ParseError),
    /// The outbound queue is gone or full.
    Queue,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::NotConnected => f.write_str("not connected"),
            ClientError::InvalidKeyCode => f.write_str("invalid key code"),
            ClientError::Login(msg) => write!(f, "login refused: {}", msg),
            ClientError::Http(e) => write!(f, "http: {}", e),
            ClientError::WebSocket(e) => write!(f, "websocket: {}", e),
            ClientError::Parse(e) => write!(f, "parse: {}", e),
            ClientError::Queue => f.write_str("send queue unavailable"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Http(e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::WebSocket(e)
    }
}

impl From<ParseError> for ClientError {
    fn from(e: ParseError) -> Self {
        ClientError::Parse(e)
    }
}

/// Callback fired after every processed sync fence with the fresh snapshot
/// and its last-update timestamp.
pub type OnSync = Box<dyn Fn(Arc<RgbaImage>, i64) + Send + Sync>;

struct Shared {
    state: AtomicU8,
    outbound: mpsc::Sender<Instruction>,
    done: watch::Sender<bool>,
    on_sync: Mutex<Option<OnSync>>,
    log: Logger,
}

impl Shared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Forward-only state transition.
    fn advance(&self, state: SessionState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    /// Signals every pump to wind down. Safe to call more than once.
    fn terminate(&self) {
        let _ = self.done.send(true);
    }

    fn queue(&self, ins: Instruction) -> Result<(), ClientError> {
        self.outbound.try_send(ins).map_err(|_| ClientError::Queue)
    }
}

/// A protocol client: handles the login handshake, keeps the instruction
/// pumps running and feeds the display engine. Obtain one with
/// [`Client::connect`], then poll [`Client::screen`] or register an
/// [`Client::on_sync`] callback for presentation.
pub struct Client {
    display: Arc<Display>,
    shared: Arc<Shared>,
}

impl Client {
    /// Connects to the proxy at `addr` (`host:port`): posts the credentials
    /// to the login endpoint, opens the WebSocket tunnel requesting the
    /// `guacamole` subprotocol, and spawns the background pumps. Must be
    /// called within a tokio runtime.
    pub async fn connect<'a, L: Into<Option<&'a Logger>>>(
        addr: &str,
        config: ConnectConfig,
        log: L,
    ) -> Result<Client, ClientError> {
        let log = logging::child(log);

        let reply = reqwest::Client::new()
            .post(format!("http://{}/api/v1/login", addr))
            .json(&config)
            .send()
            .await?;
        if !reply.status().is_success() {
            return Err(ClientError::Login(reply.status().to_string()));
        }
        let token = reply.json::<TokenReply>().await?.token;

        let mut request = format!("ws://{}/api/v1/connect?token={}", addr, token)
            .into_client_request()?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static("guacamole"),
        );
        let (socket, _) = tokio_tungstenite::connect_async(request).await?;
        info!(log, "session established";
            "protocol" => %config.protocol, "addr" => %addr);

        let (ws_tx, ws_rx) = socket.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(QUEUE_DEPTH);
        // Receivers are handed out before any pump runs, so a termination
        // signal can never be missed.
        let (done_tx, done_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            state: AtomicU8::new(SessionState::Handshake as u8),
            outbound: outbound_tx,
            done: done_tx,
            on_sync: Mutex::new(None),
            log,
        });
        let display = Arc::new(Display::new(&shared.log));

        tokio::spawn(send_pump(ws_tx, outbound_rx, shared.clone(), done_rx.clone()));
        tokio::spawn(receive_pump(ws_rx, dispatch_tx, shared.clone(), done_rx.clone()));
        tokio::spawn(dispatch_loop(display.clone(), dispatch_rx, shared.clone()));
        tokio::spawn(keepalive(shared.clone(), done_rx));

        shared.advance(SessionState::Active);
        Ok(Client { display, shared })
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// A snapshot of the current screen together with its last-update
    /// timestamp.
    pub fn screen(&self) -> (Arc<RgbaImage>, i64) {
        self.display.screen()
    }

    /// Registers the sync callback, replacing any previous one.
    pub fn on_sync(&self, callback: OnSync) {
        *self.shared.on_sync.lock() = Some(callback);
    }

    /// Sends a mouse event: the pointer position and every currently
    /// pressed button. The local cursor moves immediately.
    pub fn send_mouse(&self, x: i32, y: i32, pressed: &[MouseButton]) -> Result<(), ClientError> {
        if self.shared.state() != SessionState::Active {
            return Err(ClientError::NotConnected);
        }

        self.display.move_cursor(x, y);
        self.shared.queue(Instruction::new(
            "mouse",
            vec![
                x.to_string(),
                y.to_string(),
                keys::button_mask(pressed).to_string(),
            ],
        ))
    }

    /// Sends a key press or release, expanding the logical key into its
    /// keysym sequence.
    pub fn send_key(&self, key: KeyCode, pressed: bool) -> Result<(), ClientError> {
        if self.shared.state() != SessionState::Active {
            return Err(ClientError::NotConnected);
        }

        let syms = keys::keysyms(key).ok_or(ClientError::InvalidKeyCode)?;
        let state = if pressed { "1" } else { "0" };
        for sym in syms {
            self.shared.queue(Instruction::new(
                "key",
                vec![sym.to_string(), state.to_string()],
            ))?;
        }
        Ok(())
    }

    /// Sends a sequence of characters as they were typed. Only works for
    /// plain text, no control-key combinations.
    pub fn send_text(&self, sequence: &str) -> Result<(), ClientError> {
        if self.shared.state() != SessionState::Active {
            return Err(ClientError::NotConnected);
        }

        for ch in sequence.chars() {
            let keycode = (ch as u32).to_string();
            self.shared
                .queue(Instruction::new("key", vec![keycode.clone(), "1".into()]))?;
            self.shared
                .queue(Instruction::new("key", vec![keycode, "0".into()]))?;
        }
        Ok(())
    }

    /// Terminates the session. The send pump delivers a final disconnect
    /// frame before the socket closes.
    pub fn disconnect(&self) {
        self.shared.terminate();
    }
}

/// Drains the outbound queue into the socket. On cancellation or write
/// failure, writes one final disconnect frame and closes the tunnel.
async fn send_pump(
    mut ws: WsSink,
    mut outbound: mpsc::Receiver<Instruction>,
    shared: Arc<Shared>,
    mut done: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = done.changed() => break,
            ins = outbound.recv() => {
                let ins = match ins {
                    Some(ins) => ins,
                    None => break,
                };
                debug!(shared.log, "C> {}", ins);
                if let Err(e) = ws.send(Message::Text(ins.encode())).await {
                    warn!(shared.log, "send pump terminated"; "error" => %e);
                    shared.terminate();
                    break;
                }
            }
        }
    }

    let goodbye = Instruction::new("disconnect", vec![]);
    let _ = ws.send(Message::Text(goodbye.encode())).await;
    let _ = ws.close().await;
    shared.advance(SessionState::Closed);
    info!(shared.log, "session closed");
}

/// Reads frames off the socket, parses them, drops keepalives and forwards
/// the rest to the dispatch loop.
async fn receive_pump(
    mut ws: WsSource,
    dispatch: mpsc::Sender<Instruction>,
    shared: Arc<Shared>,
    mut done: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            _ = done.changed() => break,
            message = ws.next() => message,
        };

        let raw = match message {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Close(_))) | None => {
                info!(shared.log, "disconnecting, tunnel closed by peer");
                shared.terminate();
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(shared.log, "disconnecting from server"; "reason" => %e);
                shared.terminate();
                break;
            }
        };

        let ins = match Instruction::parse(&raw) {
            Ok(ins) => ins,
            Err(e) => {
                warn!(shared.log, "failed to parse instruction"; "error" => %e);
                shared.terminate();
                break;
            }
        };
        if ins.expect("nop") {
            continue;
        }
        if dispatch.send(ins).await.is_err() {
            break;
        }
    }
}

/// Applies parsed instructions to the display and stream registries.
async fn dispatch_loop(
    display: Arc<Display>,
    mut inbound: mpsc::Receiver<Instruction>,
    shared: Arc<Shared>,
) {
    let mut streams = Streams::new();

    while let Some(ins) = inbound.recv().await {
        if !ins.expect("blob") {
            debug!(shared.log, "S> {}", ins);
        }
        dispatch(&display, &mut streams, &shared, &ins);
        if shared.state() == SessionState::Closed {
            break;
        }
    }
}

/// Opcode handler table for everything the proxy may send a viewer.
fn dispatch(display: &Arc<Display>, streams: &mut Streams, shared: &Arc<Shared>, ins: &Instruction) {
    let args = &ins.args;
    match ins.opcode.as_str() {
        "blob" => {
            streams.append(arg_i32(args, 0), arg_str(args, 1));
        }
        "img" => {
            let index = arg_i32(args, 0);
            let mask = arg_i32(args, 1) as u8;
            let layer = arg_i32(args, 2);
            // args[3] is the mimetype; decoding sniffs the actual format.
            let x = arg_i32(args, 4);
            let y = arg_i32(args, 5);

            let display = display.clone();
            streams.set_on_end(
                index,
                Box::new(move |stream| {
                    display.draw(layer, x, y, mask, stream.image());
                }),
            );
        }
        "end" => {
            streams.end(arg_i32(args, 0));
        }
        "copy" => {
            display.copy(
                arg_i32(args, 0),
                arg_i32(args, 1),
                arg_i32(args, 2),
                arg_i32(args, 3),
                arg_i32(args, 4),
                arg_i32(args, 5) as u8,
                arg_i32(args, 6),
                arg_i32(args, 7),
                arg_i32(args, 8),
            );
        }
        "cfill" => {
            display.fill(
                arg_i32(args, 1),
                arg_i32(args, 2) as u8,
                arg_i32(args, 3) as u8,
                arg_i32(args, 4) as u8,
                arg_i32(args, 5) as u8,
                arg_i32(args, 0) as u8,
            );
        }
        "rect" => {
            display.rect(
                arg_i32(args, 0),
                arg_i32(args, 1),
                arg_i32(args, 2),
                arg_i32(args, 3),
                arg_i32(args, 4),
            );
        }
        "cursor" => {
            display.set_cursor(
                arg_i32(args, 0),
                arg_i32(args, 1),
                arg_i32(args, 2),
                arg_i32(args, 3),
                arg_i32(args, 4),
                arg_i32(args, 5),
                arg_i32(args, 6),
            );
        }
        "dispose" => {
            display.dispose(arg_i32(args, 0));
        }
        "size" => {
            display.resize(arg_i32(args, 0), arg_i32(args, 1), arg_i32(args, 2));
        }
        "sync" => {
            display.flush();
            if shared
                .queue(Instruction::new("sync", args.clone()))
                .is_err()
            {
                warn!(shared.log, "failed to echo sync back to server");
            }
            if let Some(on_sync) = shared.on_sync.lock().as_ref() {
                let (snapshot, ts) = display.screen();
                on_sync(snapshot, ts);
            }
        }
        "error" => {
            warn!(shared.log, "received error from server";
                "message" => %arg_str(args, 0), "code" => %arg_str(args, 1));
        }
        "log" => {
            info!(shared.log, "log from server"; "message" => %arg_str(args, 0));
        }
        "disconnect" => {
            shared.terminate();
        }
        other => {
            debug!(shared.log, "instruction not implemented"; "opcode" => %other);
        }
    }
}

/// Enqueues a keepalive every few seconds so idle tunnels stay open.
async fn keepalive(shared: Arc<Shared>, mut done: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(PING_FREQUENCY);

    loop {
        tokio::select! {
            _ = done.changed() => break,
            _ = ticker.tick() => {
                if shared.queue(Instruction::new("nop", vec![])).is_err() {
                    break;
                }
            }
        }
    }
}

fn arg_i32(args: &[String], index: usize) -> i32 {
    args.get(index)
        .and_then(|a| a.parse().ok())
        .unwrap_or_default()
}

fn arg_str<'a>(args: &'a [String], index: usize) -> &'a str {
    args.get(index).map(String::as_str).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_shared() -> (Arc<Shared>, mpsc::Receiver<Instruction>) {
        let (outbound, queue) = mpsc::channel(16);
        let (done, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: AtomicU8::new(SessionState::Active as u8),
            outbound,
            done,
            on_sync: Mutex::new(None),
            log: logging::discard(),
        });
        (shared, queue)
    }

    fn ins(opcode: &str, args: &[&str]) -> Instruction {
        Instruction::new(opcode, args.iter().map(|a| a.to_string()).collect())
    }

    fn png_base64(width: u32, height: u32, px: [u8; 4]) -> String {
        let img = RgbaImage::from_pixel(width, height, image::Rgba(px));
        let mut bytes = std::io::Cursor::new(Vec::new());
        img.write_to(&mut bytes, image::ImageFormat::Png).unwrap();
        flint::encoding::base64::encode(bytes.get_ref())
    }

    #[test]
    fn test_dispatch_fill_lands_on_sync() {
        let (shared, mut queue) = test_shared();
        let display = Arc::new(Display::new(None));
        let mut streams = Streams::new();

        dispatch(&display, &mut streams, &shared, &ins("size", &["0", "32", "32"]));
        dispatch(&display, &mut streams, &shared, &ins("rect", &["0", "4", "4", "8", "8"]));
        dispatch(
            &display,
            &mut streams,
            &shared,
            &ins("cfill", &["12", "0", "9", "8", "7", "255"]),
        );

        // Nothing is presented before the fence.
        assert_eq!(display.screen().0.width(), 0);

        dispatch(&display, &mut streams, &shared, &ins("sync", &["4711"]));
        let (snapshot, ts) = display.screen();
        assert_eq!(*snapshot.get_pixel(5, 5), image::Rgba([9, 8, 7, 255]));
        assert!(ts > 0);

        // The fence is echoed with the server's timestamp.
        let echo = queue.try_recv().unwrap();
        assert_eq!(echo, ins("sync", &["4711"]));
    }

    #[test]
    fn test_dispatch_image_stream() {
        let (shared, _queue) = test_shared();
        let display = Arc::new(Display::new(None));
        let mut streams = Streams::new();

        dispatch(&display, &mut streams, &shared, &ins("size", &["0", "16", "16"]));
        dispatch(
            &display,
            &mut streams,
            &shared,
            &ins("img", &["3", "12", "0", "image/png", "2", "2"]),
        );
        let encoded = png_base64(4, 4, [1, 2, 3, 255]);
        let (head, tail) = encoded.split_at(encoded.len() / 2);
        dispatch(&display, &mut streams, &shared, &ins("blob", &["3", head]));
        dispatch(&display, &mut streams, &shared, &ins("blob", &["3", tail]));
        dispatch(&display, &mut streams, &shared, &ins("end", &["3"]));
        dispatch(&display, &mut streams, &shared, &ins("sync", &["1"]));

        let (snapshot, _) = display.screen();
        assert_eq!(*snapshot.get_pixel(3, 3), image::Rgba([1, 2, 3, 255]));
        assert_eq!(*snapshot.get_pixel(0, 0), image::Rgba([0, 0, 0, 0]));
        assert_eq!(streams.len(), 0);
    }

    #[test]
    fn test_dispatch_corrupt_stream_is_skipped() {
        let (shared, _queue) = test_shared();
        let display = Arc::new(Display::new(None));
        let mut streams = Streams::new();

        dispatch(&display, &mut streams, &shared, &ins("size", &["0", "8", "8"]));
        dispatch(
            &display,
            &mut streams,
            &shared,
            &ins("img", &["0", "12", "0", "image/png", "0", "0"]),
        );
        dispatch(&display, &mut streams, &shared, &ins("blob", &["0", "!!corrupt!!"]));
        dispatch(&display, &mut streams, &shared, &ins("end", &["0"]));
        // A later fill still lands: the bad draw is skipped, not fatal.
        dispatch(&display, &mut streams, &shared, &ins("rect", &["0", "0", "0", "8", "8"]));
        dispatch(
            &display,
            &mut streams,
            &shared,
            &ins("cfill", &["12", "0", "50", "50", "50", "255"]),
        );
        dispatch(&display, &mut streams, &shared, &ins("sync", &["2"]));

        let (snapshot, _) = display.screen();
        assert_eq!(*snapshot.get_pixel(4, 4), image::Rgba([50, 50, 50, 255]));
    }

    #[test]
    fn test_dispatch_disconnect_terminates() {
        let (shared, _queue) = test_shared();
        let display = Arc::new(Display::new(None));
        let mut streams = Streams::new();
        let mut done = shared.done.subscribe();

        assert!(!*done.borrow_and_update());
        dispatch(&display, &mut streams, &shared, &ins("disconnect", &[]));
        assert!(*done.borrow_and_update());
    }

    #[test]
    fn test_arg_parsing_is_tolerant() {
        let args = vec!["12".to_string(), "nope".to_string()];
        assert_eq!(arg_i32(&args, 0), 12);
        assert_eq!(arg_i32(&args, 1), 0);
        assert_eq!(arg_i32(&args, 9), 0);
        assert_eq!(arg_str(&args, 1), "nope");
        assert_eq!(arg_str(&args, 9), "");
    }

    #[test]
    fn test_state_transitions_are_forward_only() {
        let state = AtomicU8::new(SessionState::Handshake as u8);
        state.fetch_max(SessionState::Active as u8, Ordering::AcqRel);
        assert_eq!(SessionState::from_u8(state.load(Ordering::Acquire)), SessionState::Active);

        state.fetch_max(SessionState::Closed as u8, Ordering::AcqRel);
        // A late transition back to Active must not reopen the session.
        state.fetch_max(SessionState::Active as u8, Ordering::AcqRel);
        assert_eq!(SessionState::from_u8(state.load(Ordering::Acquire)), SessionState::Closed);
    }
}
