use crate::config::Credentials;
use crate::driver::{self, DriverCmd, DriverError, DriverUser, LogLevel};
use crate::errdefs::ServiceError;
use crate::proxy::MapLock;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use flint::ident;
use flint::logging::{self, debug, info, warn, Logger};
use flint::pool::Pool;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use scrye::clipboard::Clipboard;
use scrye::protocol::instruction::MAX_INSTRUCTION_LENGTH;
use scrye::protocol::{self, IoError, ParseError};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};

/// Per-read granularity of the blocking user pumps. Small enough that a
/// shutdown is observed almost immediately.
const IO_READ_TIMEOUT: Duration = Duration::from_millis(15);

/// Upper bound on clipboard state retained per session.
const CLIPBOARD_MAX_SIZE: usize = 256 * 1024;

/// Lifecycle of a shared session.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Lifecycle {
    Initializing = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

/// A shared backend session: one driver connection to a remote desktop,
/// shared by every viewer holding the same credential fingerprint.
///
/// The driver itself lives on a dedicated OS thread (driver state is not
/// thread safe); joins and leaves are marshalled to it over a command
/// channel. Viewers block inside [`Session::join`] until they disconnect.
pub struct Session {
    id: String,
    protocol: String,
    commands: std::sync::mpsc::Sender<DriverCmd>,
    users: AtomicUsize,
    lifecycle: AtomicU8,
    clipboard: Clipboard,
    streams: Pool,
    log: Logger,
}

impl Session {
    /// Spawns the driver thread for a new shared session and waits for the
    /// driver to come up.
    pub async fn new(protocol: &str, mode: &str, log: &Logger) -> Result<Arc<Session>, ServiceError> {
        let id = ident::new_id(ident::SESSION_PREFIX);
        let log = log.new(logging::o!("session" => id.clone()));

        let (commands, command_rx) = std::sync::mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread_log = log.new(logging::o!());
        let thread_protocol = protocol.to_string();
        let thread_mode = mode.to_string();
        std::thread::Builder::new()
            .name(format!("driver-{}", id))
            .spawn(move || run_driver(thread_protocol, thread_mode, ready_tx, command_rx, thread_log))
            .map_err(ServiceError::Transport)?;

        match ready_rx.await {
            Ok(Ok(())) => (),
            Ok(Err(e)) => return Err(ServiceError::Driver(e)),
            Err(_) => return Err(ServiceError::SessionClosed),
        }

        info!(log, "session created"; "protocol" => %protocol);
        Ok(Arc::new(Session {
            id,
            protocol: protocol.to_string(),
            commands,
            users: AtomicUsize::new(0),
            lifecycle: AtomicU8::new(Lifecycle::Active as u8),
            clipboard: Clipboard::new(CLIPBOARD_MAX_SIZE),
            streams: Pool::new(0),
            log,
        }))
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Number of currently connected viewers.
    #[inline]
    pub fn user_count(&self) -> usize {
        self.users.load(Ordering::SeqCst)
    }

    /// The session clipboard, broadcast to every joining viewer.
    #[inline]
    pub fn clipboard(&self) -> &Clipboard {
        &self.clipboard
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        match self.lifecycle.load(Ordering::Acquire) {
            0 => Lifecycle::Initializing,
            1 => Lifecycle::Active,
            2 => Lifecycle::Closing,
            _ => Lifecycle::Closed,
        }
    }

    /// Attaches a viewer socket to the shared session and serves it until
    /// the viewer or the backend disconnects.
    ///
    /// The multiplexer's map guard is released through `lock` once the
    /// driver has accepted the user, so concurrent joins for the same
    /// fingerprint always observe a fully initialised session.
    pub async fn join(
        &self,
        mut ws: WebSocket,
        creds: &Credentials,
        owner: bool,
        mut lock: MapLock,
    ) -> Result<(), ServiceError> {
        // 1. The socket pair carrying this user's protocol traffic.
        let (driver_end, proxy_end) = match StdUnixStream::pair() {
            Ok(pair) => pair,
            Err(e) => {
                lock.release();
                return Err(ServiceError::Transport(e));
            }
        };

        let (host, port) = match creds.host_port() {
            Ok(parts) => parts,
            Err(e) => {
                lock.release();
                self.refuse(ws, &e).await;
                return Err(e);
            }
        };

        // 2. Count the user in before the driver sees it, so teardown never
        // races a half-attached user.
        self.users.fetch_add(1, Ordering::SeqCst);

        // 3. Hand the driver its end and fill in the handshake arguments.
        let (reply_tx, reply_rx) = oneshot::channel();
        let join_cmd = DriverCmd::Join {
            socket: driver_end,
            owner,
            host,
            port,
            username: creds.username.clone(),
            password: creds.password.clone(),
            reply: reply_tx,
        };
        let attach_result = match self.commands.send(join_cmd) {
            Ok(()) => match reply_rx.await {
                Ok(result) => result,
                Err(_) => Err(DriverError::Refused("driver thread exited".into())),
            },
            Err(_) => Err(DriverError::Refused("session is shutting down".into())),
        };
        let user = match attach_result {
            Ok(user) => user,
            Err(e) => {
                self.leave(None).await;
                lock.release();
                let err = ServiceError::Driver(e);
                self.refuse(ws, &err).await;
                return Err(err);
            }
        };

        // 4. The session is now safe to share.
        lock.release();
        info!(self.log, "user joined"; "user" => %user.id(), "owner" => owner,
            "total" => self.user_count());

        // 5. Late joiners receive the current clipboard before any traffic
        // flows.
        if let Err(e) = self.send_clipboard(&mut ws).await {
            warn!(self.log, "clipboard sync failed"; "error" => %e);
        }

        // 6. Pump the driver against its socket end until it reports
        // disconnect.
        let mut user = user;
        let user_log = self.log.new(logging::o!());
        let user_io = tokio::task::spawn_blocking(move || {
            let result = user.run_io(IO_READ_TIMEOUT);
            if let Err(e) = &result {
                warn!(user_log, "user io ended with error"; "error" => %e);
            }
            user
        });

        // 7. Bridge the viewer socket and the proxy-side socket end.
        let bridge_result = match into_tokio(proxy_end) {
            Ok(stream) => serve_io(stream, ws, &self.log).await,
            Err(e) => Err(ServiceError::Transport(e)),
        };

        // 8. Unwind: the bridge closed the proxy end, which unblocks the
        // user pump; then detach the user and drop the refcount.
        match user_io.await {
            Ok(user) => self.leave(Some(user)).await,
            Err(_) => self.leave(None).await,
        }

        bridge_result
    }

    /// Detaches a finished user from the driver and closes the session when
    /// the last one leaves.
    async fn leave(&self, user: Option<Box<dyn DriverUser>>) {
        if let Some(user) = user {
            let (reply_tx, reply_rx) = oneshot::channel();
            if self
                .commands
                .send(DriverCmd::Leave { user, reply: reply_tx })
                .is_ok()
            {
                let _ = reply_rx.await;
            }
        }

        if self.users.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.close();
        }
    }

    /// Shuts the driver down. Idempotent; only the first call reaches the
    /// driver thread.
    pub fn close(&self) {
        let previous = self
            .lifecycle
            .fetch_max(Lifecycle::Closing as u8, Ordering::AcqRel);
        if previous >= Lifecycle::Closing as u8 {
            return;
        }

        let _ = self.commands.send(DriverCmd::Shutdown);
        self.lifecycle
            .store(Lifecycle::Closed as u8, Ordering::Release);
        info!(self.log, "session closed");
    }

    async fn send_clipboard(&self, ws: &mut WebSocket) -> Result<(), ServiceError> {
        if self.clipboard.is_empty() {
            return Ok(());
        }

        // Server-initiated streams use odd indices; viewer-initiated use
        // even ones.
        let index = self.streams.next() * 2 + 1;
        let mut frames = Vec::new();
        let _ = self.clipboard.send::<_, ()>(index, |ins| {
            frames.push(ins);
            Ok(())
        });
        self.streams.free((index - 1) / 2);

        for ins in frames {
            ws.send(Message::Text(ins.encode()))
                .await
                .map_err(|e| ServiceError::Handshake(e.to_string()))?;
        }
        Ok(())
    }

    /// Best-effort close frame describing why a join was refused.
    async fn refuse(&self, mut ws: WebSocket, error: &ServiceError) {
        let _ = ws
            .send(Message::Close(Some(CloseFrame {
                code: 1011,
                reason: error.to_string().into(),
            })))
            .await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Backstop only; the normal path closes on the last leave.
        let _ = self.commands.send(DriverCmd::Shutdown);
    }
}

/// Body of the per-session driver thread. Owns the driver for its entire
/// life, so the driver only ever sees single-threaded access.
fn run_driver(
    protocol: String,
    mode: String,
    ready: oneshot::Sender<Result<(), DriverError>>,
    commands: std::sync::mpsc::Receiver<DriverCmd>,
    log: Logger,
) {
    let mut driver = match driver::load(&protocol, &log) {
        Ok(driver) => driver,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    driver.set_log_level(LogLevel::from_mode(&mode));
    if let Err(e) = driver.load_protocol(&protocol) {
        driver.free();
        let _ = ready.send(Err(e));
        return;
    }
    let _ = ready.send(Ok(()));

    while let Ok(command) = commands.recv() {
        match command {
            DriverCmd::Join {
                socket,
                owner,
                host,
                port,
                username,
                password,
                reply,
            } => {
                let args = prepare_args(driver.args(), &host, &port, &username, &password);
                let _ = reply.send(driver.add_user(socket, owner, args));
            }
            DriverCmd::Leave { user, reply } => {
                driver.remove_user(user);
                let _ = reply.send(());
            }
            DriverCmd::Shutdown => break,
        }
    }

    driver.free();
    debug!(log, "driver thread exited");
}

/// Fills the driver's declared argument list from the join credentials.
/// Parameters the driver asks for beyond the known four stay blank.
fn prepare_args(
    names: &[String],
    host: &str,
    port: &str,
    username: &str,
    password: &str,
) -> Vec<String> {
    names
        .iter()
        .map(|name| match name.as_str() {
            "hostname" => host.to_string(),
            "port" => port.to_string(),
            "username" => username.to_string(),
            "password" => password.to_string(),
            _ => String::new(),
        })
        .collect()
}

fn into_tokio(stream: StdUnixStream) -> std::io::Result<UnixStream> {
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

/// Shuttles bytes between the viewer socket and the backend socket until
/// either side closes. Whichever pump fails first posts its error to the
/// shared channel and that error is the bridge's outcome; the second pump is
/// woken via the shared signal and drains before the bridge returns, so
/// every byte accepted from one side has been written to the other.
pub(crate) async fn serve_io(
    backend: UnixStream,
    ws: WebSocket,
    log: &Logger,
) -> Result<(), ServiceError> {
    let (backend_rd, backend_wr) = backend.into_split();
    let (ws_tx, ws_rx) = ws.split();

    let (done_tx, done_rx) = watch::channel(false);
    let done_tx = Arc::new(done_tx);
    // Both pumps post into the same channel; arrival order decides which
    // failure the bridge reports.
    let (err_tx, mut err_rx) = mpsc::channel(2);

    let desktop = tokio::spawn(desktop_to_viewer(
        backend_rd,
        ws_tx,
        err_tx.clone(),
        done_tx.clone(),
        done_rx.clone(),
    ));
    let viewer = tokio::spawn(viewer_to_desktop(ws_rx, backend_wr, err_tx, done_tx, done_rx));

    let _ = desktop.await;
    let _ = viewer.await;
    debug!(log, "bridge pumps terminated");

    match err_rx.try_recv() {
        Ok(first) => Err(first),
        Err(_) => Ok(()),
    }
}

/// Backend to viewer: one length-delimited frame per socket message.
async fn desktop_to_viewer(
    backend: OwnedReadHalf,
    mut ws: SplitSink<WebSocket, Message>,
    errors: mpsc::Sender<ServiceError>,
    done: Arc<watch::Sender<bool>>,
    mut done_rx: watch::Receiver<bool>,
) {
    let mut input = BufReader::with_capacity(MAX_INSTRUCTION_LENGTH * 4, backend);
    let mut raw = Vec::new();

    let result = loop {
        let read = tokio::select! {
            _ = done_rx.changed() => break Ok(()),
            read = protocol::io::read_frame(&mut input, &mut raw) => read,
        };
        match read {
            Ok(_) => (),
            // The driver hung up; a clean end of the bridge.
            Err(IoError::Closed) => break Ok(()),
            Err(IoError::Parse(e)) => break Err(ServiceError::Protocol(e)),
            Err(IoError::Io(e)) => break Err(ServiceError::Transport(e)),
        }

        let text = match String::from_utf8(raw.clone()) {
            Ok(text) => text,
            Err(_) => break Err(ServiceError::Protocol(ParseError::BadRune)),
        };
        if let Err(e) = ws.send(Message::Text(text)).await {
            break Err(ServiceError::Handshake(e.to_string()));
        }
    };

    if let Err(e) = result {
        let _ = errors.try_send(e);
    }
    let _ = done.send(true);
    let _ = ws.close().await;
}

/// Viewer to backend: raw message bytes, frames preserved verbatim.
async fn viewer_to_desktop(
    mut ws: SplitStream<WebSocket>,
    mut backend: OwnedWriteHalf,
    errors: mpsc::Sender<ServiceError>,
    done: Arc<watch::Sender<bool>>,
    mut done_rx: watch::Receiver<bool>,
) {
    let result = loop {
        let message = tokio::select! {
            _ = done_rx.changed() => break Ok(()),
            message = ws.next() => message,
        };
        let bytes = match message {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Close(_))) | None => break Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Err(ServiceError::Handshake(e.to_string())),
        };
        if let Err(e) = backend.write_all(&bytes).await {
            break Err(ServiceError::Transport(e));
        }
    };

    if let Err(e) = result {
        let _ = errors.try_send(e);
    }
    let _ = done.send(true);
    let _ = backend.shutdown().await;
}
