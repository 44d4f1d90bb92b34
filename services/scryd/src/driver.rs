use flint::ident;
use flint::logging::{self, debug, info, Logger};
use scrye::protocol::{Instruction, InstructionIo, IoError};
use std::fmt;
use std::io;
use std::os::unix::net::UnixStream;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Log levels understood by backend drivers, a subset of RFC 5424.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 3,
    Warning = 4,
    Info = 6,
    Debug = 7,
    Trace = 8,
}

impl LogLevel {
    /// Maps the deployment mode onto a driver log policy.
    pub fn from_mode(mode: &str) -> LogLevel {
        match mode {
            "release" => LogLevel::Error,
            "test" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }
}

/// Failures raised by backend drivers.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no backend compiled in for protocol {0:?}")]
    NotSupported(String),
    #[error("driver refused the user: {0}")]
    Refused(String),
    #[error("driver i/o: {0}")]
    Io(#[from] io::Error),
}

/// A native remote-desktop backend. One driver instance serves one shared
/// session; it is owned by that session's pinned thread, so implementations
/// never observe concurrent access to their connection state.
pub trait Driver: Send {
    /// Prepares the driver for the named protocol. The connection to the
    /// remote desktop is typically not established until the owner joins.
    fn load_protocol(&mut self, name: &str) -> Result<(), DriverError>;

    /// Caps the driver's own log verbosity.
    fn set_log_level(&mut self, level: LogLevel);

    /// The ordered parameter names the driver expects at join time.
    fn args(&self) -> &[String];

    /// Attaches a user to the shared connection. The returned handle pumps
    /// that user's half of the traffic from a separate blocking task.
    fn add_user(
        &mut self,
        socket: UnixStream,
        owner: bool,
        args: Vec<String>,
    ) -> Result<Box<dyn DriverUser>, DriverError>;

    /// Detaches a user after its I/O pump has finished.
    fn remove_user(&mut self, user: Box<dyn DriverUser>);

    /// Releases every driver resource. Called exactly once, after the last
    /// user left.
    fn free(&mut self);
}

/// The per-user half of a driver: a blocking traffic pump bound to one end
/// of the user's socket pair.
pub trait DriverUser: Send {
    fn id(&self) -> &str;

    /// Pumps instructions for this user until the peer disconnects. Reads
    /// poll at the given granularity so shutdown is observed promptly.
    fn run_io(&mut self, read_timeout: Duration) -> Result<(), DriverError>;
}

impl fmt::Debug for dyn DriverUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DriverUser({})", self.id())
    }
}

/// Commands marshalled to a session's pinned driver thread.
pub enum DriverCmd {
    /// Attach a new user: the driver-side socket end plus the handshake
    /// parameters filled in from the user's credentials.
    Join {
        socket: UnixStream,
        owner: bool,
        host: String,
        port: String,
        username: String,
        password: String,
        reply: oneshot::Sender<Result<Box<dyn DriverUser>, DriverError>>,
    },
    /// Detach a user whose I/O pump has finished.
    Leave {
        user: Box<dyn DriverUser>,
        reply: oneshot::Sender<()>,
    },
    /// Release the driver and end the thread.
    Shutdown,
}

/// Instantiates the driver registered for a protocol name. The native
/// vnc/rdp/ssh backends plug in here; the built-in loopback driver serves
/// wiring diagnostics and tests.
pub fn load<'a, L: Into<Option<&'a Logger>>>(
    protocol: &str,
    log: L,
) -> Result<Box<dyn Driver>, DriverError> {
    match protocol {
        "loopback" => Ok(Box::new(LoopbackDriver::new(log))),
        other => Err(DriverError::NotSupported(other.to_string())),
    }
}

/// A driver that terminates the protocol locally: it paints a fixed test
/// pattern into every joining user's display, acknowledges transfer
/// requests, and echoes sync fences until the user disconnects. No remote
/// host is contacted.
pub struct LoopbackDriver {
    args: Vec<String>,
    level: LogLevel,
    users: usize,
    log: Logger,
}

/// Desktop geometry announced by the loopback driver.
const LOOPBACK_WIDTH: i32 = 1024;
const LOOPBACK_HEIGHT: i32 = 768;
const LOOPBACK_DPI: i32 = 96;

/// Test pattern colours: a dark backdrop with a teal badge.
const BACKDROP: [u8; 4] = [26, 26, 26, 255];
const BADGE: [u8; 4] = [0, 168, 154, 255];
const BADGE_SIZE: u32 = 64;
const BADGE_POS: (i32, i32) = (32, 32);

/// Status code reported when acknowledging an unsupported transfer.
const STATUS_UNSUPPORTED: &str = "256";

impl LoopbackDriver {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> LoopbackDriver {
        LoopbackDriver {
            args: vec![
                "hostname".to_string(),
                "port".to_string(),
                "username".to_string(),
                "password".to_string(),
            ],
            level: LogLevel::Info,
            users: 0,
            log: logging::child(log),
        }
    }
}

impl Driver for LoopbackDriver {
    fn load_protocol(&mut self, name: &str) -> Result<(), DriverError> {
        debug!(self.log, "loopback driver loaded"; "protocol" => %name);
        Ok(())
    }

    fn set_log_level(&mut self, level: LogLevel) {
        self.level = level;
    }

    fn args(&self) -> &[String] {
        &self.args
    }

    fn add_user(
        &mut self,
        socket: UnixStream,
        owner: bool,
        args: Vec<String>,
    ) -> Result<Box<dyn DriverUser>, DriverError> {
        if args.len() != self.args.len() {
            return Err(DriverError::Refused(format!(
                "expected {} join arguments, got {}",
                self.args.len(),
                args.len()
            )));
        }

        self.users += 1;
        let user = LoopbackUser {
            id: ident::new_id(ident::USER_PREFIX),
            socket: Some(socket),
            owner,
            log: self.log.new(logging::o!()),
        };
        info!(self.log, "user attached"; "user" => %user.id, "owner" => owner, "total" => self.users);
        Ok(Box::new(user))
    }

    fn remove_user(&mut self, user: Box<dyn DriverUser>) {
        self.users -= 1;
        info!(self.log, "user detached"; "user" => %user.id(), "remaining" => self.users);
    }

    fn free(&mut self) {
        debug!(self.log, "loopback driver freed");
    }
}

struct LoopbackUser {
    id: String,
    socket: Option<UnixStream>,
    owner: bool,
    log: Logger,
}

impl DriverUser for LoopbackUser {
    fn id(&self) -> &str {
        &self.id
    }

    fn run_io(&mut self, read_timeout: Duration) -> Result<(), DriverError> {
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => return Ok(()),
        };
        socket.set_read_timeout(Some(read_timeout))?;
        let mut io = InstructionIo::from_stream(socket)?;

        self.greet(&mut io)?;

        loop {
            let ins = match io.read() {
                Ok(ins) => ins,
                Err(IoError::Io(e))
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(IoError::Closed) => return Ok(()),
                Err(e) => return Err(io_error(e)),
            };

            match ins.opcode.as_str() {
                "disconnect" => {
                    debug!(self.log, "user requested disconnect";
                        "user" => %self.id, "owner" => self.owner);
                    return Ok(());
                }
                "sync" => io.write(&ins).map_err(io_error)?,
                // Transfers are acknowledged, never serviced.
                "file" | "pipe" | "put" | "get" | "audio" => {
                    let index = ins.args.first().cloned().unwrap_or_default();
                    io.write(&Instruction::new(
                        "ack",
                        vec![index, "Unsupported".into(), STATUS_UNSUPPORTED.into()],
                    ))
                    .map_err(io_error)?;
                }
                // Input and clipboard traffic is accepted and dropped.
                _ => (),
            }
        }
    }
}

impl LoopbackUser {
    /// Announces the desktop and paints the test pattern: a full-screen
    /// backdrop fill, a badge streamed as a PNG into a buffer layer and
    /// copied onto the screen, and a cursor cut from the same buffer.
    fn greet(
        &self,
        io: &mut InstructionIo<UnixStream, UnixStream>,
    ) -> Result<(), DriverError> {
        let (w, h) = (LOOPBACK_WIDTH.to_string(), LOOPBACK_HEIGHT.to_string());

        io.write(&Instruction::new(
            "size",
            vec!["0".into(), w.clone(), h.clone(), LOOPBACK_DPI.to_string()],
        ))
        .map_err(io_error)?;

        io.write(&Instruction::new(
            "rect",
            vec!["0".into(), "0".into(), "0".into(), w, h],
        ))
        .map_err(io_error)?;
        io.write(&Instruction::new(
            "cfill",
            vec![
                "12".into(),
                "0".into(),
                BACKDROP[0].to_string(),
                BACKDROP[1].to_string(),
                BACKDROP[2].to_string(),
                BACKDROP[3].to_string(),
            ],
        ))
        .map_err(io_error)?;

        // The badge travels as a PNG stream into scratch buffer -1.
        io.write(&Instruction::new(
            "img",
            vec![
                "1".into(),
                "12".into(),
                "-1".into(),
                "image/png".into(),
                "0".into(),
                "0".into(),
            ],
        ))
        .map_err(io_error)?;
        for chunk in badge_png_base64().as_bytes().chunks(4096) {
            let chunk = std::str::from_utf8(chunk).expect("base64 is ascii");
            io.write(&Instruction::new(
                "blob",
                vec!["1".into(), chunk.to_string()],
            ))
            .map_err(io_error)?;
        }
        io.write(&Instruction::new("end", vec!["1".into()]))
            .map_err(io_error)?;

        io.write(&Instruction::new(
            "copy",
            vec![
                "-1".into(),
                "0".into(),
                "0".into(),
                BADGE_SIZE.to_string(),
                BADGE_SIZE.to_string(),
                "12".into(),
                "0".into(),
                BADGE_POS.0.to_string(),
                BADGE_POS.1.to_string(),
            ],
        ))
        .map_err(io_error)?;

        // An 8x8 corner of the badge doubles as the pointer cursor.
        io.write(&Instruction::new(
            "cursor",
            vec![
                "0".into(),
                "0".into(),
                "-1".into(),
                "0".into(),
                "0".into(),
                "8".into(),
                "8".into(),
            ],
        ))
        .map_err(io_error)?;

        io.write(&Instruction::new(
            "sync",
            vec![flint::time::timestamp_secs().to_string()],
        ))
        .map_err(io_error)
    }
}

/// The badge pixels, PNG-encoded and base64-armoured the way they travel on
/// the wire.
fn badge_png_base64() -> String {
    let badge = image::RgbaImage::from_pixel(BADGE_SIZE, BADGE_SIZE, image::Rgba(BADGE));
    let mut bytes = std::io::Cursor::new(Vec::new());
    badge
        .write_to(&mut bytes, image::ImageFormat::Png)
        .expect("in-memory png encoding cannot fail");
    flint::encoding::base64::encode(bytes.get_ref())
}

fn io_error(e: IoError) -> DriverError {
    match e {
        IoError::Io(e) => DriverError::Io(e),
        other => DriverError::Refused(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        assert!(load("loopback", None).is_ok());
        assert!(matches!(load("vnc", None), Err(DriverError::NotSupported(_))));
        assert!(matches!(load("telnet", None), Err(DriverError::NotSupported(_))));
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(LogLevel::from_mode("release"), LogLevel::Error);
        assert_eq!(LogLevel::from_mode("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from_mode("anything"), LogLevel::Info);
    }

    #[test]
    fn test_loopback_greets_and_disconnects() {
        let mut driver = load("loopback", None).unwrap();
        driver.load_protocol("loopback").unwrap();

        let (driver_end, proxy_end) = UnixStream::pair().unwrap();
        let mut user = driver
            .add_user(
                driver_end,
                true,
                vec!["h".into(), "1".into(), "u".into(), "p".into()],
            )
            .unwrap();

        let pump = std::thread::spawn(move || {
            let result = user.run_io(Duration::from_millis(15));
            (user, result)
        });

        let mut io = InstructionIo::from_stream(proxy_end).unwrap();
        let greeting = io.read().unwrap();
        assert_eq!(greeting.opcode, "size");
        assert_eq!(greeting.args, vec!["0", "1024", "768", "96"]);

        // The test pattern ends with a sync fence.
        let mut seen = Vec::new();
        loop {
            let ins = io.read().unwrap();
            let done = ins.expect("sync");
            seen.push(ins.opcode);
            if done {
                break;
            }
        }
        for expected in ["rect", "cfill", "img", "blob", "end", "copy", "cursor"] {
            assert!(seen.iter().any(|op| op == expected), "missing {}", expected);
        }

        io.write(&Instruction::new("sync", vec!["77".into()])).unwrap();
        let echo = io.read().unwrap();
        assert_eq!(echo.args, vec!["77"]);

        // Transfer requests are acknowledged as unsupported.
        io.write(&Instruction::new(
            "file",
            vec!["4".into(), "text/plain".into(), "notes.txt".into()],
        ))
        .unwrap();
        let ack = io.read().unwrap();
        assert_eq!(ack.opcode, "ack");
        assert_eq!(ack.args, vec!["4", "Unsupported", "256"]);

        io.write(&Instruction::new("disconnect", vec![])).unwrap();
        let (user, result) = pump.join().unwrap();
        result.unwrap();
        driver.remove_user(user);
        driver.free();
    }

    #[test]
    fn test_loopback_rejects_bad_args() {
        let mut driver = load("loopback", None).unwrap();
        let (driver_end, _proxy_end) = UnixStream::pair().unwrap();
        assert!(matches!(
            driver.add_user(driver_end, true, vec![]),
            Err(DriverError::Refused(_))
        ));
    }
}
