use crate::protocol::instruction::{Instruction, ParseError, MAX_INSTRUCTION_LENGTH};
use std::io;
use std::io::{BufRead, Write};

/// Byte capacity reserved for a maximal frame: every codepoint of the
/// instruction budget may occupy up to four bytes.
pub const FRAME_CAPACITY: usize = MAX_INSTRUCTION_LENGTH * 4;

/// Errors produced while shuttling framed instructions over a byte stream.
#[derive(Debug)]
pub enum IoError {
    /// The peer closed the stream, possibly mid-frame.
    Closed,
    /// The stream produced a frame the codec refused.
    Parse(ParseError),
    /// The underlying transport failed.
    Io(io::Error),
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoError::Closed => f.write_str("stream closed"),
            IoError::Parse(e) => write!(f, "parse: {}", e),
            IoError::Io(e) => write!(f, "io: {}", e),
        }
    }
}

impl std::error::Error for IoError {}

impl From<io::Error> for IoError {
    #[inline]
    fn from(e: io::Error) -> Self {
        IoError::Io(e)
    }
}

impl From<ParseError> for IoError {
    #[inline]
    fn from(e: ParseError) -> Self {
        IoError::Parse(e)
    }
}

/// Framed instruction transport over a pair of byte streams. Reads are
/// delimited at the first semicolon; writes are buffered and flushed one
/// whole instruction at a time.
pub struct InstructionIo<R: io::Read, W: io::Write> {
    input: io::BufReader<R>,
    output: io::BufWriter<W>,
    // Bytes of an incomplete frame survive here across timed-out reads.
    pending: Vec<u8>,
}

impl<R: io::Read, W: io::Write> InstructionIo<R, W> {
    pub fn new(reader: R, writer: W) -> InstructionIo<R, W> {
        InstructionIo {
            input: io::BufReader::with_capacity(FRAME_CAPACITY, reader),
            output: io::BufWriter::with_capacity(FRAME_CAPACITY, writer),
            pending: Vec::new(),
        }
    }

    /// Reads raw bytes up to and including the next frame terminator.
    ///
    /// Interrupted reads (timeouts on a polled socket) surface as `Io`
    /// errors but never lose data: the partial frame is kept and the next
    /// call resumes it.
    pub fn read_raw(&mut self) -> Result<Vec<u8>, IoError> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b';') {
                return Ok(self.pending.drain(..=pos).collect());
            }
            if self.pending.len() > FRAME_CAPACITY {
                return Err(ParseError::OverLength.into());
            }

            let count = self.input.read_until(b';', &mut self.pending)?;
            if count == 0 {
                // EOF, either clean or mid-frame. A truncated frame is never
                // a completion.
                return Err(IoError::Closed);
            }
        }
    }

    /// Reads and parses the next instruction.
    pub fn read(&mut self) -> Result<Instruction, IoError> {
        let raw = self.read_raw()?;
        Ok(Instruction::parse(&raw)?)
    }

    /// Writes raw bytes and flushes them to the peer.
    pub fn write_raw(&mut self, raw: &[u8]) -> Result<(), IoError> {
        self.output.write_all(raw)?;
        self.output.flush()?;
        Ok(())
    }

    /// Serializes and writes one instruction.
    pub fn write(&mut self, ins: &Instruction) -> Result<(), IoError> {
        self.write_raw(ins.encode().as_bytes())
    }
}

/// Reads one length-delimited frame from an async buffered reader into
/// `raw` (cleared first), up to and including the terminator. The same
/// framing rule as [`InstructionIo::read_raw`], for the daemon's byte
/// bridge.
pub async fn read_frame<R>(input: &mut R, raw: &mut Vec<u8>) -> Result<usize, IoError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;

    raw.clear();
    let count = input.read_until(b';', raw).await?;
    if count == 0 || raw.last() != Some(&b';') {
        return Err(IoError::Closed);
    }
    if raw.len() > FRAME_CAPACITY {
        return Err(ParseError::OverLength.into());
    }
    Ok(count)
}

impl InstructionIo<std::os::unix::net::UnixStream, std::os::unix::net::UnixStream> {
    /// Wraps both directions of a connected unix socket.
    pub fn from_stream(
        stream: std::os::unix::net::UnixStream,
    ) -> io::Result<InstructionIo<std::os::unix::net::UnixStream, std::os::unix::net::UnixStream>>
    {
        let writer = stream.try_clone()?;
        Ok(InstructionIo::new(stream, writer))
    }
}
