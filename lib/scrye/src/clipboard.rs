use crate::protocol::Instruction;
use flint::encoding::base64;
use parking_lot::Mutex;

/// The maximum number of bytes to pack into an individual blob when
/// transmitting the clipboard contents to a connected viewer.
pub const CLIPBOARD_BLOCK_SIZE: usize = 4096;

/// A bounded, typed clipboard buffer shared by all viewers of a session.
///
/// The lock restricts simultaneous access, guaranteeing ordered
/// modifications and that edits never interleave with an in-progress
/// broadcast.
pub struct Clipboard {
    max_size: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    mimetype: String,
    buffer: Vec<u8>,
}

impl Clipboard {
    /// Creates a clipboard holding at most `max_size` bytes.
    pub fn new(max_size: usize) -> Clipboard {
        Clipboard {
            max_size,
            inner: Mutex::new(Inner {
                mimetype: String::new(),
                buffer: Vec::new(),
            }),
        }
    }

    /// Clears the contents and assigns a new mimetype for future data.
    pub fn reset(&self, mimetype: &str) {
        let mut inner = self.inner.lock();
        inner.buffer.clear();
        inner.mimetype = mimetype.to_string();
    }

    /// Appends data to the current contents, silently dropping whatever
    /// exceeds the size cap. The data must match the mimetype chosen by the
    /// preceding `reset`.
    pub fn append(&self, data: &[u8]) {
        let mut inner = self.inner.lock();
        let room = self.max_size.saturating_sub(inner.buffer.len());
        let take = room.min(data.len());
        inner.buffer.extend_from_slice(&data[..take]);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Streams the contents through the sink as a `clipboard` stream-open,
    /// base64 blobs of at most `CLIPBOARD_BLOCK_SIZE` source bytes each, and
    /// a stream-end. The whole broadcast runs under the clipboard lock.
    pub fn send<F, E>(&self, stream_index: i32, mut sink: F) -> Result<(), E>
    where
        F: FnMut(Instruction) -> Result<(), E>,
    {
        let inner = self.inner.lock();
        let index = stream_index.to_string();

        sink(Instruction::new(
            "clipboard",
            vec![index.clone(), inner.mimetype.clone()],
        ))?;

        for block in inner.buffer.chunks(CLIPBOARD_BLOCK_SIZE) {
            sink(Instruction::new(
                "blob",
                vec![index.clone(), base64::encode(block)],
            ))?;
        }

        sink(Instruction::new("end", vec![index]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(clipboard: &Clipboard, index: i32) -> Vec<Instruction> {
        let mut out = Vec::new();
        clipboard
            .send::<_, ()>(index, |ins| {
                out.push(ins);
                Ok(())
            })
            .unwrap();
        out
    }

    #[test]
    fn test_send_splits_into_blocks() {
        let clipboard = Clipboard::new(1 << 20);
        clipboard.reset("text/plain");
        clipboard.append(&vec![b'x'; 5000]);
        assert_eq!(clipboard.len(), 5000);

        let out = collect(&clipboard, 7);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], Instruction::new("clipboard", vec!["7".into(), "text/plain".into()]));

        let first = base64::decode(&out[1].args[1]).unwrap();
        let second = base64::decode(&out[2].args[1]).unwrap();
        assert_eq!(out[1].opcode, "blob");
        assert_eq!(first.len(), 4096);
        assert_eq!(second.len(), 904);

        assert_eq!(out[3], Instruction::new("end", vec!["7".into()]));
    }

    #[test]
    fn test_append_respects_cap() {
        let clipboard = Clipboard::new(100);
        clipboard.reset("text/plain");
        clipboard.append(&vec![1u8; 60]);
        clipboard.append(&vec![2u8; 60]);
        assert_eq!(clipboard.len(), 100);

        let out = collect(&clipboard, 0);
        let total: usize = out
            .iter()
            .filter(|ins| ins.expect("blob"))
            .map(|ins| base64::decode(&ins.args[1]).unwrap().len())
            .sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_reset_replaces_mimetype() {
        let clipboard = Clipboard::new(100);
        clipboard.reset("text/plain");
        clipboard.append(b"hello");
        clipboard.reset("image/png");
        assert!(clipboard.is_empty());

        let out = collect(&clipboard, 1);
        assert_eq!(out[0].args[1], "image/png");
        // No payload, so the open is followed directly by the end.
        assert_eq!(out.len(), 2);
    }
}
