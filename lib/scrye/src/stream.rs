use flint::encoding::base64;
use hashbrown::HashMap;
use image::RgbaImage;
use std::fmt;

/// Failure to turn an assembled stream into pixels.
#[derive(Debug)]
pub enum ImageError {
    /// The stream text is not valid base64.
    Encoding(base64::DecodeError),
    /// The decoded bytes are not a recognizable PNG or JPEG image.
    Undecodable,
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageError::Encoding(e) => write!(f, "stream is not base64: {}", e),
            ImageError::Undecodable => f.write_str("stream bytes are not a supported image"),
        }
    }
}

impl std::error::Error for ImageError {}

/// Invoked with the finished stream when its terminating instruction
/// arrives.
pub type OnEnd = Box<dyn FnOnce(Stream) + Send>;

/// An incoming multi-chunk data channel. Chunks arrive base64-encoded and
/// are accumulated verbatim until the stream ends.
pub struct Stream {
    buffer: String,
    on_end: Option<OnEnd>,
}

impl Stream {
    fn new() -> Stream {
        Stream {
            buffer: String::new(),
            on_end: None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Decodes the accumulated chunks into an RGBA image, auto-detecting the
    /// container format from the byte content.
    pub fn image(&self) -> Result<RgbaImage, ImageError> {
        let bytes = base64::decode(&self.buffer).map_err(ImageError::Encoding)?;
        let img = image::load_from_memory(&bytes).map_err(|_| ImageError::Undecodable)?;
        Ok(img.to_rgba8())
    }
}

/// The per-connection registry of incoming streams, keyed by the index the
/// server chose. Streams come into existence on first reference.
pub struct Streams {
    map: HashMap<i32, Stream>,
}

impl Streams {
    pub fn new() -> Streams {
        Streams {
            map: HashMap::new(),
        }
    }

    fn get(&mut self, id: i32) -> &mut Stream {
        self.map.entry(id).or_insert_with(Stream::new)
    }

    /// Appends a chunk of base64 text to the stream.
    pub fn append(&mut self, id: i32, data: &str) {
        self.get(id).buffer.push_str(data);
    }

    /// Installs the completion callback for a stream.
    pub fn set_on_end(&mut self, id: i32, on_end: OnEnd) {
        self.get(id).on_end = Some(on_end);
    }

    /// Terminates a stream: fires its completion callback and drops the
    /// entry. A subsequent reference to the same index starts a fresh
    /// stream.
    pub fn end(&mut self, id: i32) {
        if let Some(mut stream) = self.map.remove(&id) {
            if let Some(on_end) = stream.on_end.take() {
                on_end(stream);
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn png_base64(width: u32, height: u32, px: [u8; 4]) -> String {
        let img = RgbaImage::from_pixel(width, height, image::Rgba(px));
        let mut bytes = Cursor::new(Vec::new());
        img.write_to(&mut bytes, image::ImageFormat::Png).unwrap();
        base64::encode(bytes.get_ref())
    }

    #[test]
    fn test_append_accumulates() {
        let mut streams = Streams::new();
        streams.append(3, "YWJj");
        streams.append(3, "ZGVm");
        assert_eq!(streams.get(3).buffer, "YWJjZGVm");
    }

    #[test]
    fn test_end_fires_callback_and_drops() {
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();

        let mut streams = Streams::new();
        streams.append(1, "YWJj");
        streams.set_on_end(
            1,
            Box::new(move |stream| {
                assert_eq!(stream.len(), 4);
                observed.fetch_add(1, Ordering::SeqCst);
            }),
        );
        streams.end(1);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(streams.len(), 0);
        // The index is fresh again.
        assert_eq!(streams.get(1).len(), 0);
    }

    #[test]
    fn test_end_without_callback() {
        let mut streams = Streams::new();
        streams.append(9, "x");
        streams.end(9);
        streams.end(9);
        assert_eq!(streams.len(), 0);
    }

    #[test]
    fn test_image_decode() {
        let mut streams = Streams::new();
        let encoded = png_base64(2, 2, [10, 20, 30, 255]);
        // Deliver in two chunks to exercise reassembly.
        let (head, tail) = encoded.split_at(encoded.len() / 2);
        streams.append(0, head);
        streams.append(0, tail);

        let img = streams.get(0).image().unwrap();
        assert_eq!(img.dimensions(), (2, 2));
        assert_eq!(*img.get_pixel(1, 1), image::Rgba([10, 20, 30, 255]));
    }

    #[test]
    fn test_image_decode_failures() {
        let mut streams = Streams::new();
        streams.append(0, "@@not-base64@@");
        assert!(matches!(
            streams.get(0).image(),
            Err(ImageError::Encoding(_))
        ));

        let mut streams = Streams::new();
        streams.append(0, &base64::encode(b"definitely not a png"));
        assert!(matches!(streams.get(0).image(), Err(ImageError::Undecodable)));
    }
}
