//! Wire protocol and viewer-side engine for the remote desktop proxy:
//! instruction codec, framed I/O, incoming data streams, the layered display
//! compositor and the client session driving it all.

#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]

pub mod client;
pub mod clipboard;
pub mod display;
pub mod keys;
pub mod layer;
pub mod protocol;
pub mod stream;
