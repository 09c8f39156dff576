//! skua: a framed, multiplexed, bidirectional RPC server.
//!
//! A skua server listens on one or more TCP bindings and multiplexes many
//! logical request/response streams over each accepted connection. Frames
//! are length-prefixed (see `skua-wire`); streams are keyed by request id
//! and support end and reset semantics; handlers may run inline (ordered
//! per connection) or concurrently (`NON_BLOCK`); the server can push
//! frames of its own at any time.
//!
//! Per connection there is exactly one reader task, one writer task and
//! one dispatch loop. The reader hands the dispatcher one frame at a time
//! through a single-slot gate, which bounds memory and produces natural
//! backpressure; the writer task is the only thing that touches the socket
//! write half, so bytes of distinct frames never interleave.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use skua::{FrameFlags, Server, ServerBinding, ServeMux};
//!
//! let mux = Arc::new(ServeMux::new());
//! mux.handle_func(1, |mut writer, frame| async move {
//!     writer.start_write(frame.request_id, frame.cmd, FrameFlags::STREAM_END);
//!     writer.write_bytes(&frame.payload);
//!     writer.end_write().await.ok();
//! });
//!
//! let server = Server::new(vec![ServerBinding::new("0.0.0.0:8443", mux)]);
//! server.listen_and_serve().await?;
//! ```

mod conn;
mod errors;
mod framing;
mod metrics;
mod mux;
mod server;
mod stream;

pub use conn::{ConnectionInfo, RequestFrame, ServeConn};
pub use errors::{FrameError, ServerError, WriteError};
pub use framing::{FrameWriter, ReaderConfig};
pub use metrics::LatencyObserver;
pub use mux::{Handler, HandlerFunc, ServeMux};
pub use server::{Server, ServerBinding};
pub use stream::Stream;

pub use skua_wire::{
    Cmd, DEFAULT_MAX_FRAME_SIZE, Frame, FrameFlags, HEADER_LEN, Header, decode_header,
};
