//! Per-request stream state machine and the per-connection stream table.
//!
//! A stream is one logical conversation multiplexed onto a connection,
//! keyed by request id. Each half (inbound, outbound) closes independently
//! via `STREAM_END`; `STREAM_RST` terminates both at once. The table is
//! touched only by the connection's reader (binding inbound frames) and
//! writer loop (validating outbound frames), so a plain mutex suffices.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use skua_wire::FrameFlags;

use crate::errors::FrameError;

#[derive(Debug, Default)]
struct StreamState {
    in_closed: bool,
    out_closed: bool,
    rst_sent: bool,
}

/// One logical conversation on a connection.
#[derive(Debug)]
pub struct Stream {
    id: u64,
    state: Mutex<StreamState>,
}

impl Stream {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: Mutex::new(StreamState::default()),
        }
    }

    /// First inbound frame decides the initial state: a request without
    /// `STREAM` arrives complete, so its inbound half closes immediately.
    fn new_inbound(id: u64, flags: FrameFlags) -> Self {
        let mut state = StreamState::default();
        if flags.contains(FrameFlags::STREAM_RST) {
            state.in_closed = true;
            state.out_closed = true;
        } else if !flags.contains(FrameFlags::STREAM) || flags.contains(FrameFlags::STREAM_END) {
            state.in_closed = true;
        }
        Self {
            id,
            state: Mutex::new(state),
        }
    }

    /// The request id this stream is keyed by.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this side can no longer write: the outbound half is closed
    /// or a reset was sent.
    pub fn is_self_closed(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.out_closed || state.rst_sent
    }

    /// Whether both halves are closed.
    pub fn is_closed(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.in_closed && state.out_closed
    }

    /// Validate and apply an outbound frame.
    ///
    /// Returns `false` when the frame must not be written: a repeated
    /// `STREAM_RST`, or a normal frame on a closed outbound half.
    /// `STREAM_RST` wins when combined with `STREAM_END`.
    pub(crate) fn add_out_frame(&self, flags: FrameFlags) -> bool {
        let mut state = self.state.lock().unwrap();
        if flags.contains(FrameFlags::STREAM_RST) {
            if state.rst_sent {
                return false;
            }
            state.rst_sent = true;
            state.in_closed = true;
            state.out_closed = true;
            return true;
        }
        if state.out_closed {
            return false;
        }
        if flags.contains(FrameFlags::STREAM_END) {
            state.out_closed = true;
        }
        true
    }

    /// Apply an inbound frame. Returns `false` for data after the inbound
    /// half closed, which is a protocol violation.
    fn add_in_frame(&self, flags: FrameFlags) -> bool {
        let mut state = self.state.lock().unwrap();
        if flags.contains(FrameFlags::STREAM_RST) {
            state.in_closed = true;
            state.out_closed = true;
            return true;
        }
        if state.in_closed {
            return false;
        }
        if flags.contains(FrameFlags::STREAM_END) {
            state.in_closed = true;
        }
        true
    }
}

/// Per-connection map of live streams.
#[derive(Debug, Default)]
pub(crate) struct StreamTable {
    streams: Mutex<HashMap<u64, Arc<Stream>>>,
}

impl StreamTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Look up a live stream.
    pub(crate) fn get(&self, id: u64) -> Option<Arc<Stream>> {
        self.streams.lock().unwrap().get(&id).cloned()
    }

    /// Create the stream for `id` or return the existing one.
    ///
    /// Used on the write side, where the first response frame opens the
    /// stream if the reader has not already.
    pub(crate) fn create_or_get(&self, id: u64) -> Arc<Stream> {
        self.streams
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| Arc::new(Stream::new(id)))
            .clone()
    }

    /// Drop a stream, usually after a reset terminated it.
    pub(crate) fn remove(&self, id: u64) {
        self.streams.lock().unwrap().remove(&id);
    }

    /// Bind an inbound frame to its stream, enforcing the read-side rules:
    /// `STREAM_END`/`STREAM_RST` without `STREAM` must reference a live
    /// stream, and a non-reset frame after the inbound half closed is a
    /// protocol violation.
    pub(crate) fn bind_in_frame(
        &self,
        id: u64,
        flags: FrameFlags,
    ) -> Result<Arc<Stream>, FrameError> {
        let mut streams = self.streams.lock().unwrap();
        match streams.get(&id) {
            Some(stream) => {
                let stream = stream.clone();
                if !stream.add_in_frame(flags) {
                    return Err(FrameError::InvalidPacket);
                }
                if flags.contains(FrameFlags::STREAM_RST) {
                    streams.remove(&id);
                }
                Ok(stream)
            }
            None => {
                if flags.intersects(FrameFlags::STREAM_END | FrameFlags::STREAM_RST)
                    && !flags.contains(FrameFlags::STREAM)
                {
                    // continuation for an id that was never opened
                    return Err(FrameError::InvalidPacket);
                }
                let stream = Arc::new(Stream::new_inbound(id, flags));
                if !flags.contains(FrameFlags::STREAM_RST) {
                    streams.insert(id, stream.clone());
                }
                Ok(stream)
            }
        }
    }
}
