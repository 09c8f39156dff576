//! Request multiplexer: routes each frame's `cmd` to a registered handler.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use skua_wire::Cmd;
use tracing::warn;

use crate::conn::RequestFrame;
use crate::framing::FrameWriter;

/// An object-safe asynchronous request handler.
///
/// The returned future runs inline on the connection's dispatch loop for
/// blocking requests, or on its own task for `NON_BLOCK` requests. Either
/// way it shares the connection's single writer loop, so distinct frames
/// never interleave on the socket.
pub trait Handler: Send + Sync {
    /// Serve one request.
    fn serve(
        &self,
        writer: FrameWriter,
        frame: RequestFrame,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Adapter so plain async closures can serve requests.
pub struct HandlerFunc<F>(pub F);

impl<F, Fut> Handler for HandlerFunc<F>
where
    F: Fn(FrameWriter, RequestFrame) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn serve(
        &self,
        writer: FrameWriter,
        frame: RequestFrame,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin((self.0)(writer, frame))
    }
}

/// Routes requests by command id. Registration happens at program
/// initialization; dispatch is read-mostly.
#[derive(Default)]
pub struct ServeMux {
    handlers: RwLock<HashMap<Cmd, Arc<dyn Handler>>>,
}

impl ServeMux {
    /// Create an empty mux.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `cmd`.
    ///
    /// # Panics
    ///
    /// Panics on duplicate registration; that is a programming error, not
    /// a runtime condition.
    pub fn handle(&self, cmd: Cmd, handler: Arc<dyn Handler>) {
        let mut handlers = self.handlers.write().unwrap();
        if handlers.contains_key(&cmd) {
            panic!("skua: multiple registrations for cmd {cmd}");
        }
        handlers.insert(cmd, handler);
    }

    /// Register an async closure for `cmd`.
    pub fn handle_func<F, Fut>(&self, cmd: Cmd, f: F)
    where
        F: Fn(FrameWriter, RequestFrame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handle(cmd, Arc::new(HandlerFunc(f)));
    }
}

impl Handler for ServeMux {
    fn serve(
        &self,
        writer: FrameWriter,
        frame: RequestFrame,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let handler = self.handlers.read().unwrap().get(&frame.cmd).cloned();
        match handler {
            Some(handler) => Box::pin(async move { handler.serve(writer, frame).await }),
            None => {
                // unregistered commands are dropped without a response;
                // peers waiting on one will hit their own deadline
                warn!(cmd = frame.cmd, "no handler registered, dropping request");
                Box::pin(async {})
            }
        }
    }
}
