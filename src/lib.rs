// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! The connection core of a [Cap'n Proto RPC](https://capnproto.org/rpc.html)
//! vat: a [`Conn`] multiplexes one bidirectional message transport into a
//! bidirectional object-capability RPC session, covering the level-1
//! protocol (bootstrap, calls, promise pipelining, embargoes, and reference
//! counting of exports and imports).
//!
//! # Example
//!
//! ```ignore
//! // Vat A offers a bootstrap capability.
//! let calculator = local::new_client(
//!     Server::new().method(0x1, 0, |args| {
//!         Promise::from_future(async move {
//!             let x = args.root.as_struct().map(|s| s.get_data(0)).unwrap_or(0);
//!             let mut results = StructValue::new();
//!             results.set_data(0, x * 2);
//!             Ok(Content::from_root(Ptr::Struct(results)))
//!         })
//!     }),
//! );
//! let a = Conn::new(tx_a, rx_a, Options { bootstrap_client: calculator, ..Default::default() });
//!
//! // Vat B calls it.
//! let b = Conn::new(tx_b, rx_b, Options::default());
//! let remote = b.bootstrap();
//! let mut req = remote.new_call(Method { interface_id: 0x1, method_id: 0 });
//! let response = req.send().promise.await?;
//! ```

use std::sync::Arc;

use futures::future::BoxFuture;

mod broken;
mod client;
mod error;
pub mod local;
pub mod message;
mod queued;
mod rpc;
pub mod twoparty;

pub use client::{Client, Content, Pipeline, Promise, RemotePromise, Request};
pub use error::{Error, ErrorKind, Result};
pub use local::Server;
pub use message::{
    AnswerId, EmbargoId, ExportId, ImportId, Message, Method, PipelineOp, Ptr, QuestionId,
    StructValue,
};
pub use rpc::{Conn, Options};

/// The outbound half of a message transport. `send` and `close` are called
/// only from the connection's send task.
pub trait MessageSender: Send {
    /// Transmits one message. Resolves once the message has been flushed to
    /// the underlying stream.
    fn send(&mut self, message: Message) -> BoxFuture<'_, Result<()>>;

    /// Flushes and shuts down the outbound stream.
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// The inbound half of a message transport. `recv` is called only from the
/// connection's reader task.
pub trait MessageReceiver: Send {
    /// Waits for the next message. Returns `None` when the stream ends
    /// cleanly.
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Message>>>;
}

/// Receives errors that occur while a connection is serving its remote vat.
/// Implementations should return quickly and must not call back into the
/// connection they are attached to.
pub trait ErrorReporter: Send + Sync {
    fn report_error(&self, error: &Error);
}

impl<F> ErrorReporter for F
where
    F: Fn(&Error) + Send + Sync,
{
    fn report_error(&self, error: &Error) {
        self(error)
    }
}

/// Convenience for passing a closure as an [`ErrorReporter`].
pub fn reporter(f: impl Fn(&Error) + Send + Sync + 'static) -> Arc<dyn ErrorReporter> {
    Arc::new(f)
}
