// Copyright (c) 2013-2016 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
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

//! Reference-counted capability handles and the seams through which the
//! connection core dispatches calls.
//!
//! A [`Client`] is a cheaply clonable handle; cloning takes a reference and
//! dropping the last handle releases the underlying object (for imports,
//! this sends a `Release` message). The handle's brand is a tagged variant,
//! which is what the dispatcher matches on when classifying capabilities.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::message::{transform, Method, PipelineOp, Ptr};

/// A boxed future resolving to `Result<T, Error>`.
pub struct Promise<T> {
    inner: BoxFuture<'static, Result<T>>,
}

impl<T> Promise<T> {
    pub fn from_future<F>(f: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self { inner: f.boxed() }
    }

    pub fn ok(value: T) -> Self
    where
        T: Send + 'static,
    {
        Self::from_future(async move { Ok(value) })
    }

    pub fn err(error: Error) -> Self
    where
        T: Send + 'static,
    {
        Self::from_future(async move { Err(error) })
    }
}

impl<T> Future for Promise<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

/// A materialized payload: a content pointer plus the live capabilities its
/// `Ptr::Cap` slots index into. Used for call parameters and results on both
/// sides of the wire.
#[derive(Clone, Default)]
pub struct Content {
    pub root: Ptr,
    pub caps: Vec<Client>,
}

impl Content {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_root(root: Ptr) -> Self {
        Self {
            root,
            caps: Vec::new(),
        }
    }

    /// Adds a capability to the table and returns the pointer that references
    /// it.
    pub fn add_cap(&mut self, client: Client) -> Ptr {
        let index = self.caps.len() as u32;
        self.caps.push(client);
        Ptr::Cap(index)
    }

    /// Resolves a `Ptr::Cap` against the capability table.
    pub fn cap_at(&self, ptr: &Ptr) -> Option<Client> {
        match ptr {
            Ptr::Cap(i) => self.caps.get(*i as usize).cloned(),
            _ => None,
        }
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Content")
            .field("root", &self.root)
            .field("caps", &self.caps.len())
            .finish()
    }
}

/// Per-client bookkeeping stamped by connections that export the client:
/// maps a connection's uid to the export id assigned on that connection, so
/// retransmitting the same capability reuses one export entry.
#[derive(Default)]
pub(crate) struct Metadata {
    inner: Mutex<HashMap<u64, u32>>,
}

impl Metadata {
    pub(crate) fn export_id(&self, conn_uid: u64) -> Option<u32> {
        self.inner.lock().unwrap().get(&conn_uid).copied()
    }

    pub(crate) fn set_export_id(&self, conn_uid: u64, id: u32) {
        self.inner.lock().unwrap().insert(conn_uid, id);
    }

    pub(crate) fn clear_export_id(&self, conn_uid: u64) {
        self.inner.lock().unwrap().remove(&conn_uid);
    }
}

/// The brand of a capability handle.
#[derive(Clone)]
pub(crate) enum ClientKind {
    /// A capability hosted by a remote vat, proxied over that vat's
    /// connection.
    Import(Arc<crate::rpc::ImportClient>),
    /// The promised result of an outstanding question on some connection.
    Pipeline(Arc<crate::rpc::PipelineClient>),
    /// A promise client: queues operations until resolved. Used for
    /// bootstrap promises and embargoed capabilities.
    Queued(Arc<crate::queued::QueuedClient>),
    /// An application-supplied server hosted by this vat.
    Local(Arc<crate::local::ServerClient>),
    /// A capability that fails every operation with a fixed error.
    Broken(Arc<crate::broken::BrokenClient>),
}

/// A handle to a capability. `Client::null()` is the absent capability.
#[derive(Clone, Default)]
pub struct Client {
    pub(crate) kind: Option<ClientKind>,
}

impl Client {
    pub fn null() -> Self {
        Self { kind: None }
    }

    pub fn is_null(&self) -> bool {
        self.kind.is_none()
    }

    /// A capability that fails every call with `error`.
    pub fn error(error: Error) -> Self {
        crate::broken::new_cap(error)
    }

    /// Starts building a call on this capability.
    pub fn new_call(&self, method: Method) -> Request {
        Request {
            target: self.clone(),
            method,
            params: Content::new(),
        }
    }

    pub(crate) fn send_call(&self, method: Method, params: Content) -> RemotePromise {
        match &self.kind {
            None => {
                let e = Error::failed("called a null capability");
                RemotePromise {
                    promise: Promise::err(e.clone()),
                    pipeline: Pipeline::broken(e),
                }
            }
            Some(ClientKind::Import(c)) => c.send_call(method, params),
            Some(ClientKind::Pipeline(c)) => c.send_call(method, params),
            Some(ClientKind::Queued(c)) => c.send_call(method, params),
            Some(ClientKind::Local(c)) => c.send_call(method, params),
            Some(ClientKind::Broken(c)) => c.send_call(method, params),
        }
    }

    pub(crate) fn recv_call(&self, recv: Recv) -> Arc<dyn PipelineCaller> {
        match &self.kind {
            None => {
                let e = Error::failed("called a null capability");
                recv.returner.return_results(Err(e.clone()));
                crate::broken::new_caller(e)
            }
            Some(ClientKind::Import(c)) => c.recv_call(recv),
            Some(ClientKind::Pipeline(c)) => c.recv_call(recv),
            Some(ClientKind::Queued(c)) => c.recv_call(recv),
            Some(ClientKind::Local(c)) => c.recv_call(recv),
            Some(ClientKind::Broken(c)) => c.recv_call(recv),
        }
    }

    pub(crate) fn meta(&self) -> Option<&Metadata> {
        match &self.kind {
            None => None,
            Some(ClientKind::Import(c)) => Some(c.meta()),
            Some(ClientKind::Pipeline(c)) => Some(c.meta()),
            Some(ClientKind::Queued(c)) => Some(c.meta()),
            Some(ClientKind::Local(c)) => Some(c.meta()),
            Some(ClientKind::Broken(c)) => Some(c.meta()),
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            None => "null",
            Some(ClientKind::Import(_)) => "import",
            Some(ClientKind::Pipeline(_)) => "pipeline",
            Some(ClientKind::Queued(_)) => "queued",
            Some(ClientKind::Local(_)) => "local",
            Some(ClientKind::Broken(_)) => "broken",
        };
        write!(f, "Client({kind})")
    }
}

/// A call under construction.
pub struct Request {
    target: Client,
    method: Method,
    params: Content,
}

impl Request {
    pub fn params(&mut self) -> &mut Content {
        &mut self.params
    }

    pub fn send(self) -> RemotePromise {
        self.target.send_call(self.method, self.params)
    }
}

/// The result of sending a call: a promise for the response plus a pipeline
/// handle for deriving capabilities out of the not-yet-arrived results.
pub struct RemotePromise {
    pub promise: Promise<Content>,
    pub pipeline: Pipeline,
}

#[derive(Clone)]
pub(crate) enum PipelineKind {
    Question(Arc<crate::rpc::QuestionRef>),
    Queued(crate::queued::QueuedPipeline),
    Broken(Error),
}

/// Derives capabilities from the eventual results of a call.
#[derive(Clone)]
pub struct Pipeline {
    pub(crate) kind: PipelineKind,
}

impl Pipeline {
    pub(crate) fn broken(error: Error) -> Self {
        Self {
            kind: PipelineKind::Broken(error),
        }
    }

    /// Returns a client for the capability the given transform path will
    /// reach in the results.
    pub fn get(&self, ops: Vec<PipelineOp>) -> Client {
        match &self.kind {
            PipelineKind::Question(q) => q.pipeline_client(ops),
            PipelineKind::Queued(q) => q.get(ops),
            PipelineKind::Broken(e) => Client::error(e.clone()),
        }
    }
}

/// Resolves the capability a transform path reaches within resolved results.
/// Errors and non-capability values become error clients; null stays null.
pub(crate) fn client_for(result: &Result<Content>, ops: &[PipelineOp]) -> Client {
    match result {
        Err(e) => Client::error(e.clone()),
        Ok(content) => match transform(&content.root, ops) {
            Err(e) => Client::error(e),
            Ok(Ptr::Null) => Client::null(),
            Ok(ptr @ Ptr::Cap(_)) => content
                .cap_at(&ptr)
                .unwrap_or_else(|| Client::error(Error::failed("capability index out of bounds"))),
            Ok(_) => Client::error(Error::failed("pipelined result is not a capability")),
        },
    }
}

/// An inbound call delivery: arguments, a one-shot result sink, and the
/// cancellation signal for the call's context.
pub(crate) struct Recv {
    pub method: Method,
    pub args: Content,
    pub returner: Box<dyn Returner>,
    pub cancel: CancellationToken,
}

/// One-shot sink for a call's outcome.
pub(crate) trait Returner: Send {
    fn return_results(self: Box<Self>, result: Result<Content>);
}

/// Dispatch point for calls that target the eventual results of an inbound
/// call that has not returned yet.
pub(crate) trait PipelineCaller: Send + Sync {
    /// Delivers a call addressed at `transform` within this pipeline's
    /// results, returning the pipeline caller for the new call's own answer.
    fn pipeline_recv(&self, transform: Vec<PipelineOp>, recv: Recv) -> Arc<dyn PipelineCaller>;

    /// Returns a client for the capability at `ops` within this pipeline's
    /// results.
    fn pipelined_client(&self, ops: Vec<PipelineOp>) -> Client;
}
