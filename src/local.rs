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

//! Runtime support for implementing capabilities locally.
//!
//! A [`Server`] is a table of methods keyed by `(interface_id, method_id)`.
//! Deliveries are pushed onto a per-server FIFO and executed one at a time by
//! a worker task, which is what upholds E-order for calls arriving on the
//! same capability: a method runs to completion before the next delivery
//! starts.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::client::{
    Client, ClientKind, Content, Metadata, Pipeline, PipelineCaller, PipelineKind, Promise, Recv,
    RemotePromise, Returner,
};
use crate::error::{Error, Result};
use crate::message::Method;
use crate::queued::{QueuedPipeline, TeeReturner};

/// The implementation of a single method: consumes the call's arguments and
/// produces its results.
pub type MethodImpl = Box<dyn Fn(Content) -> Promise<Content> + Send + Sync>;

/// A locally implemented interface: an ordered method table.
pub struct Server {
    methods: Vec<(Method, MethodImpl)>,
}

impl Server {
    pub fn new() -> Self {
        Self {
            methods: Vec::new(),
        }
    }

    /// Registers a method implementation.
    pub fn method(
        mut self,
        interface_id: u64,
        method_id: u16,
        body: impl Fn(Content) -> Promise<Content> + Send + Sync + 'static,
    ) -> Self {
        self.methods.push((
            Method {
                interface_id,
                method_id,
            },
            Box::new(body),
        ));
        self
    }

    fn find(&self, method: Method) -> Option<&MethodImpl> {
        self.methods
            .binary_search_by_key(&(method.interface_id, method.method_id), |(m, _)| {
                (m.interface_id, m.method_id)
            })
            .ok()
            .map(|i| &self.methods[i].1)
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates a client backed by a local server. Must be called within a tokio
/// runtime; the server's delivery worker is spawned immediately.
pub fn new_client(mut server: Server) -> Client {
    server
        .methods
        .sort_by_key(|(m, _)| (m.interface_id, m.method_id));
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(deliver(server, rx));
    Client {
        kind: Some(ClientKind::Local(Arc::new(ServerClient {
            tx,
            meta: Metadata::default(),
        }))),
    }
}

/// Runs deliveries strictly one at a time, in arrival order. Ends when every
/// client handle for the server is gone.
async fn deliver(server: Server, mut rx: mpsc::UnboundedReceiver<Recv>) {
    while let Some(recv) = rx.recv().await {
        let Recv {
            method,
            args,
            returner,
            cancel,
        } = recv;
        match server.find(method) {
            None => {
                debug!(%method, "local call on unimplemented method");
                returner.return_results(Err(Error::unimplemented(format!(
                    "method not implemented: {method}"
                ))));
            }
            Some(body) => {
                let fut = body(args);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        returner.return_results(Err(Error::failed("call canceled")));
                    }
                    result = fut => {
                        returner.return_results(result);
                    }
                }
            }
        }
    }
}

pub(crate) struct ServerClient {
    tx: mpsc::UnboundedSender<Recv>,
    meta: Metadata,
}

impl ServerClient {
    pub(crate) fn meta(&self) -> &Metadata {
        &self.meta
    }

    pub(crate) fn send_call(&self, method: Method, params: Content) -> RemotePromise {
        let (reply, rx) = tokio::sync::oneshot::channel();
        let pipeline = QueuedPipeline::new();
        let recv = Recv {
            method,
            args: params,
            returner: Box::new(TeeReturner {
                inner: Box::new(ReplyReturner { reply }),
                pipeline: pipeline.clone(),
            }),
            cancel: tokio_util::sync::CancellationToken::new(),
        };
        if self.tx.send(recv).is_err() {
            let e = Error::disconnected("server was shut down");
            return RemotePromise {
                promise: Promise::err(e.clone()),
                pipeline: Pipeline::broken(e),
            };
        }
        RemotePromise {
            promise: Promise::from_future(async move {
                match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(Error::disconnected("server was shut down")),
                }
            }),
            pipeline: Pipeline {
                kind: PipelineKind::Queued(pipeline),
            },
        }
    }

    pub(crate) fn recv_call(&self, recv: Recv) -> Arc<dyn PipelineCaller> {
        let pipeline = QueuedPipeline::new();
        let tee = Box::new(TeeReturner {
            inner: recv.returner,
            pipeline: pipeline.clone(),
        });
        let recv = Recv {
            method: recv.method,
            args: recv.args,
            returner: tee,
            cancel: recv.cancel,
        };
        if let Err(mpsc::error::SendError(recv)) = self.tx.send(recv) {
            recv.returner
                .return_results(Err(Error::disconnected("server was shut down")));
        }
        Arc::new(pipeline)
    }
}

struct ReplyReturner {
    reply: tokio::sync::oneshot::Sender<Result<Content>>,
}

impl Returner for ReplyReturner {
    fn return_results(self: Box<Self>, result: Result<Content>) {
        let _ = self.reply.send(result);
    }
}
