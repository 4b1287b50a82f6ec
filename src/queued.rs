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

//! Promise clients and pipelines.
//!
//! A [`QueuedClient`] stands in for a capability that is not known yet: the
//! bootstrap interface before its Return arrives, or a capability under
//! embargo. Operations queue in arrival order and are forwarded, still in
//! order, when the client resolves. A [`QueuedPipeline`] plays the same role
//! for the results of a call that has not returned yet.
//!
//! Queued operations are forwarded while holding the queue's own lock, so a
//! racing operation that observes the resolved state cannot overtake them.
//! Lock order is always queue state before connection state, never the
//! reverse: the connection core only touches these objects after dropping
//! its mutex.

use std::any::Any;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::client::{
    client_for, Client, ClientKind, Content, Metadata, Pipeline, PipelineCaller, PipelineKind,
    Promise, Recv, RemotePromise, Returner,
};
use crate::error::{Error, Result};
use crate::message::{Method, PipelineOp};

enum ClientState {
    Pending {
        ops: Vec<PendingOp>,
        /// Keeps the object this promise is derived from alive until
        /// resolution (e.g. the question behind a bootstrap client).
        #[allow(dead_code)]
        anchor: Option<Arc<dyn Any + Send + Sync>>,
    },
    Resolved(Client),
}

enum PendingOp {
    Call {
        method: Method,
        params: Content,
        reply: oneshot::Sender<Result<Content>>,
        pipeline: QueuedPipeline,
    },
    Recv {
        recv: Recv,
        slot: QueuedPipeline,
    },
}

pub(crate) struct QueuedClient {
    state: Mutex<ClientState>,
    meta: Metadata,
}

impl QueuedClient {
    pub(crate) fn new(anchor: Option<Arc<dyn Any + Send + Sync>>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ClientState::Pending {
                ops: Vec::new(),
                anchor,
            }),
            meta: Metadata::default(),
        })
    }

    pub(crate) fn client(self: Arc<Self>) -> Client {
        Client {
            kind: Some(ClientKind::Queued(self)),
        }
    }

    pub(crate) fn meta(&self) -> &Metadata {
        &self.meta
    }

    pub(crate) fn send_call(&self, method: Method, params: Content) -> RemotePromise {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            ClientState::Resolved(target) => target.send_call(method, params),
            ClientState::Pending { ops, .. } => {
                let (reply, rx) = oneshot::channel();
                let pipeline = QueuedPipeline::new();
                ops.push(PendingOp::Call {
                    method,
                    params,
                    reply,
                    pipeline: pipeline.clone(),
                });
                RemotePromise {
                    promise: Promise::from_future(async move {
                        match rx.await {
                            Ok(result) => result,
                            Err(_) => Err(Error::failed("queued call was never delivered")),
                        }
                    }),
                    pipeline: Pipeline {
                        kind: PipelineKind::Queued(pipeline),
                    },
                }
            }
        }
    }

    pub(crate) fn recv_call(&self, recv: Recv) -> Arc<dyn PipelineCaller> {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            ClientState::Resolved(target) => target.recv_call(recv),
            ClientState::Pending { ops, .. } => {
                let slot = QueuedPipeline::new();
                ops.push(PendingOp::Recv {
                    recv,
                    slot: slot.clone(),
                });
                Arc::new(slot)
            }
        }
    }

    /// Resolves this promise, forwarding every queued operation to the
    /// target in arrival order. Resolving twice is a no-op.
    pub(crate) fn resolve(&self, result: Result<Client>) {
        let target = match result {
            Ok(c) => c,
            Err(e) => Client::error(e),
        };
        let mut state = self.state.lock().unwrap();
        let drained = match &mut *state {
            ClientState::Resolved(_) => return,
            ClientState::Pending { ops, .. } => std::mem::take(ops),
        };
        *state = ClientState::Resolved(target.clone());
        for op in drained {
            match op {
                PendingOp::Call {
                    method,
                    params,
                    mut reply,
                    pipeline,
                } => {
                    let RemotePromise {
                        promise,
                        pipeline: forwarded,
                    } = target.send_call(method, params);
                    pipeline.redirect_pipeline(forwarded);
                    tokio::spawn(async move {
                        tokio::select! {
                            // The caller dropped its promise; dropping ours
                            // propagates the cancellation.
                            _ = reply.closed() => {}
                            result = promise => {
                                let _ = reply.send(result);
                            }
                        }
                    });
                }
                PendingOp::Recv { recv, slot } => {
                    let caller = target.recv_call(recv);
                    slot.redirect_caller(caller);
                }
            }
        }
    }
}

enum PipelineState {
    Pending(Vec<QueuedPipelineOp>),
    Results(Result<Content>),
    Pipeline(Pipeline),
    Caller(Arc<dyn PipelineCaller>),
}

enum QueuedPipelineOp {
    Get {
        ops: Vec<PipelineOp>,
        slot: Arc<QueuedClient>,
    },
    Recv {
        transform: Vec<PipelineOp>,
        recv: Recv,
        slot: QueuedPipeline,
    },
}

/// A shared handle to the eventual pipeline of an unreturned call. Clones
/// share state.
#[derive(Clone)]
pub(crate) struct QueuedPipeline {
    inner: Arc<Mutex<PipelineState>>,
}

impl QueuedPipeline {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PipelineState::Pending(Vec::new()))),
        }
    }

    /// Returns a client for the capability `ops` will reach in the results.
    pub(crate) fn get(&self, ops: Vec<PipelineOp>) -> Client {
        let mut state = self.inner.lock().unwrap();
        match &mut *state {
            PipelineState::Pending(queue) => {
                let slot = QueuedClient::new(Some(Arc::new(self.clone())));
                queue.push(QueuedPipelineOp::Get {
                    ops,
                    slot: slot.clone(),
                });
                slot.client()
            }
            PipelineState::Results(result) => client_for(result, &ops),
            PipelineState::Pipeline(p) => p.get(ops),
            PipelineState::Caller(c) => c.pipelined_client(ops),
        }
    }

    fn deliver(&self, transform: Vec<PipelineOp>, recv: Recv) -> Arc<dyn PipelineCaller> {
        let mut state = self.inner.lock().unwrap();
        match &mut *state {
            PipelineState::Pending(queue) => {
                let slot = Self::new();
                queue.push(QueuedPipelineOp::Recv {
                    transform,
                    recv,
                    slot: slot.clone(),
                });
                Arc::new(slot)
            }
            PipelineState::Results(result) => client_for(result, &transform).recv_call(recv),
            PipelineState::Pipeline(p) => p.get(transform).recv_call(recv),
            PipelineState::Caller(c) => c.pipeline_recv(transform, recv),
        }
    }

    /// Resolves with concrete results (or a call failure), draining queued
    /// operations in order.
    pub(crate) fn resolve_results(&self, result: Result<Content>) {
        self.transition(PipelineState::Results(result));
    }

    /// Redirects to the pipeline of a forwarded call.
    pub(crate) fn redirect_pipeline(&self, pipeline: Pipeline) {
        self.transition(PipelineState::Pipeline(pipeline));
    }

    /// Redirects to the pipeline caller of a forwarded delivery.
    pub(crate) fn redirect_caller(&self, caller: Arc<dyn PipelineCaller>) {
        self.transition(PipelineState::Caller(caller));
    }

    fn transition(&self, next: PipelineState) {
        let mut state = self.inner.lock().unwrap();
        let drained = match &mut *state {
            PipelineState::Pending(queue) => std::mem::take(queue),
            // Already resolved; later transitions lose.
            _ => return,
        };
        *state = next;
        for op in drained {
            match op {
                QueuedPipelineOp::Get { ops, slot } => {
                    let client = match &*state {
                        PipelineState::Results(result) => client_for(result, &ops),
                        PipelineState::Pipeline(p) => p.get(ops),
                        PipelineState::Caller(c) => c.pipelined_client(ops),
                        PipelineState::Pending(_) => unreachable!(),
                    };
                    slot.resolve(Ok(client));
                }
                QueuedPipelineOp::Recv {
                    transform,
                    recv,
                    slot,
                } => {
                    let caller = match &*state {
                        PipelineState::Results(result) => {
                            client_for(result, &transform).recv_call(recv)
                        }
                        PipelineState::Pipeline(p) => p.get(transform).recv_call(recv),
                        PipelineState::Caller(c) => c.pipeline_recv(transform, recv),
                        PipelineState::Pending(_) => unreachable!(),
                    };
                    slot.redirect_caller(caller);
                }
            }
        }
    }
}

impl PipelineCaller for QueuedPipeline {
    fn pipeline_recv(&self, transform: Vec<PipelineOp>, recv: Recv) -> Arc<dyn PipelineCaller> {
        self.deliver(transform, recv)
    }

    fn pipelined_client(&self, ops: Vec<PipelineOp>) -> Client {
        self.get(ops)
    }
}

/// Wraps an answer's returner so that, in addition to delivering the result,
/// completion resolves the answer's pipeline before the Return escapes.
pub(crate) struct TeeReturner {
    pub(crate) inner: Box<dyn Returner>,
    pub(crate) pipeline: QueuedPipeline,
}

impl Returner for TeeReturner {
    fn return_results(self: Box<Self>, result: Result<Content>) {
        self.pipeline.resolve_results(result.clone());
        self.inner.return_results(result);
    }
}
