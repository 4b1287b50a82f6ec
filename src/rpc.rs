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

//! The connection state machine.
//!
//! A [`Conn`] manages three resources: the connection state (the tables),
//! the transport's outbound stream, and the transport's inbound stream.
//! The remote vat is represented by a single receive task that is the only
//! reader of the inbound stream; outbound messages are enqueued on a send
//! queue drained by a single send task. The local vat enters through objects
//! created by the `Conn`, from any task.
//!
//! All table state lives behind one mutex. The mutex must not be held across
//! transport I/O, application-supplied callbacks, or any await point; this
//! keeps contention low and, more importantly, prevents deadlocks, because
//! application callbacks commonly reenter the connection. Capability handles
//! released while the mutex is held are pushed onto a release list that runs
//! after unlock.
//!
//! During processing of one inbound message no other message is received,
//! which both backpressures the remote vat and keeps per-connection delivery
//! order intact.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{
    client_for, Client, ClientKind, Content, Metadata, Pipeline, PipelineCaller, PipelineKind,
    Promise, Recv, RemotePromise, Returner,
};
use crate::error::{Error, ErrorKind, Result};
use crate::message::{
    transform, AnswerId, Call, CapDescriptor, Disembargo, DisembargoContext, ExportId, ImportId,
    Message, MessageTarget, Method, Payload, PipelineOp, PromisedAnswer, QuestionId, Return,
    ReturnBody, SendResultsTo,
};
use crate::queued::QueuedClient;
use crate::{ErrorReporter, MessageReceiver, MessageSender};

const DEFAULT_ABORT_TIMEOUT: Duration = Duration::from_millis(100);

static NEXT_CONN_UID: AtomicU64 = AtomicU64::new(1);

/// Optional parameters for creating a [`Conn`].
pub struct Options {
    /// The capability returned to the remote peer on Bootstrap. The
    /// connection takes the reference and releases it at shutdown.
    pub bootstrap_client: Client,

    /// Called with errors that occur while the connection is receiving
    /// messages from the remote vat. When absent, errors are logged.
    pub error_reporter: Option<Arc<dyn ErrorReporter>>,

    /// How long to block on sending an abort message before closing the
    /// transport. Zero means a reasonably short default.
    pub abort_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            bootstrap_client: Client::null(),
            error_reporter: None,
            abort_timeout: Duration::ZERO,
        }
    }
}

// ===== id allocation and tables =====

/// Assigns ids monotonically, reusing freed ids lowest-first.
struct Table<T> {
    slots: Vec<Option<T>>,
    free: BinaryHeap<Reverse<u32>>,
}

impl<T> Table<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: BinaryHeap::new(),
        }
    }

    fn insert_with(&mut self, f: impl FnOnce(u32) -> T) -> u32 {
        match self.free.pop() {
            Some(Reverse(id)) => {
                self.slots[id as usize] = Some(f(id));
                id
            }
            None => {
                let id = self.slots.len() as u32;
                self.slots.push(Some(f(id)));
                id
            }
        }
    }

    fn insert(&mut self, value: T) -> u32 {
        self.insert_with(|_| value)
    }

    fn get(&self, id: u32) -> Option<&T> {
        self.slots.get(id as usize)?.as_ref()
    }

    fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(id as usize)?.as_mut()
    }

    /// Clears the slot without returning the id to the allocator. The id
    /// must not be reused until `free_id` is called.
    fn take(&mut self, id: u32) -> Option<T> {
        self.slots.get_mut(id as usize)?.take()
    }

    fn free_id(&mut self, id: u32) {
        self.free.push(Reverse(id));
    }

    /// Clears the slot and makes the id immediately reusable.
    fn remove(&mut self, id: u32) -> Option<T> {
        let value = self.take(id)?;
        self.free_id(id);
        Some(value)
    }

    fn drain(&mut self) -> Vec<(u32, T)> {
        let slots = std::mem::take(&mut self.slots);
        self.free.clear();
        slots
            .into_iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| (i as u32, v)))
            .collect()
    }

    #[cfg(test)]
    fn active_len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Client handles and callbacks to run once the connection mutex has been
/// dropped. Declared before the mutex guard so that it runs after unlock.
#[derive(Default)]
struct ReleaseList {
    items: Vec<Box<dyn FnOnce() + Send>>,
}

impl ReleaseList {
    fn defer(&mut self, f: impl FnOnce() + Send + 'static) {
        self.items.push(Box::new(f));
    }

    fn push_client(&mut self, client: Client) {
        self.defer(move || drop(client));
    }
}

impl Drop for ReleaseList {
    fn drop(&mut self) {
        for f in self.items.drain(..) {
            f();
        }
    }
}

// ===== table entries =====

#[derive(Default)]
struct QuestionFlags {
    /// The question is locally done: resolved by a Return, rejected, or
    /// canceled. A finished question never resolves again.
    finished: bool,
    finish_sent: bool,
    return_received: bool,
}

struct Question {
    qref: Weak<QuestionRef>,
    resolver: Option<oneshot::Sender<Result<Content>>>,
    bootstrap: Option<Arc<QueuedClient>>,
    /// Pipeline transform paths sent to the remote against this question.
    /// Consulted on Return to decide which result slots need an embargo.
    called: Vec<Vec<PipelineOp>>,
    flags: QuestionFlags,
    #[allow(dead_code)]
    method: Option<Method>,
}

#[derive(Default)]
struct AnswerFlags {
    return_sent: bool,
    finish_received: bool,
    release_result_caps: bool,
}

struct Answer {
    pcall: Option<Arc<dyn PipelineCaller>>,
    /// Present once the call has completed; retained until Finish so that
    /// pipelined calls and disembargoes can reach the result capabilities.
    results: Option<Result<Content>>,
    /// Exports referenced by the sent Return payload, one entry per
    /// reference taken.
    exported: Vec<ExportId>,
    cancel: Option<CancellationToken>,
    flags: AnswerFlags,
}

struct Export {
    client: Client,
    wire_refs: u32,
}

struct ImportEntry {
    client: Weak<ImportClient>,
    /// How many times the remote has transmitted this id to us; reported
    /// back in the Release message.
    wire_refs: u32,
}

struct Embargo {
    wrapper: Arc<QueuedClient>,
    inner: Client,
}

// ===== connection =====

struct ConnState {
    closing: bool,
    abort_cause: Option<Error>,
    bootstrap: Client,
    send_tx: Option<mpsc::UnboundedSender<AsyncSend>>,
    send_handle: Option<JoinHandle<Box<dyn MessageSender>>>,
    questions: Table<Question>,
    answers: HashMap<AnswerId, Answer>,
    exports: Table<Export>,
    imports: HashMap<ImportId, ImportEntry>,
    embargoes: Table<Embargo>,
}

pub(crate) struct ConnCore {
    uid: u64,
    reporter: Option<Arc<dyn ErrorReporter>>,
    abort_timeout: Duration,
    /// Canceled exactly once, at the start of shutdown. Per-call contexts
    /// are children of this token.
    cancel: CancellationToken,
    state: Mutex<ConnState>,
    done: watch::Sender<bool>,
}

/// A connection to another Cap'n Proto vat. Safe to use from multiple tasks.
pub struct Conn {
    pub(crate) core: Arc<ConnCore>,
}

struct AsyncSend {
    msg: Result<Message>,
    on_sent: Option<SentCallback>,
}

type SentCallback = Box<dyn FnOnce(Result<()>) + Send>;

impl AsyncSend {
    async fn perform(self, sender: &mut dyn MessageSender) {
        match self.msg {
            Ok(m) => {
                let r = sender.send(m).await.map_err(|e| e.context("send message"));
                if let Some(cb) = self.on_sent {
                    cb(r);
                }
            }
            Err(e) => {
                if let Some(cb) = self.on_sent {
                    cb(Err(e));
                }
            }
        }
    }

    fn abort(self, err: Error) {
        if let Some(cb) = self.on_sent {
            cb(Err(err));
        }
    }
}

impl Conn {
    /// Creates a new connection that communicates on the given transport
    /// halves. The connection immediately starts serving requests; it stops
    /// when [`Conn::close`] is called, the remote aborts, or the transport
    /// fails.
    pub fn new(
        sender: Box<dyn MessageSender>,
        receiver: Box<dyn MessageReceiver>,
        options: Options,
    ) -> Self {
        let abort_timeout = if options.abort_timeout.is_zero() {
            DEFAULT_ABORT_TIMEOUT
        } else {
            options.abort_timeout
        };
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let core = Arc::new(ConnCore {
            uid: NEXT_CONN_UID.fetch_add(1, Ordering::Relaxed),
            reporter: options.error_reporter,
            abort_timeout,
            cancel: cancel.clone(),
            state: Mutex::new(ConnState {
                closing: false,
                abort_cause: None,
                bootstrap: options.bootstrap_client,
                send_tx: Some(send_tx),
                send_handle: None,
                questions: Table::new(),
                answers: HashMap::new(),
                exports: Table::new(),
                imports: HashMap::new(),
                embargoes: Table::new(),
            }),
            done: watch::channel(false).0,
        });

        let send_handle = tokio::spawn(send_task(send_rx, sender, cancel.clone()));
        core.state.lock().unwrap().send_handle = Some(send_handle);

        let (in_tx, in_rx) = mpsc::channel(1);
        tokio::spawn(read_task(receiver, in_tx, cancel.clone()));
        let recv_handle = tokio::spawn(receive_task(core.clone(), in_rx));
        tokio::spawn(monitor(core.clone(), recv_handle));

        Self { core }
    }

    /// Returns the remote vat's bootstrap interface. The returned client
    /// holds its question alive; dropping it sends a Finish.
    pub fn bootstrap(&self) -> Client {
        let core = &self.core;
        let mut rl = ReleaseList::default();
        let mut st = core.state.lock().unwrap();
        if st.closing {
            return Client::error(Error::disconnected("connection closed"));
        }
        let id = st.questions.insert_with(|_| Question {
            qref: Weak::new(),
            resolver: None,
            bootstrap: None,
            called: Vec::new(),
            flags: QuestionFlags::default(),
            method: None,
        });
        let qref = Arc::new(QuestionRef {
            conn: Arc::downgrade(core),
            id,
            resolution: OnceLock::new(),
        });
        let qc = QueuedClient::new(Some(qref.clone() as Arc<dyn std::any::Any + Send + Sync>));
        {
            let q = st.questions.get_mut(id).expect("freshly inserted question");
            q.qref = Arc::downgrade(&qref);
            q.bootstrap = Some(qc.clone());
        }
        let weak = Arc::downgrade(core);
        let qc_err = qc.clone();
        core.send_message(
            &mut st,
            Ok(Message::Bootstrap { question_id: id }),
            Some(Box::new(move |r| {
                if let Err(e) = r {
                    if let Some(core) = weak.upgrade() {
                        core.reject_question(id, e.context("bootstrap"));
                    } else {
                        qc_err.resolve(Err(e.context("bootstrap")));
                    }
                }
            })),
            &mut rl,
        );
        drop(st);
        drop(rl);
        qc.client()
    }

    /// Initiates shutdown with a "connection closed" abort and waits for it
    /// to complete. Idempotent.
    pub async fn close(&self) {
        self.core
            .begin_shutdown(Some(Error::failed("connection closed")));
        self.done().await;
    }

    /// Completes once the connection has fully shut down: every table entry
    /// released, the transport closed.
    pub async fn done(&self) {
        let mut rx = self.core.done.subscribe();
        // wait_for returns immediately if already true.
        let _ = rx.wait_for(|v| *v).await;
    }
}

// ===== client kinds backed by a connection =====

/// Proxies calls for a capability hosted by the remote vat.
pub(crate) struct ImportClient {
    conn: Weak<ConnCore>,
    pub(crate) id: ImportId,
    meta: Metadata,
}

impl ImportClient {
    pub(crate) fn meta(&self) -> &Metadata {
        &self.meta
    }

    pub(crate) fn send_call(&self, method: Method, params: Content) -> RemotePromise {
        let Some(conn) = self.conn.upgrade() else {
            return error_promise(Error::disconnected("connection closed"));
        };
        match conn.send_remote_call(CallTarget::Import(self.id), method, params) {
            SendCallOutcome::Sent(rp) => rp,
            // Imports never redirect.
            SendCallOutcome::Redirect(..) => unreachable!(),
        }
    }

    pub(crate) fn recv_call(&self, recv: Recv) -> Arc<dyn PipelineCaller> {
        proxy_recv(|method, params| self.send_call(method, params), recv)
    }
}

impl Drop for ImportClient {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.import_client_dropped(self);
        }
    }
}

/// Refers to the eventual result of a question on this connection; calls
/// made before the Return arrives are pipelined over the wire.
pub(crate) struct PipelineClient {
    question: Arc<QuestionRef>,
    ops: Vec<PipelineOp>,
    meta: Metadata,
}

impl PipelineClient {
    pub(crate) fn meta(&self) -> &Metadata {
        &self.meta
    }

    pub(crate) fn send_call(&self, method: Method, mut params_slot: Content) -> RemotePromise {
        loop {
            if let Some(res) = self.question.resolution.get() {
                return client_for(res, &self.ops).send_call(method, params_slot);
            }
            let Some(conn) = self.question.conn.upgrade() else {
                return error_promise(Error::disconnected("connection closed"));
            };
            match conn.send_remote_call(
                CallTarget::Question {
                    id: self.question.id,
                    transform: self.ops.clone(),
                },
                method,
                params_slot,
            ) {
                SendCallOutcome::Sent(rp) => return rp,
                // The question resolved while we were waiting for the lock.
                SendCallOutcome::Redirect(params) => params_slot = params,
            }
        }
    }

    pub(crate) fn recv_call(&self, recv: Recv) -> Arc<dyn PipelineCaller> {
        proxy_recv(|method, params| self.send_call(method, params), recv)
    }
}

/// The shared identity of a question held by application-side handles.
pub(crate) struct QuestionRef {
    conn: Weak<ConnCore>,
    pub(crate) id: QuestionId,
    /// Set under the connection mutex when the Return is processed, before
    /// the Finish is enqueued; pipeline clients redirect through it.
    resolution: OnceLock<Result<Content>>,
}

impl QuestionRef {
    pub(crate) fn pipeline_client(self: &Arc<Self>, ops: Vec<PipelineOp>) -> Client {
        Client {
            kind: Some(ClientKind::Pipeline(Arc::new(PipelineClient {
                question: self.clone(),
                ops,
                meta: Metadata::default(),
            }))),
        }
    }
}

impl Drop for QuestionRef {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.question_ref_dropped(self.id);
        }
    }
}

/// Routes pipelined deliveries through the pipeline of a forwarded call.
struct ProxyPipelineCaller {
    pipeline: Pipeline,
}

impl PipelineCaller for ProxyPipelineCaller {
    fn pipeline_recv(&self, transform: Vec<PipelineOp>, recv: Recv) -> Arc<dyn PipelineCaller> {
        self.pipeline.get(transform).recv_call(recv)
    }

    fn pipelined_client(&self, ops: Vec<PipelineOp>) -> Client {
        self.pipeline.get(ops)
    }
}

/// Forwards an inbound delivery as an outbound call and bridges the result
/// back to the delivery's returner.
fn proxy_recv(
    send: impl FnOnce(Method, Content) -> RemotePromise,
    recv: Recv,
) -> Arc<dyn PipelineCaller> {
    let Recv {
        method,
        args,
        returner,
        cancel,
    } = recv;
    let rp = send(method, args);
    let pipeline = rp.pipeline.clone();
    let promise = rp.promise;
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {
                returner.return_results(Err(Error::failed("call canceled")));
            }
            result = promise => {
                returner.return_results(result);
            }
        }
    });
    Arc::new(ProxyPipelineCaller { pipeline })
}

fn error_promise(e: Error) -> RemotePromise {
    RemotePromise {
        promise: Promise::err(e.clone()),
        pipeline: Pipeline::broken(e),
    }
}

struct AnswerReturner {
    conn: Arc<ConnCore>,
    id: AnswerId,
}

impl Returner for AnswerReturner {
    fn return_results(self: Box<Self>, result: Result<Content>) {
        self.conn.answer_return(self.id, result);
    }
}

enum CallTarget {
    Import(ImportId),
    Question {
        id: QuestionId,
        transform: Vec<PipelineOp>,
    },
}

enum SendCallOutcome {
    Sent(RemotePromise),
    /// The target question resolved concurrently; the caller should
    /// redispatch against the resolution. Carries the params back.
    Redirect(Content),
}

impl ConnCore {
    fn report(&self, error: &Error) {
        match &self.reporter {
            Some(r) => r.report_error(error),
            None => warn!(error = %error, "rpc connection error"),
        }
    }

    fn is_this_conn(&self, other: &Weak<ConnCore>) -> bool {
        std::ptr::eq(other.as_ptr(), self as *const ConnCore)
    }

    /// Enqueues a message on the send queue. The caller must hold the state
    /// mutex; `on_sent` runs on the send task without the mutex held.
    fn send_message(
        &self,
        st: &mut ConnState,
        msg: Result<Message>,
        on_sent: Option<SentCallback>,
        rl: &mut ReleaseList,
    ) {
        let job = AsyncSend { msg, on_sent };
        let failed = match &st.send_tx {
            Some(tx) => match tx.send(job) {
                Ok(()) => None,
                Err(mpsc::error::SendError(job)) => Some(job),
            },
            None => Some(job),
        };
        if let Some(job) = failed {
            rl.defer(move || job.abort(Error::disconnected("connection closed")));
        }
    }

    // ===== outbound calls =====

    fn send_remote_call(
        self: &Arc<Self>,
        target: CallTarget,
        method: Method,
        params: Content,
    ) -> SendCallOutcome {
        let mut rl = ReleaseList::default();
        let mut st = self.state.lock().unwrap();
        if st.closing {
            rl.defer(move || drop(params));
            return SendCallOutcome::Sent(error_promise(Error::disconnected(
                "connection closed",
            )));
        }
        let wire_target = match &target {
            CallTarget::Import(id) => MessageTarget::ImportedCap(*id),
            CallTarget::Question { id, transform } => {
                match st.questions.get_mut(*id) {
                    Some(q) if !q.flags.finished => {
                        q.called.push(transform.clone());
                    }
                    // Resolved (or rejected) while the caller held no lock.
                    _ => {
                        drop(st);
                        return SendCallOutcome::Redirect(params);
                    }
                }
                MessageTarget::PromisedAnswer(PromisedAnswer {
                    question_id: *id,
                    transform: transform.clone(),
                })
            }
        };

        let id = st.questions.insert_with(|_| Question {
            qref: Weak::new(),
            resolver: None,
            bootstrap: None,
            called: Vec::new(),
            flags: QuestionFlags::default(),
            method: Some(method),
        });
        let qref = Arc::new(QuestionRef {
            conn: Arc::downgrade(self),
            id,
            resolution: OnceLock::new(),
        });
        let (tx, rx) = oneshot::channel();
        {
            let q = st.questions.get_mut(id).expect("freshly inserted question");
            q.qref = Arc::downgrade(&qref);
            q.resolver = Some(tx);
        }

        let (cap_table, _exported) = self.fill_payload(&mut st, &params);
        let msg = Message::Call(Box::new(Call {
            question_id: id,
            target: wire_target,
            method,
            params: Payload {
                content: params.root.clone(),
                cap_table,
            },
            send_results_to: SendResultsTo::Caller,
        }));
        let weak = Arc::downgrade(self);
        self.send_message(
            &mut st,
            Ok(msg),
            Some(Box::new(move |r| {
                if let Err(e) = r {
                    if let Some(core) = weak.upgrade() {
                        core.reject_question(id, e.context("send call"));
                    }
                }
            })),
            &mut rl,
        );
        drop(st);
        rl.defer(move || drop(params));
        drop(rl);

        let qref2 = qref.clone();
        let promise = Promise::from_future(async move {
            // Keeps the question alive until the caller stops waiting.
            let _qref = qref2;
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::disconnected("connection closed")),
            }
        });
        SendCallOutcome::Sent(RemotePromise {
            promise,
            pipeline: Pipeline {
                kind: PipelineKind::Question(qref),
            },
        })
    }

    /// Rejects a question whose Call or Bootstrap message could not be sent.
    /// The remote vat never saw the id, so it is immediately reusable.
    fn reject_question(&self, id: QuestionId, err: Error) {
        let mut rl = ReleaseList::default();
        let mut st = self.state.lock().unwrap();
        let Some(mut q) = st.questions.take(id) else {
            return;
        };
        st.questions.free_id(id);
        if let Some(qref) = q.qref.upgrade() {
            let _ = qref.resolution.set(Err(err.clone()));
        }
        let resolver = q.resolver.take();
        let bootstrap = q.bootstrap.take();
        drop(st);
        rl.defer(move || {
            if let Some(tx) = resolver {
                let _ = tx.send(Err(err.clone()));
            }
            if let Some(qc) = bootstrap {
                qc.resolve(Err(err));
            }
            drop(q);
        });
        drop(rl);
    }

    /// Cancel path: the application dropped every handle to the question.
    fn question_ref_dropped(self: &Arc<Self>, id: QuestionId) {
        let mut rl = ReleaseList::default();
        let mut st = self.state.lock().unwrap();
        if st.closing {
            return;
        }
        let Some(q) = st.questions.get_mut(id) else {
            return;
        };
        if q.flags.finished {
            return;
        }
        q.flags.finished = true;
        q.resolver = None;
        q.bootstrap = None;
        let on_sent = self.finish_sent_callback(id);
        self.send_message(
            &mut st,
            Ok(Message::Finish {
                question_id: id,
                release_result_caps: true,
            }),
            Some(on_sent),
            &mut rl,
        );
        drop(st);
        drop(rl);
    }

    /// Builds the send-completion callback for a Finish message: records
    /// that the Finish reached the wire and recycles the question id once
    /// the Return has also been observed.
    fn finish_sent_callback(self: &Arc<Self>, id: QuestionId) -> SentCallback {
        let weak = Arc::downgrade(self);
        Box::new(move |r| {
            let Some(core) = weak.upgrade() else {
                return;
            };
            match r {
                Ok(()) => {
                    let mut rl = ReleaseList::default();
                    let mut st = core.state.lock().unwrap();
                    if let Some(q) = st.questions.get_mut(id) {
                        q.flags.finish_sent = true;
                        if q.flags.return_received {
                            if let Some(entry) = st.questions.remove(id) {
                                rl.defer(move || drop(entry));
                            }
                        }
                    }
                    drop(st);
                    drop(rl);
                }
                Err(e) => {
                    // The id stays burned: the remote may still believe the
                    // question is live.
                    core.report(&e.context("send finish"));
                }
            }
        })
    }

    fn import_client_dropped(&self, ic: &ImportClient) {
        let mut rl = ReleaseList::default();
        let mut st = self.state.lock().unwrap();
        if st.closing {
            return;
        }
        let stale = match st.imports.get(&ic.id) {
            Some(entry) => std::ptr::eq(entry.client.as_ptr(), ic as *const ImportClient),
            None => false,
        };
        if !stale {
            return;
        }
        let entry = st.imports.remove(&ic.id).expect("import entry checked");
        self.send_message(
            &mut st,
            Ok(Message::Release {
                id: ic.id,
                reference_count: entry.wire_refs,
            }),
            None,
            &mut rl,
        );
        drop(st);
        drop(rl);
    }

    // ===== capability table translation =====

    /// Translates an outbound capability into a descriptor, exporting it if
    /// it is hosted on our side of this connection.
    fn send_cap(self: &Arc<Self>, st: &mut ConnState, client: &Client) -> CapDescriptor {
        match &client.kind {
            None => CapDescriptor::None,
            Some(ClientKind::Import(ic)) if self.is_this_conn(&ic.conn) => {
                CapDescriptor::ReceiverHosted(ic.id)
            }
            Some(ClientKind::Pipeline(pc)) if self.is_this_conn(&pc.question.conn) => {
                if let Some(res) = pc.question.resolution.get() {
                    let resolved = client_for(res, &pc.ops);
                    self.send_cap(st, &resolved)
                } else {
                    CapDescriptor::ReceiverAnswer(PromisedAnswer {
                        question_id: pc.question.id,
                        transform: pc.ops.clone(),
                    })
                }
            }
            Some(_) => {
                let meta = client.meta().expect("non-null client carries metadata");
                if let Some(id) = meta.export_id(self.uid) {
                    if let Some(exp) = st.exports.get_mut(id) {
                        exp.wire_refs += 1;
                        return CapDescriptor::SenderHosted(id);
                    }
                    meta.clear_export_id(self.uid);
                }
                let id = st.exports.insert(Export {
                    client: client.clone(),
                    wire_refs: 1,
                });
                meta.set_export_id(self.uid, id);
                CapDescriptor::SenderHosted(id)
            }
        }
    }

    /// Translates a payload's capabilities for sending, returning the wire
    /// cap table and the export ids it references.
    fn fill_payload(
        self: &Arc<Self>,
        st: &mut ConnState,
        content: &Content,
    ) -> (Vec<CapDescriptor>, Vec<ExportId>) {
        let mut exported = Vec::new();
        let cap_table = content
            .caps
            .iter()
            .map(|c| {
                let d = self.send_cap(st, c);
                if let CapDescriptor::SenderHosted(id) = &d {
                    exported.push(*id);
                }
                d
            })
            .collect();
        (cap_table, exported)
    }

    /// Materializes a client for an inbound descriptor. Any returned error
    /// is a protocol violation.
    fn recv_cap(
        self: &Arc<Self>,
        st: &mut ConnState,
        d: CapDescriptor,
        rl: &mut ReleaseList,
    ) -> Result<Client> {
        match d {
            CapDescriptor::None => Ok(Client::null()),
            // Promises are treated identically to hosted capabilities; no
            // resolve messages flow on this connection.
            CapDescriptor::SenderHosted(id) | CapDescriptor::SenderPromise(id) => {
                Ok(self.add_import(st, id, rl))
            }
            CapDescriptor::ReceiverHosted(id) => match st.exports.get(id) {
                Some(exp) => Ok(exp.client.clone()),
                None => Err(Error::failed(format!(
                    "receive capability: invalid export {id}"
                ))),
            },
            CapDescriptor::ReceiverAnswer(pa) => match st.answers.get(&pa.question_id) {
                None => Err(Error::failed(format!(
                    "receive capability: no such answer {}",
                    pa.question_id
                ))),
                Some(ans) => {
                    if let Some(results) = &ans.results {
                        Ok(client_for(results, &pa.transform))
                    } else if let Some(pc) = &ans.pcall {
                        Ok(pc.pipelined_client(pa.transform))
                    } else {
                        // Deliveries install the pipeline caller before the
                        // dispatcher consumes another message, so this slot
                        // cannot be observed empty.
                        Ok(Client::error(Error::failed(
                            "receive capability: answer has no pipeline",
                        )))
                    }
                }
            },
            CapDescriptor::ThirdPartyHosted(_) => Ok(Client::error(Error::unimplemented(
                "three-party handoff is not supported",
            ))),
        }
    }

    fn add_import(self: &Arc<Self>, st: &mut ConnState, id: ImportId, rl: &mut ReleaseList) -> Client {
        let stale_refs = match st.imports.get_mut(&id) {
            Some(entry) => match entry.client.upgrade() {
                Some(arc) => {
                    entry.wire_refs += 1;
                    return Client {
                        kind: Some(ClientKind::Import(arc)),
                    };
                }
                None => Some(entry.wire_refs),
            },
            None => None,
        };
        if let Some(refs) = stale_refs {
            // The stub died but its Release has not run yet; settle the old
            // references and open a fresh entry.
            self.send_message(
                st,
                Ok(Message::Release {
                    id,
                    reference_count: refs,
                }),
                None,
                rl,
            );
        }
        let arc = Arc::new(ImportClient {
            conn: Arc::downgrade(self),
            id,
            meta: Metadata::default(),
        });
        st.imports.insert(
            id,
            ImportEntry {
                client: Arc::downgrade(&arc),
                wire_refs: 1,
            },
        );
        Client {
            kind: Some(ClientKind::Import(arc)),
        }
    }

    /// Materializes a payload's capability table and returns the indices
    /// that refer to capabilities local to this vat (for embargo checks).
    fn recv_payload(
        self: &Arc<Self>,
        st: &mut ConnState,
        payload: Payload,
        rl: &mut ReleaseList,
    ) -> Result<(Content, HashSet<u32>)> {
        let mut caps = Vec::with_capacity(payload.cap_table.len());
        let mut locals = HashSet::new();
        for (i, d) in payload.cap_table.into_iter().enumerate() {
            match self.recv_cap(st, d, rl) {
                Ok(c) => {
                    if self.is_local_client(&c) {
                        locals.insert(i as u32);
                    }
                    caps.push(c);
                }
                Err(e) => {
                    for c in caps {
                        rl.push_client(c);
                    }
                    return Err(e.context(format!("read payload: capability {i}")));
                }
            }
        }
        Ok((
            Content {
                root: payload.content,
                caps,
            },
            locals,
        ))
    }

    /// Whether the client should be treated as local for embargo purposes.
    /// Imports and pipelines that live on a *different* connection are being
    /// proxied, so as far as this connection is concerned they are local.
    fn is_local_client(&self, client: &Client) -> bool {
        match &client.kind {
            None => false,
            Some(ClientKind::Import(ic)) => !self.is_this_conn(&ic.conn),
            Some(ClientKind::Pipeline(pc)) => !self.is_this_conn(&pc.question.conn),
            // Calls on an error client fail regardless of ordering.
            Some(ClientKind::Broken(_)) => false,
            Some(ClientKind::Queued(_)) | Some(ClientKind::Local(_)) => true,
        }
    }

    // ===== inbound message handlers =====

    fn handle_message(self: &Arc<Self>, msg: Message) -> Result<()> {
        match msg {
            // No-op, to avoid an unimplemented feedback loop.
            Message::Unimplemented(inner) => {
                debug!(message = inner.variant_name(), "remote replied unimplemented");
                Ok(())
            }
            // The receive loop intercepts aborts before dispatch.
            Message::Abort(exc) => {
                self.report(&Error::from(exc).context("remote abort"));
                Ok(())
            }
            Message::Bootstrap { question_id } => self.handle_bootstrap(question_id),
            Message::Call(call) => self.handle_call(*call),
            Message::Return(ret) => self.handle_return(*ret),
            Message::Finish {
                question_id,
                release_result_caps,
            } => self.handle_finish(question_id, release_result_caps),
            Message::Release {
                id,
                reference_count,
            } => self.handle_release(id, reference_count),
            Message::Disembargo(d) => self.handle_disembargo(d),
            other @ (Message::Resolve(_)
            | Message::Provide { .. }
            | Message::Accept { .. }
            | Message::Join { .. }) => {
                self.report(&Error::unimplemented(format!(
                    "unimplemented message from remote: {}",
                    other.variant_name()
                )));
                let mut rl = ReleaseList::default();
                let mut st = self.state.lock().unwrap();
                self.send_message(
                    &mut st,
                    Ok(Message::Unimplemented(Box::new(other))),
                    None,
                    &mut rl,
                );
                drop(st);
                drop(rl);
                Ok(())
            }
        }
    }

    fn handle_bootstrap(self: &Arc<Self>, id: AnswerId) -> Result<()> {
        let mut rl = ReleaseList::default();
        let mut st = self.state.lock().unwrap();
        if st.answers.contains_key(&id) {
            return Err(Error::failed(format!(
                "incoming bootstrap: answer ID {id} reused"
            )));
        }
        let boot = st.bootstrap.clone();
        let (results, exported, body) = if boot.is_null() {
            let e = Error::failed("vat does not expose a public/bootstrap interface");
            (Err(e.clone()), Vec::new(), ReturnBody::Exception(e.into()))
        } else {
            let mut content = Content::new();
            let root = content.add_cap(boot);
            content.root = root;
            let (cap_table, exported) = self.fill_payload(&mut st, &content);
            let payload = Payload {
                content: content.root.clone(),
                cap_table,
            };
            (Ok(content), exported, ReturnBody::Results(payload))
        };
        st.answers.insert(
            id,
            Answer {
                pcall: None,
                results: Some(results),
                exported,
                cancel: None,
                flags: AnswerFlags {
                    return_sent: true,
                    ..AnswerFlags::default()
                },
            },
        );
        // No application code runs for a bootstrap, so the Return goes out
        // before the next message is consumed.
        let weak = Arc::downgrade(self);
        self.send_message(
            &mut st,
            Ok(Message::Return(Box::new(Return {
                answer_id: id,
                release_param_caps: false,
                body,
            }))),
            Some(Box::new(move |r| {
                if let (Err(e), Some(core)) = (r, weak.upgrade()) {
                    core.report(&e.context("incoming bootstrap: send return"));
                }
            })),
            &mut rl,
        );
        drop(st);
        drop(rl);
        Ok(())
    }

    fn handle_call(self: &Arc<Self>, call: Call) -> Result<()> {
        if call.send_results_to != SendResultsTo::Caller {
            // Level-3 handoff; not supported.
            self.report(&Error::unimplemented(
                "incoming call: results destination is not caller",
            ));
            let mut rl = ReleaseList::default();
            let mut st = self.state.lock().unwrap();
            self.send_message(
                &mut st,
                Ok(Message::Unimplemented(Box::new(Message::Call(Box::new(
                    call,
                ))))),
                None,
                &mut rl,
            );
            drop(st);
            drop(rl);
            return Ok(());
        }

        let id = call.question_id;
        let mut rl = ReleaseList::default();
        let mut st = self.state.lock().unwrap();
        if st.answers.contains_key(&id) {
            return Err(Error::failed(format!(
                "incoming call: answer ID {id} reused"
            )));
        }

        let args = match self.recv_payload(&mut st, call.params, &mut rl) {
            Ok((content, _locals)) => content,
            Err(e) => {
                let e = e.context("incoming call");
                self.send_exception_answer(&mut st, id, e.clone(), &mut rl);
                drop(st);
                drop(rl);
                self.report(&e);
                return Ok(());
            }
        };

        enum Dispatch {
            Direct(Client),
            Caller(Arc<dyn PipelineCaller>, Vec<PipelineOp>),
        }

        let dispatch = match call.target {
            MessageTarget::ImportedCap(export_id) => match st.exports.get(export_id) {
                Some(exp) => Dispatch::Direct(exp.client.clone()),
                None => {
                    rl.defer(move || drop(args));
                    return Err(Error::failed(format!(
                        "incoming call: unknown export ID {export_id}"
                    )));
                }
            },
            MessageTarget::PromisedAnswer(pa) => {
                let Some(tgt) = st.answers.get(&pa.question_id) else {
                    rl.defer(move || drop(args));
                    return Err(Error::failed(format!(
                        "incoming call: use of unknown or finished answer ID {} for promised answer target",
                        pa.question_id
                    )));
                };
                if tgt.flags.finish_received {
                    rl.defer(move || drop(args));
                    return Err(Error::failed(format!(
                        "incoming call: use of unknown or finished answer ID {} for promised answer target",
                        pa.question_id
                    )));
                }
                match (&tgt.results, &tgt.pcall) {
                    (Some(Err(e)), _) => {
                        let e = e.clone();
                        self.send_exception_answer(&mut st, id, e, &mut rl);
                        rl.defer(move || drop(args));
                        drop(st);
                        drop(rl);
                        return Ok(());
                    }
                    (Some(Ok(content)), _) => {
                        Dispatch::Direct(client_for(&Ok(content.clone()), &pa.transform))
                    }
                    (None, Some(pc)) => Dispatch::Caller(pc.clone(), pa.transform),
                    (None, None) => {
                        // Cannot be observed: the pipeline caller is always
                        // installed before the next message is consumed.
                        let e = Error::failed(format!(
                            "incoming call: answer ID {} has no pipeline",
                            pa.question_id
                        ));
                        self.send_exception_answer(&mut st, id, e, &mut rl);
                        rl.defer(move || drop(args));
                        drop(st);
                        drop(rl);
                        return Ok(());
                    }
                }
            }
        };

        let token = self.cancel.child_token();
        st.answers.insert(
            id,
            Answer {
                pcall: None,
                results: None,
                exported: Vec::new(),
                cancel: Some(token.clone()),
                flags: AnswerFlags::default(),
            },
        );
        drop(st);
        drop(rl);

        let recv = Recv {
            method: call.method,
            args,
            returner: Box::new(AnswerReturner {
                conn: self.clone(),
                id,
            }),
            cancel: token,
        };
        let pcall = match dispatch {
            Dispatch::Direct(client) => client.recv_call(recv),
            Dispatch::Caller(pc, transform) => pc.pipeline_recv(transform, recv),
        };
        let mut st = self.state.lock().unwrap();
        if let Some(ans) = st.answers.get_mut(&id) {
            ans.pcall = Some(pcall);
        }
        drop(st);
        Ok(())
    }

    /// Records an error answer and sends the corresponding exception Return.
    fn send_exception_answer(
        self: &Arc<Self>,
        st: &mut ConnState,
        id: AnswerId,
        err: Error,
        rl: &mut ReleaseList,
    ) {
        st.answers.insert(
            id,
            Answer {
                pcall: None,
                results: Some(Err(err.clone())),
                exported: Vec::new(),
                cancel: None,
                flags: AnswerFlags {
                    return_sent: true,
                    ..AnswerFlags::default()
                },
            },
        );
        self.send_message(
            st,
            Ok(Message::Return(Box::new(Return {
                answer_id: id,
                release_param_caps: false,
                body: ReturnBody::Exception(err.into()),
            }))),
            None,
            rl,
        );
    }

    /// Completion path for inbound calls: called by the local server runtime
    /// (or the proxy bridge) when a call finishes.
    fn answer_return(self: &Arc<Self>, id: AnswerId, result: Result<Content>) {
        let mut rl = ReleaseList::default();
        let mut st = self.state.lock().unwrap();
        let closing = st.closing;
        match st.answers.get_mut(&id) {
            Some(ans) if !closing && !ans.flags.return_sent => {
                ans.flags.return_sent = true;
            }
            _ => {
                rl.defer(move || drop(result));
                drop(st);
                drop(rl);
                return;
            }
        }

        let body = match &result {
            Ok(content) => {
                let (cap_table, exported) = self.fill_payload(&mut st, content);
                let payload = Payload {
                    content: content.root.clone(),
                    cap_table,
                };
                let ans = st.answers.get_mut(&id).expect("answer present");
                ans.exported = exported;
                ans.results = Some(Ok(content.clone()));
                ReturnBody::Results(payload)
            }
            Err(e) => {
                let ans = st.answers.get_mut(&id).expect("answer present");
                ans.results = Some(Err(e.clone()));
                ReturnBody::Exception(e.clone().into())
            }
        };
        rl.defer(move || drop(result));

        let weak = Arc::downgrade(self);
        self.send_message(
            &mut st,
            Ok(Message::Return(Box::new(Return {
                answer_id: id,
                release_param_caps: false,
                body,
            }))),
            Some(Box::new(move |r| {
                if let (Err(e), Some(core)) = (r, weak.upgrade()) {
                    core.report(&e.context("send return"));
                }
            })),
            &mut rl,
        );

        if st
            .answers
            .get(&id)
            .map(|a| a.flags.finish_received)
            .unwrap_or(false)
        {
            let ans = st.answers.remove(&id).expect("answer present");
            self.destroy_answer(&mut st, ans, &mut rl);
        }
        drop(st);
        drop(rl);
    }

    /// Releases everything an answer holds. Caller must hold the mutex; the
    /// release list carries the actual drops out of the critical section.
    fn destroy_answer(&self, st: &mut ConnState, mut ans: Answer, rl: &mut ReleaseList) {
        if ans.flags.release_result_caps {
            for id in std::mem::take(&mut ans.exported) {
                if let Err(e) = self.release_export(st, id, 1, rl) {
                    self.report(&e.context("release result caps"));
                }
            }
        }
        rl.defer(move || drop(ans));
    }

    fn handle_return(self: &Arc<Self>, ret: Return) -> Result<()> {
        let mut rl = ReleaseList::default();
        let mut st = self.state.lock().unwrap();
        let qid = ret.answer_id;
        let Some(q) = st.questions.get_mut(qid) else {
            return Err(Error::failed(format!(
                "incoming return: question {qid} does not exist"
            )));
        };
        if q.flags.return_received {
            return Err(Error::failed(format!(
                "incoming return: duplicate return for question {qid}"
            )));
        }
        q.flags.return_received = true;

        if q.flags.finished {
            // Locally canceled; the cancel path already wrote a Finish. The
            // id is recycled only once that Finish has been flushed.
            if q.flags.finish_sent {
                if let Some(entry) = st.questions.remove(qid) {
                    rl.defer(move || drop(entry));
                }
            }
            drop(st);
            drop(rl);
            return Ok(());
        }
        q.flags.finished = true;
        let called = std::mem::take(&mut q.called);

        let resolution: Result<Content> = match ret.body {
            ReturnBody::Results(payload) => {
                match self.recv_payload(&mut st, payload, &mut rl) {
                    Ok((content, locals)) => {
                        // Install embargoes: any returned capability that is
                        // local to us and was pipelined against must not
                        // receive new calls until the in-flight ones have
                        // looped back.
                        let mut content = content;
                        let mut embargoed: HashSet<u32> = HashSet::new();
                        for xform in &called {
                            let Ok(ptr) = transform(&content.root, xform) else {
                                continue;
                            };
                            let Some(i) = ptr.as_cap() else { continue };
                            if (i as usize) >= content.caps.len()
                                || !locals.contains(&i)
                                || embargoed.contains(&i)
                            {
                                continue;
                            }
                            let inner = content.caps[i as usize].clone();
                            let wrapper = QueuedClient::new(None);
                            let eid = st.embargoes.insert(Embargo {
                                wrapper: wrapper.clone(),
                                inner,
                            });
                            let old = std::mem::replace(
                                &mut content.caps[i as usize],
                                wrapper.client(),
                            );
                            rl.push_client(old);
                            embargoed.insert(i);
                            let weak = Arc::downgrade(self);
                            self.send_message(
                                &mut st,
                                Ok(Message::Disembargo(Disembargo {
                                    target: MessageTarget::PromisedAnswer(PromisedAnswer {
                                        question_id: qid,
                                        transform: xform.clone(),
                                    }),
                                    context: DisembargoContext::SenderLoopback(eid),
                                })),
                                Some(Box::new(move |r| {
                                    if let (Err(e), Some(core)) = (r, weak.upgrade()) {
                                        core.report(
                                            &e.context("incoming return: send disembargo"),
                                        );
                                    }
                                })),
                                &mut rl,
                            );
                        }
                        Ok(content)
                    }
                    Err(e) => {
                        let e = e.context("incoming return");
                        self.report(&e);
                        Err(e)
                    }
                }
            }
            ReturnBody::Exception(exc) => Err(Error::from(exc)),
            ReturnBody::Canceled => Err(Error::failed("incoming return: call canceled")),
            other => {
                let e = Error::failed(format!(
                    "incoming return: unsupported return body {other:?}"
                ));
                self.report(&e);
                Err(e)
            }
        };
        // Shorten paths for later pipelined sends before the Finish can be
        // observed by anyone.
        let q = st.questions.get_mut(qid).expect("question present");
        if let Some(qref) = q.qref.upgrade() {
            let _ = qref.resolution.set(resolution.clone());
        }
        let resolver = q.resolver.take();
        let bootstrap = q.bootstrap.take();

        self.send_message(
            &mut st,
            Ok(Message::Finish {
                question_id: qid,
                release_result_caps: false,
            }),
            Some(self.finish_sent_callback(qid)),
            &mut rl,
        );
        drop(st);
        drop(rl);

        // Fulfilling promises may reenter the connection; hand off to a new
        // task so the receive loop is never blocked on application code.
        tokio::spawn(async move {
            if let Some(qc) = bootstrap {
                qc.resolve(Ok(client_for(&resolution, &[])));
            }
            if let Some(tx) = resolver {
                let _ = tx.send(resolution);
            }
        });
        Ok(())
    }

    fn handle_finish(&self, id: AnswerId, release_result_caps: bool) -> Result<()> {
        let mut rl = ReleaseList::default();
        let mut st = self.state.lock().unwrap();
        let Some(ans) = st.answers.get_mut(&id) else {
            return Err(Error::failed(format!(
                "incoming finish: unknown answer ID {id}"
            )));
        };
        if ans.flags.finish_received {
            return Err(Error::failed(format!(
                "incoming finish: answer ID {id} already received finish"
            )));
        }
        ans.flags.finish_received = true;
        if release_result_caps {
            ans.flags.release_result_caps = true;
        }
        if let Some(token) = ans.cancel.take() {
            token.cancel();
        }
        if ans.flags.return_sent {
            let ans = st.answers.remove(&id).expect("answer present");
            self.destroy_answer(&mut st, ans, &mut rl);
        }
        drop(st);
        drop(rl);
        Ok(())
    }

    fn handle_release(&self, id: ExportId, count: u32) -> Result<()> {
        let mut rl = ReleaseList::default();
        let mut st = self.state.lock().unwrap();
        let result = self
            .release_export(&mut st, id, count, &mut rl)
            .map_err(|e| e.context("incoming release"));
        drop(st);
        drop(rl);
        result
    }

    fn release_export(
        &self,
        st: &mut ConnState,
        id: ExportId,
        count: u32,
        rl: &mut ReleaseList,
    ) -> Result<()> {
        let Some(exp) = st.exports.get_mut(id) else {
            return Err(Error::failed(format!("unknown export ID {id}")));
        };
        if count > exp.wire_refs {
            return Err(Error::failed(format!(
                "export ID {id} released {count} times, but only {} references are held",
                exp.wire_refs
            )));
        }
        exp.wire_refs -= count;
        if exp.wire_refs == 0 {
            let exp = st.exports.remove(id).expect("export present");
            if let Some(meta) = exp.client.meta() {
                meta.clear_export_id(self.uid);
            }
            rl.push_client(exp.client);
        }
        Ok(())
    }

    fn handle_disembargo(self: &Arc<Self>, d: Disembargo) -> Result<()> {
        match d.context {
            DisembargoContext::ReceiverLoopback(eid) => {
                let mut st = self.state.lock().unwrap();
                let Some(embargo) = st.embargoes.remove(eid) else {
                    return Err(Error::failed(format!(
                        "incoming disembargo: received receiver loopback for unknown ID {eid}"
                    )));
                };
                drop(st);
                // Lifting forwards queued calls, which reenters the
                // connection; the mutex must be free.
                embargo.wrapper.resolve(Ok(embargo.inner));
                Ok(())
            }
            DisembargoContext::SenderLoopback(eid) => {
                let mut rl = ReleaseList::default();
                let mut st = self.state.lock().unwrap();
                let MessageTarget::PromisedAnswer(pa) = &d.target else {
                    return Err(Error::failed(
                        "incoming disembargo: sender loopback: target is not a promised answer",
                    ));
                };
                let Some(ans) = st.answers.get(&pa.question_id) else {
                    return Err(Error::failed(format!(
                        "incoming disembargo: unknown answer ID {}",
                        pa.question_id
                    )));
                };
                if !ans.flags.return_sent {
                    return Err(Error::failed(format!(
                        "incoming disembargo: answer ID {} has not sent return",
                        pa.question_id
                    )));
                }
                let content = match &ans.results {
                    Some(Ok(content)) => content,
                    _ => {
                        return Err(Error::failed(format!(
                            "incoming disembargo: answer ID {} returned exception",
                            pa.question_id
                        )));
                    }
                };
                let ptr = transform(&content.root, &pa.transform).map_err(|e| {
                    e.context(format!(
                        "incoming disembargo: read answer ID {}",
                        pa.question_id
                    ))
                })?;
                let target = content.cap_at(&ptr);
                let import_id = match target.as_ref().map(|c| &c.kind) {
                    Some(Some(ClientKind::Import(ic))) if self.is_this_conn(&ic.conn) => ic.id,
                    _ => {
                        return Err(Error::failed(
                            "incoming disembargo: sender loopback requested on a capability that is not an import",
                        ));
                    }
                };
                // This implementation never sends a capability while its
                // queue is still draining, so the loopback can echo at once.
                let weak = Arc::downgrade(self);
                self.send_message(
                    &mut st,
                    Ok(Message::Disembargo(Disembargo {
                        target: MessageTarget::ImportedCap(import_id),
                        context: DisembargoContext::ReceiverLoopback(eid),
                    })),
                    Some(Box::new(move |r| {
                        if let (Err(e), Some(core)) = (r, weak.upgrade()) {
                            core.report(
                                &e.context("incoming disembargo: send receiver loopback"),
                            );
                        }
                    })),
                    &mut rl,
                );
                drop(st);
                drop(rl);
                Ok(())
            }
            DisembargoContext::Accept | DisembargoContext::Provide(_) => {
                self.report(&Error::unimplemented(
                    "incoming disembargo: context not implemented",
                ));
                let mut rl = ReleaseList::default();
                let mut st = self.state.lock().unwrap();
                self.send_message(
                    &mut st,
                    Ok(Message::Unimplemented(Box::new(Message::Disembargo(d)))),
                    None,
                    &mut rl,
                );
                drop(st);
                drop(rl);
                Ok(())
            }
        }
    }

    // ===== shutdown =====

    /// Marks the connection as closing and cancels all background work.
    /// Returns whether this call was the one that initiated shutdown.
    fn begin_shutdown(&self, cause: Option<Error>) -> bool {
        let initiated = {
            let mut st = self.state.lock().unwrap();
            if st.closing {
                false
            } else {
                st.closing = true;
                st.abort_cause = cause;
                for ans in st.answers.values_mut() {
                    if let Some(token) = ans.cancel.take() {
                        token.cancel();
                    }
                }
                true
            }
        };
        if initiated {
            self.cancel.cancel();
        }
        initiated
    }

    /// Tears the connection down. Runs exactly once, on the monitor task,
    /// after the receive task has exited. Errors are reported and swallowed;
    /// shutdown does not fail.
    async fn finish_shutdown(&self) {
        let send_handle = {
            let mut st = self.state.lock().unwrap();
            st.send_tx = None;
            st.send_handle.take()
        };
        let sender = match send_handle {
            Some(h) => h.await.ok(),
            None => None,
        };

        let abort_cause;
        {
            let mut rl = ReleaseList::default();
            let mut st = self.state.lock().unwrap();
            abort_cause = st.abort_cause.take();

            let bootstrap = std::mem::take(&mut st.bootstrap);
            rl.push_client(bootstrap);

            for (_, exp) in st.exports.drain() {
                if let Some(meta) = exp.client.meta() {
                    meta.clear_export_id(self.uid);
                }
                rl.push_client(exp.client);
            }
            for (_, embargo) in st.embargoes.drain() {
                rl.defer(move || embargo.wrapper.resolve(Ok(embargo.inner)));
            }
            for (_, ans) in std::mem::take(&mut st.answers) {
                rl.defer(move || drop(ans));
            }
            st.imports.clear();
            for (_, mut q) in st.questions.drain() {
                if q.flags.finished {
                    rl.defer(move || drop(q));
                    continue;
                }
                if let Some(qref) = q.qref.upgrade() {
                    let _ = qref
                        .resolution
                        .set(Err(Error::disconnected("connection closed")));
                }
                let resolver = q.resolver.take();
                let bootstrap = q.bootstrap.take();
                rl.defer(move || {
                    if let Some(tx) = resolver {
                        let _ = tx.send(Err(Error::disconnected("connection closed")));
                    }
                    if let Some(qc) = bootstrap {
                        qc.resolve(Err(Error::disconnected("connection closed")));
                    }
                    drop(q);
                });
            }
            drop(st);
            drop(rl);
        }

        if let Some(mut sender) = sender {
            if let Some(cause) = abort_cause {
                let send_abort = sender.send(Message::Abort(cause.into()));
                if tokio::time::timeout(self.abort_timeout, send_abort)
                    .await
                    .is_err()
                {
                    debug!("timed out sending abort");
                }
            }
            if let Err(e) = sender.close().await {
                self.report(&e.context("close transport"));
            }
        }

        let _ = self.done.send(true);
    }
}

// ===== background tasks =====

/// Drains the send queue, performing all transport writes. On cancellation,
/// residual jobs are failed with `disconnected` and the transport sender is
/// handed back for shutdown's abort message.
async fn send_task(
    mut rx: mpsc::UnboundedReceiver<AsyncSend>,
    mut sender: Box<dyn MessageSender>,
    cancel: CancellationToken,
) -> Box<dyn MessageSender> {
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        job.perform(sender.as_mut()).await;
    }
    rx.close();
    while let Ok(job) = rx.try_recv() {
        job.abort(Error::disconnected("connection closed"));
    }
    sender
}

/// Performs the blocking transport reads so the receive task can always
/// observe cancellation, even when a read cannot be interrupted.
async fn read_task(
    mut receiver: Box<dyn MessageReceiver>,
    tx: mpsc::Sender<Result<Option<Message>>>,
    cancel: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            r = receiver.recv() => r,
        };
        let stop = !matches!(result, Ok(Some(_)));
        if tx.send(result).await.is_err() {
            return;
        }
        if stop {
            return;
        }
    }
}

/// Receives and dispatches messages in transport order. Returning an error
/// aborts the connection with that error as the cause.
async fn receive_task(
    core: Arc<ConnCore>,
    mut incoming: mpsc::Receiver<Result<Option<Message>>>,
) -> Result<()> {
    loop {
        let item = tokio::select! {
            _ = core.cancel.cancelled() => return Ok(()),
            item = incoming.recv() => item,
        };
        let msg = match item {
            None => return Ok(()),
            Some(Err(e)) => return Err(e),
            Some(Ok(None)) => return Err(Error::disconnected("remote closed the connection")),
            Some(Ok(Some(msg))) => msg,
        };
        debug!(message = msg.variant_name(), "received message");
        match msg {
            Message::Abort(exc) => {
                core.report(&Error::from(exc).context("remote abort"));
                return Ok(());
            }
            msg => core.handle_message(msg)?,
        }
    }
}

/// Awaits the receive task and performs shutdown once it exits, reporting
/// its terminal error if any.
async fn monitor(core: Arc<ConnCore>, recv_handle: JoinHandle<Result<()>>) {
    let cause = match recv_handle.await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            if e.kind != ErrorKind::Disconnected {
                core.report(&e);
            }
            Some(e)
        }
        Err(join_err) => {
            let e = Error::failed(format!("receive task failed: {join_err}"));
            core.report(&e);
            Some(e)
        }
    };
    core.begin_shutdown(cause);
    core.finish_shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local;
    use crate::message::{Ptr, Resolution, Resolve, StructValue};
    use crate::twoparty;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn new_pair(bootstrap: Client) -> (Conn, Conn) {
        let ((tx_a, rx_a), (tx_b, rx_b)) = twoparty::pair();
        let a = Conn::new(
            Box::new(tx_a),
            Box::new(rx_a),
            Options {
                bootstrap_client: bootstrap,
                ..Options::default()
            },
        );
        let b = Conn::new(Box::new(tx_b), Box::new(rx_b), Options::default());
        (a, b)
    }

    /// (questions, answers, exports, imports, embargoes)
    fn counts(conn: &Conn) -> (usize, usize, usize, usize, usize) {
        let st = conn.core.state.lock().unwrap();
        (
            st.questions.active_len(),
            st.answers.len(),
            st.exports.active_len(),
            st.imports.len(),
            st.embargoes.active_len(),
        )
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within timeout");
    }

    fn doubler() -> Client {
        local::new_client(local::Server::new().method(0x99, 0, |args| {
            Promise::from_future(async move {
                let x = args.root.as_struct().map(|s| s.get_data(0)).unwrap_or(0);
                let mut s = StructValue::new();
                s.set_data(0, x * 2);
                Ok(Content::from_root(Ptr::Struct(s)))
            })
        }))
    }

    fn gated(gate: Arc<Notify>) -> Client {
        local::new_client(local::Server::new().method(0x99, 1, move |_args| {
            let gate = gate.clone();
            Promise::from_future(async move {
                gate.notified().await;
                Ok(Content::new())
            })
        }))
    }

    #[test]
    fn table_reuses_lowest_free_id() {
        let mut table = Table::new();
        assert_eq!(table.insert('a'), 0);
        assert_eq!(table.insert('b'), 1);
        assert_eq!(table.insert('c'), 2);
        assert_eq!(table.remove(1), Some('b'));
        assert_eq!(table.remove(0), Some('a'));
        assert_eq!(table.insert('d'), 0);
        assert_eq!(table.insert('e'), 1);
        assert_eq!(table.insert('f'), 3);
        assert_eq!(table.active_len(), 4);
    }

    #[test]
    fn table_take_defers_id_reuse() {
        let mut table = Table::new();
        assert_eq!(table.insert('a'), 0);
        assert_eq!(table.take(0), Some('a'));
        // Not freed yet: new entries pick fresh ids.
        assert_eq!(table.insert('b'), 1);
        table.free_id(0);
        assert_eq!(table.insert('c'), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bootstrap_call_and_release_empties_tables() {
        let (a, b) = new_pair(doubler());
        let boot = b.bootstrap();
        let mut req = boot.new_call(Method {
            interface_id: 0x99,
            method_id: 0,
        });
        let mut s = StructValue::new();
        s.set_data(0, 7);
        req.params().root = Ptr::Struct(s);
        let resp = req.send().promise.await.unwrap();
        assert_eq!(resp.root.as_struct().unwrap().get_data(0), 14);
        drop(resp);
        drop(boot);

        eventually(|| counts(&b) == (0, 0, 0, 0, 0) && counts(&a) == (0, 0, 0, 0, 0)).await;

        a.close().await;
        b.done().await;
        assert_eq!(counts(&a), (0, 0, 0, 0, 0));
        assert_eq!(counts(&b), (0, 0, 0, 0, 0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn canceled_call_sends_finish_and_recycles_question() {
        let gate = Arc::new(Notify::new());
        let (a, b) = new_pair(gated(gate));
        let boot = b.bootstrap();
        let rp = boot
            .new_call(Method {
                interface_id: 0x99,
                method_id: 1,
            })
            .send();
        eventually(|| counts(&a).1 == 1).await;

        // Dropping the promise and pipeline cancels the question; the local
        // vat writes a Finish and the remote cancels the running call.
        drop(rp);
        eventually(|| counts(&a).1 == 0 && counts(&b).0 == 0).await;

        // The freed id is available again.
        let mut req = boot.new_call(Method {
            interface_id: 0x99,
            method_id: 1,
        });
        req.params().root = Ptr::Null;
        let rp2 = req.send();
        drop(rp2);
        eventually(|| counts(&b).0 == 0).await;

        b.close().await;
        a.done().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn export_refcount_tracks_retransmission() {
        let (a, b) = new_pair(doubler());
        let boot1 = b.bootstrap();
        let boot2 = b.bootstrap();
        // Force resolution of both bootstrap promises.
        let r1 = boot1
            .new_call(Method {
                interface_id: 0x99,
                method_id: 0,
            })
            .send()
            .promise
            .await;
        assert!(r1.is_ok());
        let r2 = boot2
            .new_call(Method {
                interface_id: 0x99,
                method_id: 0,
            })
            .send()
            .promise
            .await;
        assert!(r2.is_ok());

        eventually(|| counts(&a).2 == 1 && counts(&b).3 == 1).await;
        {
            let st = a.core.state.lock().unwrap();
            let export = st.exports.get(0).expect("bootstrap export");
            assert_eq!(export.wire_refs, 2);
        }

        drop(boot1);
        // Still referenced by boot2: no release happens.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counts(&a).2, 1);

        drop(boot2);
        eventually(|| counts(&a).2 == 0 && counts(&b).3 == 0).await;

        a.close().await;
        b.done().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_message_is_echoed_unimplemented() {
        use crate::{MessageReceiver as _, MessageSender as _};
        let ((tx_a, rx_a), (mut tx_b, mut rx_b)) = twoparty::pair();
        let _a = Conn::new(Box::new(tx_a), Box::new(rx_a), Options::default());
        let sent = Message::Resolve(Resolve {
            promise_id: 9,
            resolution: Resolution::Exception(Error::failed("nope").into()),
        });
        tx_b.send(sent.clone()).await.unwrap();
        let got = loop {
            match rx_b.recv().await.unwrap() {
                Some(Message::Unimplemented(inner)) => break *inner,
                Some(_) => continue,
                None => panic!("stream ended before unimplemented reply"),
            }
        };
        assert_eq!(got, sent);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_sends_abort_and_is_idempotent() {
        use crate::MessageReceiver as _;
        let ((tx_a, rx_a), (_tx_b, mut rx_b)) = twoparty::pair();
        let a = Conn::new(Box::new(tx_a), Box::new(rx_a), Options::default());
        a.close().await;
        a.close().await;
        match rx_b.recv().await.unwrap() {
            Some(Message::Abort(exc)) => assert_eq!(exc.reason, "connection closed"),
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(counts(&a), (0, 0, 0, 0, 0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn outstanding_question_rejected_on_remote_abort() {
        let gate = Arc::new(Notify::new());
        let (a, b) = new_pair(gated(gate));
        let boot = b.bootstrap();
        let rp = boot
            .new_call(Method {
                interface_id: 0x99,
                method_id: 1,
            })
            .send();
        eventually(|| counts(&a).1 == 1).await;

        a.close().await;
        let err = rp.promise.await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Disconnected);
        b.done().await;
        assert_eq!(counts(&b), (0, 0, 0, 0, 0));
    }
}
