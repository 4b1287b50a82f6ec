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

//! End-to-end scenarios between two in-process vats.

pub mod impls;
pub mod test_util;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use vat_rpc::{ErrorKind, Options, PipelineOp, Ptr, StructValue};

use impls::{
    bootstrap_server, method, record_method, CallLog, METHOD_DOUBLE, METHOD_ECHO_CAP,
    METHOD_HOLD, METHOD_MAKE_COUNTER,
};
use test_util::{connected_pair, within};

fn number_args(x: u64) -> Ptr {
    let mut s = StructValue::new();
    s.set_data(0, x);
    Ptr::Struct(s)
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_round_trip() {
    let log = CallLog::new();
    let gate = Arc::new(Notify::new());
    let (server, client) = connected_pair(bootstrap_server(log, gate), Options::default());

    let boot = client.bootstrap();
    let mut req = boot.new_call(method(METHOD_DOUBLE));
    req.params().root = number_args(7);
    let response = within(req.send().promise).await.unwrap();
    assert_eq!(response.root.as_struct().unwrap().get_data(0), 14);

    drop(boot);
    within(server.close()).await;
    within(client.done()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_bootstrap_interface_fails_calls() {
    let (server, client) = connected_pair(vat_rpc::Client::null(), Options::default());
    let boot = client.bootstrap();
    let err = within(boot.new_call(method(METHOD_DOUBLE)).send().promise)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Failed);
    assert!(err.reason.contains("bootstrap"));
    within(client.close()).await;
    within(server.done()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unimplemented_method_rejects_call() {
    let log = CallLog::new();
    let gate = Arc::new(Notify::new());
    let (server, client) = connected_pair(bootstrap_server(log, gate), Options::default());

    let boot = client.bootstrap();
    let err = within(boot.new_call(method(77)).send().promise)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Unimplemented);

    within(client.close()).await;
    within(server.done()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pipelined_call_reaches_promised_capability() {
    let log = CallLog::new();
    let gate = Arc::new(Notify::new());
    let (server, client) =
        connected_pair(bootstrap_server(log.clone(), gate.clone()), Options::default());

    let boot = client.bootstrap();
    let rp = boot.new_call(method(METHOD_MAKE_COUNTER)).send();
    let counter = rp.pipeline.get(vec![PipelineOp::GetPointerField(0)]);
    let mut record = counter.new_call(record_method());
    record.params().root = number_args(5);
    let record_promise = record.send().promise;

    // Give the pipelined call time to arrive while make_counter is still
    // executing, then let it finish.
    tokio::time::sleep(Duration::from_millis(20)).await;
    gate.notify_one();

    within(rp.promise).await.unwrap();
    let recorded = within(record_promise).await.unwrap();
    assert_eq!(recorded.root.as_struct().unwrap().get_data(0), 5);
    assert_eq!(log.entries(), vec![5]);

    within(client.close()).await;
    within(server.done()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn embargoed_calls_deliver_in_send_order() {
    let server_log = CallLog::new();
    let gate = Arc::new(Notify::new());
    let (server, client) =
        connected_pair(bootstrap_server(server_log, gate), Options::default());

    // A capability hosted by the *client* vat, passed to the server and
    // echoed straight back in the results.
    let local_log = CallLog::new();
    let local_cap = impls::recorder(local_log.clone());

    let boot = client.bootstrap();
    let mut req = boot.new_call(method(METHOD_ECHO_CAP));
    let cap_ptr = req.params().add_cap(local_cap);
    let mut args = StructValue::new();
    args.set_ptr(0, cap_ptr);
    req.params().root = Ptr::Struct(args);
    let rp = req.send();

    // Pipeline a call through the not-yet-returned result slot. It takes the
    // long way around: client -> server -> back to the client's capability.
    let pipelined = rp.pipeline.get(vec![PipelineOp::GetPointerField(0)]);
    let mut first = pipelined.new_call(record_method());
    first.params().root = number_args(1);
    let first_promise = first.send().promise;

    // The returned slot resolves to a capability we host, so it comes back
    // embargoed: new calls must queue behind the pipelined one.
    let response = within(rp.promise).await.unwrap();
    let slot = response.root.as_struct().unwrap().ptr(0);
    let echoed = response.cap_at(&slot).unwrap();
    let mut second = echoed.new_call(record_method());
    second.params().root = number_args(2);
    let second_promise = second.send().promise;

    within(first_promise).await.unwrap();
    within(second_promise).await.unwrap();
    assert_eq!(local_log.entries(), vec![1, 2]);

    within(client.close()).await;
    within(server.done()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_abort_rejects_outstanding_questions() {
    let log = CallLog::new();
    let gate = Arc::new(Notify::new());

    let reports = Arc::new(AtomicUsize::new(0));
    let reports_seen = reports.clone();
    let (server, client) = connected_pair(
        bootstrap_server(log, gate),
        Options {
            error_reporter: Some(vat_rpc::reporter(move |_e| {
                reports_seen.fetch_add(1, Ordering::SeqCst);
            })),
            ..Options::default()
        },
    );

    let boot = client.bootstrap();
    let hold_promise = boot.new_call(method(METHOD_HOLD)).send().promise;

    // Let the call reach the server before tearing the connection down.
    tokio::time::sleep(Duration::from_millis(20)).await;
    within(server.close()).await;

    let err = within(hold_promise).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Disconnected);
    within(client.done()).await;
    assert!(reports.load(Ordering::SeqCst) >= 1, "abort was not reported");

    // Once done has fired, no further reports arrive.
    let settled = reports.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(reports.load(Ordering::SeqCst), settled);
}

#[tokio::test(flavor = "multi_thread")]
async fn calls_after_close_fail_disconnected() {
    let log = CallLog::new();
    let gate = Arc::new(Notify::new());
    let (server, client) = connected_pair(bootstrap_server(log, gate), Options::default());

    within(client.close()).await;
    within(server.done()).await;

    let boot = client.bootstrap();
    let err = within(boot.new_call(method(METHOD_DOUBLE)).send().promise)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Disconnected);
}

#[tokio::test(flavor = "multi_thread")]
async fn sequential_calls_preserve_delivery_order() {
    let log = CallLog::new();
    let gate = Arc::new(Notify::new());
    let (server, client) = connected_pair(bootstrap_server(log, gate), Options::default());

    // Calls on the same capability must be delivered in send order.
    let local_log = CallLog::new();
    let cap = impls::recorder(local_log.clone());
    let mut promises = Vec::new();
    for i in 0..10 {
        let mut req = cap.new_call(record_method());
        req.params().root = number_args(i);
        promises.push(req.send().promise);
    }
    for p in promises {
        within(p).await.unwrap();
    }
    assert_eq!(local_log.entries(), (0..10).collect::<Vec<_>>());

    within(client.close()).await;
    within(server.done()).await;
}
