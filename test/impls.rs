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

//! Capability implementations used by the scenario tests.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use vat_rpc::{local, Client, Content, Method, Promise, Ptr, StructValue};

pub const TEST_INTERFACE: u64 = 0xbeef;
pub const METHOD_DOUBLE: u16 = 0;
pub const METHOD_MAKE_COUNTER: u16 = 1;
pub const METHOD_ECHO_CAP: u16 = 2;
pub const METHOD_HOLD: u16 = 3;

pub const COUNTER_INTERFACE: u64 = 0xcafe;
pub const METHOD_RECORD: u16 = 0;

pub fn method(method_id: u16) -> Method {
    Method {
        interface_id: TEST_INTERFACE,
        method_id,
    }
}

pub fn record_method() -> Method {
    Method {
        interface_id: COUNTER_INTERFACE,
        method_id: METHOD_RECORD,
    }
}

/// A shared, ordered record of which calls reached a capability.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<u64>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, value: u64) {
        self.0.lock().unwrap().push(value);
    }

    pub fn entries(&self) -> Vec<u64> {
        self.0.lock().unwrap().clone()
    }
}

/// A capability whose `record` method appends its first data word to `log`.
pub fn recorder(log: CallLog) -> Client {
    local::new_client(local::Server::new().method(
        COUNTER_INTERFACE,
        METHOD_RECORD,
        move |args| {
            let log = log.clone();
            Promise::from_future(async move {
                let value = args.root.as_struct().map(|s| s.get_data(0)).unwrap_or(0);
                log.push(value);
                let mut s = StructValue::new();
                s.set_data(0, value);
                Ok(Content::from_root(Ptr::Struct(s)))
            })
        },
    ))
}

/// The bootstrap interface for the scenario tests.
///
/// * `double`: returns `{2x}` for args `{x}`.
/// * `make_counter`: waits for `gate`, then returns a fresh recorder
///   capability in pointer field 0.
/// * `echo_cap`: returns the capability found in pointer field 0 of its
///   arguments, unchanged, in pointer field 0 of its results.
/// * `hold`: waits for `gate` before returning; used to keep a question
///   outstanding.
pub fn bootstrap_server(log: CallLog, gate: Arc<Notify>) -> Client {
    let make_counter_gate = gate.clone();
    let make_counter_log = log.clone();
    local::new_client(
        local::Server::new()
            .method(TEST_INTERFACE, METHOD_DOUBLE, |args| {
                Promise::from_future(async move {
                    let x = args.root.as_struct().map(|s| s.get_data(0)).unwrap_or(0);
                    let mut s = StructValue::new();
                    s.set_data(0, x * 2);
                    Ok(Content::from_root(Ptr::Struct(s)))
                })
            })
            .method(TEST_INTERFACE, METHOD_MAKE_COUNTER, move |_args| {
                let gate = make_counter_gate.clone();
                let log = make_counter_log.clone();
                Promise::from_future(async move {
                    gate.notified().await;
                    let mut results = Content::new();
                    let cap = results.add_cap(recorder(log));
                    let mut s = StructValue::new();
                    s.set_ptr(0, cap);
                    results.root = Ptr::Struct(s);
                    Ok(results)
                })
            })
            .method(TEST_INTERFACE, METHOD_ECHO_CAP, |args| {
                Promise::from_future(async move {
                    let slot = args
                        .root
                        .as_struct()
                        .map(|s| s.ptr(0))
                        .unwrap_or(Ptr::Null);
                    let client = args.cap_at(&slot).unwrap_or_else(Client::null);
                    let mut results = Content::new();
                    let cap = results.add_cap(client);
                    let mut s = StructValue::new();
                    s.set_ptr(0, cap);
                    results.root = Ptr::Struct(s);
                    Ok(results)
                })
            })
            .method(TEST_INTERFACE, METHOD_HOLD, move |_args| {
                let gate = gate.clone();
                Promise::from_future(async move {
                    gate.notified().await;
                    Ok(Content::new())
                })
            }),
    )
}
