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

//! Capabilities that fail every operation with a fixed error.

use std::sync::Arc;

use crate::client::{
    Client, ClientKind, Content, Metadata, Pipeline, PipelineCaller, Promise, Recv, RemotePromise,
};
use crate::error::Error;
use crate::message::{Method, PipelineOp};

pub(crate) struct BrokenClient {
    error: Error,
    meta: Metadata,
}

impl BrokenClient {
    pub(crate) fn meta(&self) -> &Metadata {
        &self.meta
    }

    pub(crate) fn send_call(&self, _method: Method, _params: Content) -> RemotePromise {
        RemotePromise {
            promise: Promise::err(self.error.clone()),
            pipeline: Pipeline::broken(self.error.clone()),
        }
    }

    pub(crate) fn recv_call(&self, recv: Recv) -> Arc<dyn PipelineCaller> {
        recv.returner.return_results(Err(self.error.clone()));
        new_caller(self.error.clone())
    }
}

pub(crate) struct BrokenPipelineCaller {
    error: Error,
}

impl PipelineCaller for BrokenPipelineCaller {
    fn pipeline_recv(&self, _transform: Vec<PipelineOp>, recv: Recv) -> Arc<dyn PipelineCaller> {
        recv.returner.return_results(Err(self.error.clone()));
        new_caller(self.error.clone())
    }

    fn pipelined_client(&self, _ops: Vec<PipelineOp>) -> Client {
        Client::error(self.error.clone())
    }
}

pub(crate) fn new_cap(error: Error) -> Client {
    Client {
        kind: Some(ClientKind::Broken(Arc::new(BrokenClient {
            error,
            meta: Metadata::default(),
        }))),
    }
}

pub(crate) fn new_caller(error: Error) -> Arc<dyn PipelineCaller> {
    Arc::new(BrokenPipelineCaller { error })
}
