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

//! The level-1 RPC message set and the minimal value model carried in
//! payloads.
//!
//! Messages are tagged variants rather than hand-parsed unions; the transport
//! decides how they are framed on the wire. The value model (`Ptr`,
//! `StructValue`) stands in for the Cap'n Proto pointer layer: it supports
//! exactly what the connection core needs, namely struct construction,
//! pointer-field traversal, and capability slots indexed into a message's
//! capability table.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

pub type QuestionId = u32;
pub type AnswerId = QuestionId;
pub type ExportId = u32;
pub type ImportId = ExportId;
pub type EmbargoId = u32;

/// Identifies a method within an interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Method {
    pub interface_id: u64,
    pub method_id: u16,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{:#x}/{}", self.interface_id, self.method_id)
    }
}

/// A value reachable from a payload's content pointer.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub enum Ptr {
    #[default]
    Null,
    Struct(StructValue),
    /// An interface slot: an index into the enclosing message's capability
    /// table.
    Cap(u32),
    Data(Vec<u8>),
    Text(String),
    List(Vec<Ptr>),
}

impl Ptr {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_struct(&self) -> Option<&StructValue> {
        match self {
            Self::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_cap(&self) -> Option<u32> {
        match self {
            Self::Cap(i) => Some(*i),
            _ => None,
        }
    }
}

/// A struct value: a data section of words and a pointer section.
/// Out-of-range reads yield defaults, as in the Cap'n Proto data model.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct StructValue {
    pub data: Vec<u64>,
    pub ptrs: Vec<Ptr>,
}

impl StructValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_data(&self, index: usize) -> u64 {
        self.data.get(index).copied().unwrap_or(0)
    }

    pub fn set_data(&mut self, index: usize, value: u64) {
        if self.data.len() <= index {
            self.data.resize(index + 1, 0);
        }
        self.data[index] = value;
    }

    pub fn ptr(&self, index: usize) -> Ptr {
        self.ptrs.get(index).cloned().unwrap_or(Ptr::Null)
    }

    pub fn set_ptr(&mut self, index: usize, value: Ptr) {
        if self.ptrs.len() <= index {
            self.ptrs.resize(index + 1, Ptr::Null);
        }
        self.ptrs[index] = value;
    }
}

/// One step of a promise pipeline path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineOp {
    Noop,
    GetPointerField(u16),
}

/// Applies a pipeline transform to a value. Traversing a pointer field of a
/// null value yields null; traversing a field of any other non-struct value
/// is an error.
pub fn transform(value: &Ptr, ops: &[PipelineOp]) -> Result<Ptr> {
    let mut current = value.clone();
    for op in ops {
        match op {
            PipelineOp::Noop => {}
            PipelineOp::GetPointerField(index) => {
                current = match current {
                    Ptr::Null => Ptr::Null,
                    Ptr::Struct(s) => s.ptr(*index as usize),
                    _ => {
                        return Err(Error::failed(format!(
                            "transform: pointer field {index} of non-struct value"
                        )))
                    }
                };
            }
        }
    }
    Ok(current)
}

/// A capability slot in a payload's capability table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CapDescriptor {
    None,
    SenderHosted(ExportId),
    SenderPromise(ExportId),
    ReceiverHosted(ExportId),
    ReceiverAnswer(PromisedAnswer),
    ThirdPartyHosted(u32),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromisedAnswer {
    pub question_id: QuestionId,
    pub transform: Vec<PipelineOp>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MessageTarget {
    ImportedCap(ExportId),
    PromisedAnswer(PromisedAnswer),
}

/// A content pointer plus the descriptors of every capability it references.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Payload {
    pub content: Ptr,
    pub cap_table: Vec<CapDescriptor>,
}

/// A wire-encodable error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Exception {
    pub kind: ErrorKind,
    pub reason: String,
}

impl From<Error> for Exception {
    fn from(e: Error) -> Self {
        Self {
            kind: e.kind,
            reason: e.reason,
        }
    }
}

impl From<Exception> for Error {
    fn from(e: Exception) -> Self {
        Self {
            kind: e.kind,
            reason: e.reason,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendResultsTo {
    Caller,
    Yourself,
    ThirdParty,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub question_id: QuestionId,
    pub target: MessageTarget,
    pub method: Method,
    pub params: Payload,
    pub send_results_to: SendResultsTo,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReturnBody {
    Results(Payload),
    Exception(Exception),
    Canceled,
    ResultsSentElsewhere,
    TakeFromOtherQuestion(QuestionId),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Return {
    pub answer_id: AnswerId,
    pub release_param_caps: bool,
    pub body: ReturnBody,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Resolution {
    Cap(CapDescriptor),
    Exception(Exception),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resolve {
    pub promise_id: ExportId,
    pub resolution: Resolution,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisembargoContext {
    SenderLoopback(EmbargoId),
    ReceiverLoopback(EmbargoId),
    Accept,
    Provide(QuestionId),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Disembargo {
    pub target: MessageTarget,
    pub context: DisembargoContext,
}

/// A top-level RPC message.
///
/// The first eight variants carry full level-1 semantics. The remaining ones
/// are recognized only so that they can be echoed back inside
/// `Unimplemented`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Unimplemented(Box<Message>),
    Abort(Exception),
    Bootstrap {
        question_id: QuestionId,
    },
    Call(Box<Call>),
    Return(Box<Return>),
    Finish {
        question_id: QuestionId,
        release_result_caps: bool,
    },
    Release {
        id: ImportId,
        reference_count: u32,
    },
    Disembargo(Disembargo),
    Resolve(Resolve),
    Provide {
        question_id: QuestionId,
        target: MessageTarget,
        recipient: Ptr,
    },
    Accept {
        question_id: QuestionId,
        provision: Ptr,
        embargo: bool,
    },
    Join {
        question_id: QuestionId,
        target: MessageTarget,
        key_part: Ptr,
    },
}

impl Message {
    pub(crate) fn variant_name(&self) -> &'static str {
        match self {
            Self::Unimplemented(_) => "unimplemented",
            Self::Abort(_) => "abort",
            Self::Bootstrap { .. } => "bootstrap",
            Self::Call(_) => "call",
            Self::Return(_) => "return",
            Self::Finish { .. } => "finish",
            Self::Release { .. } => "release",
            Self::Disembargo(_) => "disembargo",
            Self::Resolve(_) => "resolve",
            Self::Provide { .. } => "provide",
            Self::Accept { .. } => "accept",
            Self::Join { .. } => "join",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Ptr {
        let mut inner = StructValue::new();
        inner.set_data(0, 14);
        inner.set_ptr(1, Ptr::Cap(3));
        let mut outer = StructValue::new();
        outer.set_ptr(0, Ptr::Struct(inner));
        Ptr::Struct(outer)
    }

    #[test]
    fn transform_walks_pointer_fields() {
        let v = sample();
        let ops = [
            PipelineOp::GetPointerField(0),
            PipelineOp::Noop,
            PipelineOp::GetPointerField(1),
        ];
        assert_eq!(transform(&v, &ops).unwrap(), Ptr::Cap(3));
    }

    #[test]
    fn transform_of_missing_field_is_null() {
        let v = sample();
        let ops = [
            PipelineOp::GetPointerField(7),
            PipelineOp::GetPointerField(0),
        ];
        assert_eq!(transform(&v, &ops).unwrap(), Ptr::Null);
    }

    #[test]
    fn transform_through_data_fails() {
        let v = Ptr::Data(vec![1, 2, 3]);
        assert!(transform(&v, &[PipelineOp::GetPointerField(0)]).is_err());
    }

    #[test]
    fn struct_reads_default_out_of_range() {
        let s = StructValue::new();
        assert_eq!(s.get_data(9), 0);
        assert_eq!(s.ptr(9), Ptr::Null);
    }
}
