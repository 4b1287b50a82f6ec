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

//! Error type shared by the RPC core and its transports.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The general nature of an error. Mirrors the exception types defined by the
/// Cap'n Proto RPC protocol, so errors can cross the wire losslessly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Something went wrong. The default.
    Failed,

    /// The call failed because of a temporary lack of resources. The caller
    /// may retry later.
    Overloaded,

    /// The connection to the remote vat is no longer usable.
    Disconnected,

    /// The requested method or feature is not implemented.
    Unimplemented,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed => write!(f, "failed"),
            Self::Overloaded => write!(f, "overloaded"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Unimplemented => write!(f, "unimplemented"),
        }
    }
}

/// An error with a kind and a human-readable reason. As an error propagates
/// outward, callers prefix the reason with context via [`Error::context()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub reason: String,
}

impl Error {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Failed,
            reason: reason.into(),
        }
    }

    pub fn overloaded(reason: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Overloaded,
            reason: reason.into(),
        }
    }

    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Disconnected,
            reason: reason.into(),
        }
    }

    pub fn unimplemented(reason: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Unimplemented,
            reason: reason.into(),
        }
    }

    /// Prefixes the reason with `context`, preserving the kind.
    pub fn context(mut self, context: impl AsRef<str>) -> Self {
        self.reason = format!("{}: {}", context.as_ref(), self.reason);
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match e.kind() {
            Io::UnexpectedEof | Io::BrokenPipe | Io::ConnectionReset | Io::ConnectionAborted => {
                Self::disconnected(e.to_string())
            }
            _ => Self::failed(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_prefixes_reason() {
        let e = Error::failed("boom").context("incoming call").context("rpc");
        assert_eq!(e.kind, ErrorKind::Failed);
        assert_eq!(e.reason, "rpc: incoming call: boom");
    }

    #[test]
    fn io_eof_maps_to_disconnected() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(Error::from(io).kind, ErrorKind::Disconnected);
    }
}
