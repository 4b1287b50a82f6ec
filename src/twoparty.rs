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

//! Framed transport for the common case of a two-party connection over a
//! byte stream: a little-endian u32 length prefix followed by a
//! bincode-encoded [`Message`].

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf,
                WriteHalf};

use crate::error::{Error, Result};
use crate::message::Message;
use crate::{MessageReceiver, MessageSender};

/// Default bound on the size of a single received message.
pub const DEFAULT_RECV_LIMIT: usize = 8 * 1024 * 1024;

/// Writes length-prefixed messages to a byte stream.
pub struct Sender<W> {
    writer: W,
}

impl<W> Sender<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W> MessageSender for Sender<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn send(&mut self, message: Message) -> BoxFuture<'_, Result<()>> {
        async move {
            let bytes = bincode::serialize(&message)
                .map_err(|e| Error::failed(format!("serialize message: {e}")))?;
            let len = u32::try_from(bytes.len())
                .map_err(|_| Error::failed("serialize message: frame too large"))?;
            self.writer.write_all(&len.to_le_bytes()).await?;
            self.writer.write_all(&bytes).await?;
            self.writer.flush().await?;
            Ok(())
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.writer.shutdown().await?;
            Ok(())
        }
        .boxed()
    }
}

/// Reads length-prefixed messages from a byte stream.
pub struct Receiver<R> {
    reader: R,
    limit: usize,
}

impl<R> Receiver<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            limit: DEFAULT_RECV_LIMIT,
        }
    }

    /// Caps how large a single inbound frame may be. Oversized frames fail
    /// the receive with an error.
    pub fn with_limit(reader: R, limit: usize) -> Self {
        Self { reader, limit }
    }
}

impl<R> MessageReceiver for Receiver<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Message>>> {
        async move {
            let mut len_bytes = [0u8; 4];
            match self.reader.read_exact(&mut len_bytes).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // Clean end of stream at a frame boundary.
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            if len > self.limit {
                return Err(Error::failed(format!(
                    "receive message: frame of {len} bytes exceeds limit of {} bytes",
                    self.limit
                )));
            }
            let mut bytes = vec![0u8; len];
            self.reader.read_exact(&mut bytes).await?;
            let message = bincode::deserialize(&bytes)
                .map_err(|e| Error::failed(format!("deserialize message: {e}")))?;
            Ok(Some(message))
        }
        .boxed()
    }
}

/// One side of an in-memory connection.
pub type PipeSide = (
    Sender<WriteHalf<DuplexStream>>,
    Receiver<ReadHalf<DuplexStream>>,
);

/// Creates a connected pair of in-memory transports, one per vat.
pub fn pair() -> (PipeSide, PipeSide) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    (
        (Sender::new(a_write), Receiver::new(a_read)),
        (Sender::new(b_write), Receiver::new(b_read)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Exception, Message};

    #[tokio::test]
    async fn frame_round_trip() {
        let ((mut tx, _rx_a), (_tx_b, mut rx)) = pair();
        let msg = Message::Abort(Exception {
            kind: crate::ErrorKind::Failed,
            reason: "bye".into(),
        });
        tx.send(msg.clone()).await.unwrap();
        let got = rx.recv().await.unwrap().unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn closed_stream_reads_none() {
        let ((mut tx, _rx_a), (_tx_b, mut rx)) = pair();
        tx.close().await.unwrap();
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (a, b) = tokio::io::duplex(1024);
        let (_a_read, mut a_write) = tokio::io::split(a);
        let (b_read, _b_write) = tokio::io::split(b);
        let mut rx = Receiver::with_limit(b_read, 16);
        a_write.write_all(&1024u32.to_le_bytes()).await.unwrap();
        a_write.write_all(&[0u8; 32]).await.unwrap();
        assert!(rx.recv().await.is_err());
    }
}
