// Copyright 2026 The teltubby Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A small buffered channel abstraction used to stream item bytes from a
//! transport fetch into a hasher and an object-store upload at the same
//! time, without ever materializing the whole item in memory.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use teltubby_error::{make_err, Code, Error};

/// Creates a connected writer/reader pair. The channel holds at most two
/// in-flight chunks, which is enough to let the writer stay a little ahead
/// of a slow reader without unbounded buffering.
#[must_use]
pub fn make_buf_channel_pair() -> (DropCloserWriteHalf, DropCloserReadHalf) {
    let (tx, rx) = mpsc::channel(2);
    let (close_tx, close_rx) = oneshot::channel();
    (
        DropCloserWriteHalf {
            tx: Some(tx),
            bytes_written: 0,
            close_rx,
        },
        DropCloserReadHalf {
            rx,
            close_tx: Some(close_tx),
        },
    )
}

pub struct DropCloserWriteHalf {
    tx: Option<mpsc::Sender<Result<Bytes, Error>>>,
    bytes_written: u64,
    close_rx: oneshot::Receiver<Result<(), Error>>,
}

impl DropCloserWriteHalf {
    pub async fn send(&mut self, buf: Bytes) -> Result<(), Error> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| make_err!(Code::Internal, "Tried to send on a closed channel"))?;
        debug_assert!(!buf.is_empty(), "use send_eof() to signal end of stream");
        let len = buf.len() as u64;
        let result = tx
            .send(Ok(buf))
            .await
            .map_err(|_| make_err!(Code::Internal, "Receiver disconnected"));
        if result.is_err() {
            self.tx = None;
        }
        self.bytes_written += len;
        result
    }

    /// Signals end of stream and waits for the reader to acknowledge it
    /// drained cleanly, surfacing any error the reader observed.
    pub async fn send_eof(mut self) -> Result<(), Error> {
        self.tx = None;
        self.close_rx
            .await
            .map_err(|_| make_err!(Code::Internal, "Reader went away before acking EOF"))?
    }

    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

pub struct DropCloserReadHalf {
    rx: mpsc::Receiver<Result<Bytes, Error>>,
    close_tx: Option<oneshot::Sender<Result<(), Error>>>,
}

impl DropCloserReadHalf {
    /// Receives the next chunk. An empty [`Bytes`] means EOF.
    pub async fn recv(&mut self) -> Result<Bytes, Error> {
        match self.rx.recv().await {
            Some(Ok(chunk)) => Ok(chunk),
            Some(Err(e)) => Err(e),
            None => {
                if let Some(close_tx) = self.close_tx.take() {
                    let _ = close_tx.send(Ok(()));
                }
                Ok(Bytes::new())
            }
        }
    }
}

impl Drop for DropCloserReadHalf {
    fn drop(&mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(Err(make_err!(
                Code::Internal,
                "Reader dropped before receiving EOF"
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_chunks_and_eof() {
        let (mut tx, mut rx) = make_buf_channel_pair();
        let send_task = tokio::spawn(async move {
            tx.send(Bytes::from_static(b"abc")).await.unwrap();
            tx.send(Bytes::from_static(b"def")).await.unwrap();
            tx.send_eof().await.unwrap();
        });

        let mut collected = Vec::new();
        loop {
            let chunk = rx.recv().await.unwrap();
            if chunk.is_empty() {
                break;
            }
            collected.extend_from_slice(&chunk);
        }
        send_task.await.unwrap();
        assert_eq!(collected, b"abcdef");
    }
}
