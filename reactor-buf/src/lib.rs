//! Byte containers backing a channel: a bounded receive ring buffer and an
//! ordered send list of pending chunks, plus a [`Stream`] adapter presenting
//! both as a single byte-oriented interface to application code.

use std::collections::VecDeque;
use std::io;

use bytes::{Bytes, BytesMut};

pub const DEFAULT_RECV_BUFFER_LEN: usize = 16 * 1024;
pub const DEFAULT_SEND_LIST_COUNT: usize = i32::MAX as usize;

/// Bounded FIFO of received bytes. Writes beyond capacity are rejected
/// rather than silently dropped, so the caller can translate the condition
/// into `RecvBufferFull`.
pub struct RecvBuffer {
    data: BytesMut,
    capacity: usize,
}

impl RecvBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_RECV_BUFFER_LEN
        } else {
            capacity
        };
        Self {
            data: BytesMut::with_capacity(capacity.min(DEFAULT_RECV_BUFFER_LEN)),
            capacity,
        }
    }

    pub fn available(&self) -> usize {
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Appends as much of `chunk` as fits. Returns the number of bytes
    /// accepted; a short count means the buffer is full.
    pub fn push(&mut self, chunk: &[u8]) -> usize {
        let n = chunk.len().min(self.remaining_capacity());
        self.data.extend_from_slice(&chunk[..n]);
        n
    }

    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.data.len());
        out[..n].copy_from_slice(&self.data[..n]);
        let _ = self.data.split_to(n);
        n
    }

    pub fn peek(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.data.len());
        out[..n].copy_from_slice(&self.data[..n]);
        n
    }

    pub fn is_full(&self) -> bool {
        self.remaining_capacity() == 0
    }
}

#[derive(Debug)]
pub struct SendListFull;

/// Ordered sequence of byte chunks awaiting delivery. `max_chunks` bounds the
/// number of outstanding `push`es, not the total byte count, matching the
/// `max_send_list_count` configuration knob.
pub struct SendList {
    chunks: VecDeque<Bytes>,
    max_chunks: usize,
}

pub enum DrainOutcome {
    Complete,
    Partial,
}

impl SendList {
    pub fn with_capacity(max_chunks: usize) -> Self {
        let max_chunks = if max_chunks == 0 {
            DEFAULT_SEND_LIST_COUNT
        } else {
            max_chunks
        };
        Self {
            chunks: VecDeque::new(),
            max_chunks,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn max_chunks(&self) -> usize {
        self.max_chunks
    }

    pub fn push(&mut self, chunk: Bytes) -> Result<(), SendListFull> {
        debug_assert!(!chunk.is_empty(), "0-byte writes are not permitted");
        if self.chunks.len() >= self.max_chunks {
            return Err(SendListFull);
        }
        self.chunks.push_back(chunk);
        Ok(())
    }

    /// Drains as much as `writer` accepts. `writer` returns the number of
    /// bytes it consumed from the front chunk, or an I/O error.
    pub fn drain_with(
        &mut self,
        mut writer: impl FnMut(&[u8]) -> io::Result<usize>,
    ) -> io::Result<DrainOutcome> {
        while let Some(front) = self.chunks.front_mut() {
            let n = writer(front)?;
            if n == 0 {
                return Ok(DrainOutcome::Partial);
            }
            if n >= front.len() {
                self.chunks.pop_front();
            } else {
                let _ = front.split_to(n);
                return Ok(DrainOutcome::Partial);
            }
        }
        Ok(DrainOutcome::Complete)
    }
}

/// Byte-oriented adapter over a channel's receive buffer and send list,
/// handed to application code so it never touches the socket directly.
pub struct Stream<'a> {
    recv: &'a mut RecvBuffer,
    send: &'a mut SendList,
}

impl<'a> Stream<'a> {
    pub fn new(recv: &'a mut RecvBuffer, send: &'a mut SendList) -> Self {
        Self { recv, send }
    }

    pub fn available(&self) -> usize {
        self.recv.available()
    }

    pub fn read(&mut self, out: &mut [u8]) -> usize {
        self.recv.read(out)
    }

    pub fn peek(&self, out: &mut [u8]) -> usize {
        self.recv.peek(out)
    }

    pub fn push(&mut self, chunk: Bytes) -> Result<(), SendListFull> {
        self.send.push(chunk)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), SendListFull> {
        self.send.push(Bytes::copy_from_slice(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_buffer_rejects_overflow_bytes() {
        let mut buf = RecvBuffer::with_capacity(4);
        assert_eq!(buf.push(b"abcdef"), 4);
        assert!(buf.is_full());
        let mut out = [0u8; 8];
        assert_eq!(buf.read(&mut out), 4);
        assert_eq!(&out[..4], b"abcd");
    }

    #[test]
    fn send_list_rejects_past_capacity() {
        let mut list = SendList::with_capacity(1);
        assert!(list.push(Bytes::from_static(b"a")).is_ok());
        assert!(list.push(Bytes::from_static(b"b")).is_err());
    }

    #[test]
    fn send_list_drains_partial_writes() {
        let mut list = SendList::with_capacity(4);
        list.push(Bytes::from_static(b"hello")).unwrap();
        let mut written = Vec::new();
        let outcome = list
            .drain_with(|chunk| {
                let n = 2.min(chunk.len());
                written.extend_from_slice(&chunk[..n]);
                Ok(n)
            })
            .unwrap();
        assert!(matches!(outcome, DrainOutcome::Partial));
        assert_eq!(written, b"he");
        assert!(!list.is_empty());
    }
}
