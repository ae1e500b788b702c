//! The read/write substrate shared by the client and server: an
//! async-runtime-agnostic [`Connection`] seam plus [`AsyncBuffers`], which
//! hides line extraction, fixed-size body extraction, and exact-size
//! bulk writes behind a small set of operations.

use crate::error::Error;
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use std::time::Duration;

/// A connection is an async interface to a socket, implemented by each
/// runtime crate (tokio, async-std) over its own stream type.
#[async_trait]
pub trait Connection: Send {
    async fn connect(addr: String) -> Result<Self, Error>
    where
        Self: Sized;

    /// Reads at least one byte into `buf`, appending to whatever is
    /// already there. Returns the number of bytes read; `0` means EOF.
    async fn read(&mut self, buf: &mut BytesMut) -> Result<usize, Error>;

    async fn write_all(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Arms (or disarms, with `None`) a per-read timeout. The watermark
    /// applies to the runtime's own read call, not to this trait's
    /// default implementation, since enforcing it requires the runtime's
    /// own timer (`tokio::time::timeout`, `async_std::future::timeout`).
    /// A runtime that never calls this keeps reading without a timeout.
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) {}

    /// Arms (or disarms, with `None`) a per-write timeout. See
    /// `set_read_timeout`.
    fn set_write_timeout(&mut self, _timeout: Option<Duration>) {}
}

/// Per-connection read/write buffers. Holds exactly one growable read
/// buffer and one growable write buffer; both are drained into or filled
/// from a [`Connection`] by the client/server drive loops.
pub struct AsyncBuffers {
    read: BytesMut,
    /// Bytes consumed from the front of `read` by `read_line`/`read_fixed`
    /// but not yet physically discarded; discarded on `read_flush`.
    consumed: usize,
    min_initial: usize,
    max_initial: usize,
    write: BytesMut,
}

impl AsyncBuffers {
    pub fn new(min_initial: usize, max_initial: usize) -> Self {
        Self {
            read: BytesMut::with_capacity(min_initial),
            consumed: 0,
            min_initial,
            max_initial,
            write: BytesMut::new(),
        }
    }

    /// Returns the next `\r\n`- or `\n`-terminated line (terminator
    /// stripped), or `None` if no complete line is yet buffered. The
    /// returned bytes remain valid until the next `read_flush`.
    pub fn read_line(&mut self) -> Option<BytesMut> {
        let haystack = &self.read[self.consumed..];
        let pos = haystack.iter().position(|&b| b == b'\n')?;
        let mut line_end = self.consumed + pos;
        let line_start = self.consumed;
        if line_end > line_start && self.read[line_end - 1] == b'\r' {
            line_end -= 1;
        }
        let line = BytesMut::from(&self.read[line_start..line_end]);
        self.consumed += pos + 1;
        Some(line)
    }

    /// Returns a slice of exactly `n` bytes from the front of the read
    /// buffer, or `None` if fewer than `n` are buffered.
    pub fn read_fixed(&mut self, n: usize) -> Option<BytesMut> {
        if self.read.len() - self.consumed < n {
            return None;
        }
        let start = self.consumed;
        let data = BytesMut::from(&self.read[start..start + n]);
        self.consumed += n;
        Some(data)
    }

    /// Parks until `n` bytes are available past the current cursor, then
    /// returns them. This is the async/await expression of the source's
    /// `read_fixed_helper`: rather than telling the event loop to wake the
    /// connection only once `n` bytes are ready, the future itself does
    /// not resolve until then.
    pub async fn read_fixed_helper<C: Connection>(
        &mut self,
        conn: &mut C,
        n: usize,
    ) -> Result<BytesMut, Error> {
        loop {
            if let Some(data) = self.read_fixed(n) {
                return Ok(data);
            }
            self.fill(conn).await?;
        }
    }

    /// Reads one more line, filling the buffer from `conn` as needed.
    pub async fn read_line_helper<C: Connection>(
        &mut self,
        conn: &mut C,
    ) -> Result<BytesMut, Error> {
        loop {
            if let Some(line) = self.read_line() {
                return Ok(line);
            }
            self.fill(conn).await?;
        }
    }

    async fn fill<C: Connection>(&mut self, conn: &mut C) -> Result<(), Error> {
        self.read_flush();
        let want = self.min_initial.max(4096);
        if self.read.capacity() - self.read.len() < want {
            self.read.reserve(want);
        }
        if self.read.len() >= self.max_initial {
            return Err(Error::Protocol("read buffer exceeded max_initial".into()));
        }
        let n = conn.read(&mut self.read).await?;
        if n == 0 {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Releases buffered bytes up to the current read cursor.
    pub fn read_flush(&mut self) {
        if self.consumed > 0 {
            self.read.advance(self.consumed);
            self.consumed = 0;
        }
    }

    /// Re-arms the read watermarks for the next request.
    pub fn read_reset(&mut self, min_initial: usize, max_initial: usize) {
        self.min_initial = min_initial;
        self.max_initial = max_initial;
    }

    /// Appends raw bytes directly to the write buffer, outside of a
    /// `BulkWrite` reservation. Used by the reorderer to splice already-
    /// formatted reply bytes into the wire stream.
    pub fn write_raw(&mut self, data: &[u8]) {
        self.write.put_slice(data);
    }

    /// Opens an exact-size bulk write against this buffer's write half.
    pub fn bulk_write(&mut self, exact_size: usize) -> BulkWrite<'_> {
        BulkWrite::new(&mut self.write, exact_size)
    }

    /// Drains and returns everything pending in the write buffer.
    pub fn take_write_buffer(&mut self) -> BytesMut {
        std::mem::take(&mut self.write)
    }

    pub fn write_buffer_is_empty(&self) -> bool {
        self.write.is_empty()
    }

    pub async fn flush<C: Connection>(&mut self, conn: &mut C) -> Result<(), Error> {
        if self.write.is_empty() {
            return Ok(());
        }
        let buf = self.take_write_buffer();
        conn.write_all(&buf).await
    }
}

/// An exact-size reservation against a write buffer. The caller must add
/// up to exactly `exact_size` bytes before the guard drops; a mismatch is
/// a programming error, not a recoverable condition, so it is checked
/// with a debug assertion rather than an `Err`.
pub struct BulkWrite<'a> {
    dest: &'a mut BytesMut,
    exact_size: usize,
    start_len: usize,
}

impl<'a> BulkWrite<'a> {
    fn new(dest: &'a mut BytesMut, exact_size: usize) -> Self {
        dest.reserve(exact_size);
        let start_len = dest.len();
        Self {
            dest,
            exact_size,
            start_len,
        }
    }

    pub fn add(&mut self, bytes: &[u8]) -> &mut Self {
        self.dest.put_slice(bytes);
        self
    }
}

impl<'a> Drop for BulkWrite<'a> {
    fn drop(&mut self) {
        let written = self.dest.len() - self.start_len;
        debug_assert_eq!(
            written, self.exact_size,
            "BulkWrite committed {} bytes, declared {}",
            written, self.exact_size
        );
    }
}
