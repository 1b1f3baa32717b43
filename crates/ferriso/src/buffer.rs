//! Bounded single-producer single-consumer ring buffer.
//!
//! The writer thread pushes image bytes in production order; the consumer
//! pulls them from the caller's thread. Both sides block instead of
//! spinning: the writer waits on `not_full`, the reader on `not_empty`.
//! Either side may close the buffer, optionally with an error code, and
//! the other side observes the close on its next operation.

use std::sync::{Condvar, Mutex};

use crate::types::BLOCK_SIZE;

/// Minimum buffer size in blocks. Smaller requests are raised to this.
pub const MIN_FIFO_BLOCKS: usize = 32;

/// Result of a [`RingBuffer::read`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRead {
    /// `buf` was filled completely.
    Full,
    /// Writer closed cleanly; only this many bytes were available.
    Eof(usize),
    /// Writer closed with this error code.
    Error(u32),
}

struct State {
    data: Vec<u8>,
    rpos: usize,
    wpos: usize,
    used: usize,
    writer_closed: bool,
    writer_error: u32,
    reader_closed: bool,
    reader_error: u32,
    times_full: u32,
    times_empty: u32,
}

pub struct RingBuffer {
    state: Mutex<State>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

impl RingBuffer {
    /// Create a buffer of `blocks` 2048-byte blocks, at least
    /// [`MIN_FIFO_BLOCKS`].
    pub fn new(blocks: usize) -> Self {
        let blocks = blocks.max(MIN_FIFO_BLOCKS);
        let capacity = blocks * BLOCK_SIZE;
        RingBuffer {
            state: Mutex::new(State {
                data: vec![0; capacity],
                rpos: 0,
                wpos: 0,
                used: 0,
                writer_closed: false,
                writer_error: 0,
                reader_closed: false,
                reader_error: 0,
                times_full: 0,
                times_empty: 0,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free(&self) -> usize {
        let st = self.state.lock().expect("ring buffer poisoned");
        self.capacity - st.used
    }

    /// Write all of `data`, blocking while the buffer is full.
    ///
    /// Returns the number of bytes written: `data.len()` on success, or a
    /// short count (possibly 0) if the reader closed the buffer. A short
    /// return means the production was canceled.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut written = 0;
        let mut st = self.state.lock().expect("ring buffer poisoned");
        while written < data.len() {
            if st.reader_closed {
                return written;
            }
            if st.used == self.capacity {
                st.times_full += 1;
                st = self.not_full.wait(st).expect("ring buffer poisoned");
                continue;
            }
            let wpos = st.wpos;
            let contiguous = (self.capacity - wpos).min(self.capacity - st.used);
            let n = contiguous.min(data.len() - written);
            st.data[wpos..wpos + n].copy_from_slice(&data[written..written + n]);
            st.wpos = (wpos + n) % self.capacity;
            st.used += n;
            written += n;
            self.not_empty.notify_one();
        }
        written
    }

    /// Read up to `buf.len()` bytes, blocking while the buffer is empty.
    ///
    /// Blocks until the full request is satisfied, the writer closes, or
    /// an error is flagged.
    pub fn read(&self, buf: &mut [u8]) -> BufferRead {
        let mut read = 0;
        let mut st = self.state.lock().expect("ring buffer poisoned");
        while read < buf.len() {
            if st.used == 0 {
                if st.writer_closed {
                    if st.writer_error != 0 {
                        return BufferRead::Error(st.writer_error);
                    }
                    return BufferRead::Eof(read);
                }
                st.times_empty += 1;
                st = self.not_empty.wait(st).expect("ring buffer poisoned");
                continue;
            }
            let rpos = st.rpos;
            let contiguous = (self.capacity - rpos).min(st.used);
            let n = contiguous.min(buf.len() - read);
            buf[read..read + n].copy_from_slice(&st.data[rpos..rpos + n]);
            st.rpos = (rpos + n) % self.capacity;
            st.used -= n;
            read += n;
            self.not_full.notify_one();
        }
        BufferRead::Full
    }

    /// Close from the writer side. `error` is 0 for a clean close.
    pub fn writer_close(&self, error: u32) {
        let mut st = self.state.lock().expect("ring buffer poisoned");
        st.writer_closed = true;
        st.writer_error = error;
        self.not_empty.notify_all();
    }

    /// Close from the reader side, waking a blocked writer. Used to cancel.
    pub fn reader_close(&self, error: u32) {
        let mut st = self.state.lock().expect("ring buffer poisoned");
        st.reader_closed = true;
        st.reader_error = error;
        self.not_full.notify_all();
    }

    pub fn reader_is_closed(&self) -> bool {
        self.state.lock().expect("ring buffer poisoned").reader_closed
    }

    pub fn writer_is_closed(&self) -> bool {
        self.state.lock().expect("ring buffer poisoned").writer_closed
    }

    /// How many times the writer found the buffer full.
    pub fn times_full(&self) -> u32 {
        self.state.lock().expect("ring buffer poisoned").times_full
    }

    /// How many times the reader found the buffer empty.
    pub fn times_empty(&self) -> u32 {
        self.state.lock().expect("ring buffer poisoned").times_empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn roundtrip_in_order() {
        let buf = Arc::new(RingBuffer::new(32));
        let writer = Arc::clone(&buf);
        let handle = thread::spawn(move || {
            for i in 0..256u32 {
                let block = vec![(i % 251) as u8; BLOCK_SIZE];
                assert_eq!(writer.write(&block), BLOCK_SIZE);
            }
            writer.writer_close(0);
        });

        let mut out = vec![0u8; BLOCK_SIZE];
        for i in 0..256u32 {
            assert_eq!(buf.read(&mut out), BufferRead::Full);
            assert!(out.iter().all(|&b| b == (i % 251) as u8));
        }
        assert_eq!(buf.read(&mut out), BufferRead::Eof(0));
        handle.join().unwrap();
    }

    #[test]
    fn reader_close_cancels_writer() {
        let buf = Arc::new(RingBuffer::new(32));
        let writer = Arc::clone(&buf);
        let handle = thread::spawn(move || {
            let block = vec![0xAAu8; BLOCK_SIZE];
            loop {
                let n = writer.write(&block);
                if n < BLOCK_SIZE {
                    // canceled
                    writer.writer_close(1);
                    return;
                }
            }
        });
        let mut out = vec![0u8; BLOCK_SIZE];
        let _ = buf.read(&mut out);
        buf.reader_close(1);
        handle.join().unwrap();
        assert!(buf.writer_is_closed());
    }

    #[test]
    fn writer_error_is_reported() {
        let buf = RingBuffer::new(32);
        buf.write(&[1, 2, 3]);
        buf.writer_close(0xDEAD);
        let mut out = [0u8; 8];
        // error takes precedence over the partial payload
        assert_eq!(buf.read(&mut out), BufferRead::Error(0xDEAD));
    }

    #[test]
    fn small_sizes_are_raised() {
        let buf = RingBuffer::new(1);
        assert_eq!(buf.capacity(), MIN_FIFO_BLOCKS * BLOCK_SIZE);
    }
}
