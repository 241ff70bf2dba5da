//! Anonymous pipes
//!
//! A pipe is a byte buffer with a read end and a write end, each a separate
//! file capability. Reads on an empty pipe stay pending until data arrives or
//! the write end is released, at which point they see end of file.

use core_types::KeepAlive;
use kernel_api::{CancelCheck, Errno, File, FileKind, FileStat, IoCallback};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Bytes a pipe buffers before writes are refused
pub const PIPE_CAPACITY: usize = 64 * 1024;

struct PendingRead {
    len: usize,
    cancelled: CancelCheck,
    cb: IoCallback<Vec<u8>>,
}

impl PendingRead {
    fn is_live(&self) -> bool {
        !(self.cancelled)()
    }
}

#[derive(Default)]
struct PipeState {
    buffer: VecDeque<u8>,
    pending_reads: VecDeque<PendingRead>,
    writer_closed: bool,
    reader_closed: bool,
}

impl PipeState {
    fn take(&mut self, len: usize) -> Vec<u8> {
        let n = len.min(self.buffer.len());
        self.buffer.drain(..n).collect()
    }

    /// Pairs live pending reads with available data (or EOF)
    ///
    /// Reads whose caller is gone are dropped without taking any bytes.
    fn ready_reads(&mut self) -> Vec<(IoCallback<Vec<u8>>, Vec<u8>)> {
        let mut ready = Vec::new();
        while !self.buffer.is_empty() || self.writer_closed {
            let Some(read) = self.pending_reads.pop_front() else {
                break;
            };
            if !read.is_live() {
                continue;
            }
            let chunk = self.take(read.len);
            ready.push((read.cb, chunk));
        }
        ready
    }
}

/// Runs callbacks after the state borrow is released
fn deliver(ready: Vec<(IoCallback<Vec<u8>>, Vec<u8>)>) {
    for (cb, chunk) in ready {
        cb(Ok(chunk));
    }
}

pub struct PipeReader {
    state: Rc<RefCell<PipeState>>,
    keep_alive: KeepAlive,
}

pub struct PipeWriter {
    state: Rc<RefCell<PipeState>>,
    keep_alive: KeepAlive,
}

/// Creates a connected pipe
pub fn pipe() -> (Rc<PipeReader>, Rc<PipeWriter>) {
    let state = Rc::new(RefCell::new(PipeState::default()));
    (
        Rc::new(PipeReader {
            state: Rc::clone(&state),
            keep_alive: KeepAlive::new(),
        }),
        Rc::new(PipeWriter {
            state,
            keep_alive: KeepAlive::new(),
        }),
    )
}

fn fifo_stat(cb: IoCallback<FileStat>, size: usize) {
    cb(Ok(FileStat::new(FileKind::Fifo, size as u64, 0o600)))
}

impl PipeReader {
    /// Reads waiting for data on behalf of live callers
    pub fn pending_reads(&self) -> usize {
        self.state
            .borrow()
            .pending_reads
            .iter()
            .filter(|read| read.is_live())
            .count()
    }
}

impl File for PipeReader {
    fn write(&self, _data: &[u8], cb: IoCallback<usize>) {
        cb(Err(Errno::EBADF.into()))
    }

    fn read(&self, len: usize, position: Option<u64>, cb: IoCallback<Vec<u8>>) {
        self.read_cancellable(len, position, Rc::new(|| false), cb)
    }

    fn read_cancellable(
        &self,
        len: usize,
        position: Option<u64>,
        cancelled: CancelCheck,
        cb: IoCallback<Vec<u8>>,
    ) {
        if position.is_some() {
            cb(Err(Errno::ESPIPE.into()));
            return;
        }
        if len == 0 {
            cb(Ok(Vec::new()));
            return;
        }
        let ready = {
            let mut state = self.state.borrow_mut();
            state.pending_reads.retain(PendingRead::is_live);
            state.pending_reads.push_back(PendingRead { len, cancelled, cb });
            state.ready_reads()
        };
        deliver(ready);
    }

    fn stat(&self, cb: IoCallback<FileStat>) {
        let size = self.state.borrow().buffer.len();
        fifo_stat(cb, size)
    }

    fn keep_alive(&self) -> &KeepAlive {
        &self.keep_alive
    }

    fn close(&self) {
        let mut state = self.state.borrow_mut();
        state.reader_closed = true;
        state.buffer.clear();
        state.pending_reads.clear();
    }
}

impl File for PipeWriter {
    fn write(&self, data: &[u8], cb: IoCallback<usize>) {
        let result = {
            let mut state = self.state.borrow_mut();
            if state.reader_closed {
                Err(Errno::EPIPE)
            } else if state.buffer.len() + data.len() > PIPE_CAPACITY {
                Err(Errno::EAGAIN)
            } else {
                state.buffer.extend(data.iter().copied());
                Ok(state.ready_reads())
            }
        };
        match result {
            Ok(ready) => {
                deliver(ready);
                cb(Ok(data.len()))
            }
            Err(errno) => cb(Err(errno.into())),
        }
    }

    fn read(&self, _len: usize, _position: Option<u64>, cb: IoCallback<Vec<u8>>) {
        cb(Err(Errno::EBADF.into()))
    }

    fn stat(&self, cb: IoCallback<FileStat>) {
        let size = self.state.borrow().buffer.len();
        fifo_stat(cb, size)
    }

    fn keep_alive(&self) -> &KeepAlive {
        &self.keep_alive
    }

    fn close(&self) {
        let ready = {
            let mut state = self.state.borrow_mut();
            state.writer_closed = true;
            state.ready_reads()
        };
        deliver(ready);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    type Reads = Rc<RefCell<Vec<Vec<u8>>>>;

    fn reader_cb(reads: &Reads) -> IoCallback<Vec<u8>> {
        let sink = Rc::clone(reads);
        Box::new(move |r| sink.borrow_mut().push(r.unwrap()))
    }

    #[test]
    fn test_read_after_write() {
        let (reader, writer) = pipe();
        let reads: Reads = Rc::default();

        writer.write(b"hello", Box::new(|r| assert_eq!(r.unwrap(), 5)));
        reader.read(3, None, reader_cb(&reads));
        reader.read(10, None, reader_cb(&reads));

        assert_eq!(*reads.borrow(), vec![b"hel".to_vec(), b"lo".to_vec()]);
    }

    #[test]
    fn test_read_waits_for_data() {
        let (reader, writer) = pipe();
        let reads: Reads = Rc::default();

        reader.read(8, None, reader_cb(&reads));
        assert!(reads.borrow().is_empty());
        assert_eq!(reader.pending_reads(), 1);

        writer.write(b"data", Box::new(|_| {}));
        assert_eq!(*reads.borrow(), vec![b"data".to_vec()]);
        assert_eq!(reader.pending_reads(), 0);
    }

    #[test]
    fn test_writer_close_signals_eof() {
        let (reader, writer) = pipe();
        let reads: Reads = Rc::default();

        reader.read(8, None, reader_cb(&reads));
        writer.close();
        assert_eq!(*reads.borrow(), vec![Vec::<u8>::new()]);

        reader.read(8, None, reader_cb(&reads));
        assert_eq!(reads.borrow().len(), 2);
    }

    #[test]
    fn test_buffered_data_survives_writer_close() {
        let (reader, writer) = pipe();
        let reads: Reads = Rc::default();

        writer.write(b"tail", Box::new(|_| {}));
        writer.close();
        reader.read(8, None, reader_cb(&reads));
        reader.read(8, None, reader_cb(&reads));
        assert_eq!(*reads.borrow(), vec![b"tail".to_vec(), Vec::new()]);
    }

    #[test]
    fn test_write_after_reader_close_is_epipe() {
        let (reader, writer) = pipe();
        reader.close();
        writer.write(
            b"x",
            Box::new(|r| assert_eq!(r.unwrap_err().errno, Errno::EPIPE)),
        );
    }

    #[test]
    fn test_wrong_direction_is_ebadf() {
        let (reader, writer) = pipe();
        reader.write(b"x", Box::new(|r| assert_eq!(r.unwrap_err().errno, Errno::EBADF)));
        writer.read(1, None, Box::new(|r| assert_eq!(r.unwrap_err().errno, Errno::EBADF)));
        reader.read(1, Some(0), Box::new(|r| assert_eq!(r.unwrap_err().errno, Errno::ESPIPE)));
    }

    #[test]
    fn test_cancelled_read_leaves_data_for_live_reader() {
        let (reader, writer) = pipe();
        let reads: Reads = Rc::default();
        let gone = Rc::new(Cell::new(false));
        let flag = Rc::clone(&gone);

        reader.read_cancellable(8, None, Rc::new(move || flag.get()), reader_cb(&reads));
        assert_eq!(reader.pending_reads(), 1);
        gone.set(true);
        assert_eq!(reader.pending_reads(), 0);

        writer.write(b"x", Box::new(|r| assert_eq!(r.unwrap(), 1)));
        assert!(reads.borrow().is_empty());
        reader.read(8, None, reader_cb(&reads));
        assert_eq!(*reads.borrow(), vec![b"x".to_vec()]);
    }

    #[test]
    fn test_zero_length_read_completes_immediately() {
        let (reader, writer) = pipe();
        let reads: Reads = Rc::default();

        reader.read(0, None, reader_cb(&reads));
        assert_eq!(*reads.borrow(), vec![Vec::<u8>::new()]);
        assert_eq!(reader.pending_reads(), 0);

        writer.write(b"ab", Box::new(|_| {}));
        reader.read(2, None, reader_cb(&reads));
        assert_eq!(reads.borrow()[1], b"ab".to_vec());
    }

    #[test]
    fn test_overfull_write_is_refused() {
        let (_reader, writer) = pipe();
        let big = vec![0u8; PIPE_CAPACITY + 1];
        writer.write(&big, Box::new(|r| assert_eq!(r.unwrap_err().errno, Errno::EAGAIN)));
    }
}
