//! Captured output streams

use core_types::{KeepAlive, OutputStream, Pid};
use kernel_api::{Errno, File, FileKind, FileStat, IoCallback, KernelEvent};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Events waiting for the host, in emission order
pub(crate) type EventQueue = Rc<RefCell<VecDeque<KernelEvent>>>;

/// Write-only file whose writes become output events
///
/// Writes are queued synchronously, so every chunk a task wrote before it
/// exited precedes its exit event.
pub struct OutputCapture {
    pid: Pid,
    stream: OutputStream,
    events: EventQueue,
    keep_alive: KeepAlive,
}

impl OutputCapture {
    pub(crate) fn new(pid: Pid, stream: OutputStream, events: EventQueue) -> Self {
        Self {
            pid,
            stream,
            events,
            keep_alive: KeepAlive::new(),
        }
    }
}

impl File for OutputCapture {
    fn write(&self, data: &[u8], cb: IoCallback<usize>) {
        if !data.is_empty() {
            self.events.borrow_mut().push_back(KernelEvent::Output {
                pid: self.pid,
                stream: self.stream,
                chunk: data.to_vec(),
            });
        }
        cb(Ok(data.len()))
    }

    fn read(&self, _len: usize, _position: Option<u64>, cb: IoCallback<Vec<u8>>) {
        cb(Err(Errno::EBADF.into()))
    }

    fn stat(&self, cb: IoCallback<FileStat>) {
        cb(Ok(FileStat::new(FileKind::CharDevice, 0, 0o200)))
    }

    fn keep_alive(&self) -> &KeepAlive {
        &self.keep_alive
    }
}
