//! Per-task file descriptor table
//!
//! Maps small integers to file capabilities. The table holds one keep-alive
//! reference per open descriptor. Closing a descriptor drops that reference;
//! the capability is released only once its count has drained, and until
//! then the descriptor number stays reserved.

use core_types::Fd;
use kernel_api::{
    CancelCheck, CapabilityError, Errno, FileHandle, FileStat, IoCallback, KernelError,
};
use std::collections::BTreeMap;
use std::rc::Rc;

enum Slot {
    Open(FileHandle),
    /// Closed by the owner but still referenced elsewhere
    Closing(FileHandle),
}

#[derive(Default)]
pub struct FdTable {
    slots: BTreeMap<Fd, Slot>,
    /// Closing capabilities displaced by `insert_at`
    displaced: Vec<FileHandle>,
}

impl FdTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lowest_free(&self) -> Fd {
        let mut candidate = 0u32;
        for fd in self.slots.keys() {
            if fd.as_u32() != candidate {
                break;
            }
            candidate += 1;
        }
        Fd::new(candidate)
    }

    /// Maps `file` at the smallest free descriptor and takes a reference
    pub fn add_file(&mut self, file: FileHandle) -> Fd {
        let fd = self.lowest_free();
        file.add_ref();
        self.slots.insert(fd, Slot::Open(file));
        fd
    }

    /// Maps `file` at `fd`, closing whatever was open there
    pub fn insert_at(&mut self, fd: Fd, file: FileHandle) {
        match self.slots.remove(&fd) {
            Some(Slot::Open(previous)) => {
                if !release(&previous) {
                    self.displaced.push(previous);
                }
            }
            Some(Slot::Closing(previous)) => self.displaced.push(previous),
            None => {}
        }
        file.add_ref();
        self.slots.insert(fd, Slot::Open(file));
    }

    pub fn get(&self, fd: Fd) -> Option<FileHandle> {
        match self.slots.get(&fd) {
            Some(Slot::Open(file)) => Some(Rc::clone(file)),
            _ => None,
        }
    }

    pub fn is_open(&self, fd: Fd) -> bool {
        matches!(self.slots.get(&fd), Some(Slot::Open(_)))
    }

    /// True while `fd` is closed but its number is still reserved
    pub fn is_closing(&self, fd: Fd) -> bool {
        matches!(self.slots.get(&fd), Some(Slot::Closing(_)))
    }

    /// Open descriptors, ascending
    pub fn open_fds(&self) -> Vec<Fd> {
        self.slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Open(_)))
            .map(|(fd, _)| *fd)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Closes `fd`
    pub fn close(&mut self, fd: Fd) -> Result<(), KernelError> {
        let file = match self.slots.remove(&fd) {
            Some(Slot::Open(file)) => file,
            Some(closing @ Slot::Closing(_)) => {
                self.slots.insert(fd, closing);
                return Err(KernelError::BadDescriptor(fd));
            }
            None => return Err(KernelError::BadDescriptor(fd)),
        };
        if !release(&file) {
            self.slots.insert(fd, Slot::Closing(file));
        }
        Ok(())
    }

    /// Closes every open descriptor
    pub fn close_all(&mut self) {
        for fd in self.open_fds() {
            // Every fd in `open_fds` is open, so close cannot fail here
            let _ = self.close(fd);
        }
    }

    /// Releases closing entries whose count has drained; returns how many
    pub fn collect(&mut self) -> usize {
        let drained: Vec<Fd> = self
            .slots
            .iter()
            .filter_map(|(fd, slot)| match slot {
                Slot::Closing(file) if file.keep_alive().is_drained() => Some(*fd),
                _ => None,
            })
            .collect();
        for fd in &drained {
            if let Some(Slot::Closing(file)) = self.slots.remove(fd) {
                close_once(&file);
            }
        }

        let before = self.displaced.len();
        self.displaced.retain(|file| {
            if file.keep_alive().is_drained() {
                close_once(file);
                false
            } else {
                true
            }
        });
        drained.len() + (before - self.displaced.len())
    }

    /// Reads from `fd`; a parked read is abandoned once `cancelled` holds
    pub fn read(
        &self,
        fd: Fd,
        len: usize,
        position: Option<u64>,
        cancelled: CancelCheck,
        cb: IoCallback<Vec<u8>>,
    ) {
        match self.get(fd) {
            Some(file) => file.read_cancellable(len, position, cancelled, cb),
            None => cb(Err(bad_descriptor(fd))),
        }
    }

    pub fn write(&self, fd: Fd, data: &[u8], cb: IoCallback<usize>) {
        match self.get(fd) {
            Some(file) => file.write(data, cb),
            None => cb(Err(bad_descriptor(fd))),
        }
    }

    pub fn stat(&self, fd: Fd, cb: IoCallback<FileStat>) {
        match self.get(fd) {
            Some(file) => file.stat(cb),
            None => cb(Err(bad_descriptor(fd))),
        }
    }

    pub fn readdir(&self, fd: Fd, cb: IoCallback<Vec<String>>) {
        match self.get(fd) {
            Some(file) => file.readdir(cb),
            None => cb(Err(bad_descriptor(fd))),
        }
    }
}

/// Drops the table's reference; closes and returns true if it was the last
fn release(file: &FileHandle) -> bool {
    file.unref();
    if file.keep_alive().is_drained() {
        close_once(file);
        true
    } else {
        false
    }
}

/// Calls `File::close` unless some other holder already did
fn close_once(file: &FileHandle) {
    if file.keep_alive().mark_closed() {
        file.close();
    }
}

fn bad_descriptor(fd: Fd) -> CapabilityError {
    CapabilityError::new(Errno::EBADF, format!("{} is not open", fd))
}
