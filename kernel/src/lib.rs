//! # Kernel
//!
//! A process kernel for isolated, message-passing workers.
//!
//! ## Philosophy
//!
//! - **One arbiter**: workers never touch shared state. They post syscall
//!   requests; the kernel performs the privileged work and posts completions.
//! - **Continuations, not threads**: a handler that waits on I/O keeps its
//!   [`SyscallContext`] and completes it later. Completions re-enter the
//!   kernel through the same inbox as requests, so all mutation happens in
//!   [`Kernel::step`].
//! - **Deterministic**: same programs + same inputs => same schedule.
//!
//! ## Architecture
//!
//! - [`syscall`]: envelope validation and the continuation type
//! - [`dispatcher`] / [`handlers`]: name -> handler table
//! - [`fd_table`]: per-task descriptor tables with keep-alive accounting
//! - [`task`]: the task entity
//! - [`scheduler`]: priority run queue
//! - [`pipe`] / [`stdio`]: kernel-provided file capabilities

pub mod audit;
pub mod config;
pub mod dispatcher;
pub mod fd_table;
pub mod handlers;
pub mod pipe;
pub mod scheduler;
pub mod stdio;
pub mod syscall;
pub mod task;
pub mod test_utils;

pub use audit::{AuditRing, SyscallAuditLog, SyscallEvent, DEFAULT_AUDIT_CAPACITY};
pub use config::{ConfigError, KernelConfig, MalformedPolicy};
pub use dispatcher::{Dispatcher, SyscallHandler};
pub use fd_table::FdTable;
pub use scheduler::{ScheduleEvent, Scheduler};
pub use syscall::{parse_envelope, CancelToken, Envelope, MalformedEnvelope, Syscall, SyscallContext};
pub use task::{Task, TaskState};

use core_types::{Fd, Pid, Priority};
use ipc::{Inbox, InboxEvent, KernelPort, SyscallMessage};
use kernel_api::{
    ConnectCallback, DeviceHandle, DeviceId, Endpoint, Errno, FileHandle, FileSystem, IoResult,
    KernelApi, KernelError, KernelEvent, OpenFlags, ProgramLoader, StdioSpec, SyscallRequest,
    TaskSpec,
};
use serde_json::{json, Value};
use services_device_manager::{AllowAllDevices, DetachMode, DeviceManager, NullDeviceFactory, NullFile};
use services_network::{AllowAllPolicy, LoopbackStack, NetworkService};
use std::collections::BTreeMap;
use std::rc::Rc;
use stdio::{EventQueue, OutputCapture};
use task::Admission;

/// The kernel
///
/// Owns every task, the run queue and the inbox. Hosts drive it with
/// [`KernelApi::step`] / [`KernelApi::run_until_idle`] and observe it through
/// [`KernelApi::drain_events`].
pub struct Kernel {
    config: KernelConfig,
    pub(crate) fs: Box<dyn FileSystem>,
    loader: Box<dyn ProgramLoader>,
    pub(crate) network: NetworkService,
    pub(crate) devices: DeviceManager,
    tasks: BTreeMap<Pid, Task>,
    scheduler: Scheduler,
    dispatcher: Dispatcher,
    port: KernelPort,
    inbox: Inbox,
    events: EventQueue,
    next_pid: Pid,
    /// Audit log for syscall traffic (test-only)
    audit: SyscallAuditLog,
}

impl Kernel {
    /// Creates a kernel backed by `fs` that loads programs with `loader`
    ///
    /// Networking defaults to an allow-all policy over a loopback stack, and
    /// the `null` device type is registered.
    pub fn new(fs: Box<dyn FileSystem>, loader: Box<dyn ProgramLoader>) -> Self {
        let (port, inbox) = ipc::inbox();
        let mut devices = DeviceManager::new(Box::new(AllowAllDevices));
        devices.register_factory(Box::new(NullDeviceFactory));

        Self {
            config: KernelConfig::default(),
            fs,
            loader,
            network: NetworkService::new(Box::new(AllowAllPolicy), Rc::new(LoopbackStack::new())),
            devices,
            tasks: BTreeMap::new(),
            scheduler: Scheduler::new(),
            dispatcher: handlers::default_dispatcher(),
            port,
            inbox,
            events: EventQueue::default(),
            next_pid: Pid::first(),
            audit: SyscallAuditLog::new(),
        }
    }

    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.audit.set_capacity(config.audit_capacity);
        self.scheduler.set_audit_capacity(config.audit_capacity);
        self.config = config;
        self
    }

    pub fn with_network(mut self, network: NetworkService) -> Self {
        self.network = network;
        self
    }

    pub fn with_devices(mut self, devices: DeviceManager) -> Self {
        self.devices = devices;
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn task(&self, pid: Pid) -> Option<&Task> {
        self.tasks.get(&pid)
    }

    pub(crate) fn task_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.tasks.get_mut(&pid)
    }

    /// Pids of every task still in the table, zombies included
    pub fn pids(&self) -> Vec<Pid> {
        self.tasks.keys().copied().collect()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn network(&self) -> &NetworkService {
        &self.network
    }

    pub fn devices(&self) -> &DeviceManager {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut DeviceManager {
        &mut self.devices
    }

    /// Sending half of the inbox, for hosts that inject messages directly
    pub fn port(&self) -> &KernelPort {
        &self.port
    }

    /// Returns the bounded syscall audit log
    pub fn audit_log(&self) -> &SyscallAuditLog {
        &self.audit
    }

    /// Clears the syscall and scheduler audit logs
    pub fn clear_audit_logs(&mut self) {
        self.audit.clear();
        self.scheduler.clear_audit_log();
    }

    /// Detaches a hotplugged device
    pub fn detach_device(&mut self, id: DeviceId, mode: DetachMode) -> Result<(), KernelError> {
        self.devices.detach(id, mode).map_err(KernelError::from)
    }

    /// Opens `path`, routing `/dev/<name>` to the device manager
    pub(crate) fn open_path(&self, path: &str, flags: OpenFlags, mode: u32) -> IoResult<FileHandle> {
        match path.strip_prefix("/dev/") {
            Some(name) => self.devices.open(name),
            None => self.fs.open(path, flags, mode),
        }
    }

    fn open_stdio(&self, pid: Pid, index: usize, spec: &StdioSpec) -> IoResult<FileHandle> {
        match spec {
            StdioSpec::Null => Ok(NullFile::handle()),
            StdioSpec::Path(path) => {
                let flags = if index == 0 {
                    OpenFlags::read_only()
                } else {
                    OpenFlags::write_truncate()
                };
                self.open_path(path, flags, 0o666)
            }
            StdioSpec::Capture(stream) => Ok(Rc::new(OutputCapture::new(
                pid,
                *stream,
                Rc::clone(&self.events),
            ))),
            StdioSpec::Handle(file) => Ok(Rc::clone(file)),
        }
    }

    pub(crate) fn make_runnable(&mut self, pid: Pid) {
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.mark_runnable();
            self.scheduler.enqueue(pid);
        }
    }

    /// Validates a raw worker message and dispatches it
    fn handle_request(&mut self, pid: Pid, raw: Value) {
        let Some(task) = self.tasks.get_mut(&pid).filter(|task| !task.is_exited()) else {
            log::debug!("dropping request from {}: task is not running", pid);
            self.audit.record(SyscallEvent::Dropped {
                pid,
                reason: "task is not running".to_string(),
            });
            return;
        };

        let envelope = match parse_envelope(&raw) {
            Ok(envelope) => envelope,
            Err(malformed) => {
                log::debug!("malformed envelope from {}: {}", pid, malformed.reason);
                let reportable = match (self.config.malformed_envelopes, malformed.id) {
                    (MalformedPolicy::Report, Some(id))
                        if task.admit(id, usize::MAX) != Admission::Duplicate =>
                    {
                        Some(id)
                    }
                    _ => None,
                };
                match reportable {
                    Some(id) => {
                        self.audit.record(SyscallEvent::Rejected {
                            pid,
                            id,
                            name: String::new(),
                            reason: malformed.reason.to_string(),
                        });
                        SyscallContext::new(pid, id, task.port().clone(), task.cancel_token())
                            .fail(Errno::EPROTO);
                    }
                    None => self.audit.record(SyscallEvent::Dropped {
                        pid,
                        reason: malformed.reason.to_string(),
                    }),
                }
                return;
            }
        };

        let id = envelope.id;
        match task.admit(id, self.config.max_pending_syscalls) {
            Admission::Accepted => {}
            Admission::Duplicate => {
                log::debug!("dropping duplicate {} from {}", id, pid);
                self.audit.record(SyscallEvent::Dropped {
                    pid,
                    reason: format!("duplicate {}", id),
                });
                return;
            }
            Admission::OverLimit => {
                log::debug!("{} has too many pending syscalls", pid);
                self.audit.record(SyscallEvent::Rejected {
                    pid,
                    id,
                    name: envelope.name.clone(),
                    reason: "too many pending syscalls".to_string(),
                });
                Syscall::from_envelope(task, envelope).ctx.fail(Errno::EAGAIN);
                return;
            }
        }

        let syscall = Syscall::from_envelope(task, envelope);
        self.audit.record(SyscallEvent::Invoked {
            pid,
            id,
            name: syscall.name.clone(),
        });
        self.do_syscall(syscall);
    }

    /// Decodes a syscall and runs its handler
    ///
    /// Returns as soon as the handler returns; the handler may complete the
    /// context later.
    pub fn do_syscall(&mut self, syscall: Syscall) {
        let (ctx, name, args) = (syscall.ctx, syscall.name, syscall.args);
        if self.config.debug {
            log::info!("{} {}({:?})", ctx.pid(), name, args);
        } else {
            log::trace!("{} {}({:?})", ctx.pid(), name, args);
        }

        let Some(handler) = self.dispatcher.lookup(&name) else {
            log::debug!("unknown syscall {} from {}", name, ctx.pid());
            self.audit.record(SyscallEvent::Rejected {
                pid: ctx.pid(),
                id: ctx.id(),
                name,
                reason: "unknown syscall".to_string(),
            });
            return ctx.fail(Errno::ENOSYS);
        };

        match SyscallRequest::decode(&name, &args) {
            Ok(request) => handler(self, ctx, request),
            Err(err) => {
                log::debug!("bad arguments to {} from {}: {}", name, ctx.pid(), err);
                self.audit.record(SyscallEvent::Rejected {
                    pid: ctx.pid(),
                    id: ctx.id(),
                    name,
                    reason: err.to_string(),
                });
                ctx.fail(err.errno())
            }
        }
    }

    fn route_completion(&mut self, pid: Pid, message: SyscallMessage) {
        let id = message.id;
        let routed = self
            .tasks
            .get_mut(&pid)
            .map_or(false, |task| task.schedule(message));
        if routed {
            self.audit.record(SyscallEvent::Completed { pid, id });
            self.make_runnable(pid);
        } else {
            log::debug!("discarding completion of {} for {}", id, pid);
            self.audit.record(SyscallEvent::Discarded { pid, id });
        }
    }

    /// First exited child of `parent` matching `target` (`None` = any)
    pub(crate) fn zombie_child(&self, parent: Pid, target: Option<Pid>) -> Option<Pid> {
        let task = self.tasks.get(&parent)?;
        task.children
            .iter()
            .copied()
            .filter(|child| target.map_or(true, |target| target == *child))
            .find(|child| self.tasks.get(child).map_or(false, Task::is_exited))
    }

    /// Removes an exited child from the table; returns its exit code
    pub(crate) fn reap(&mut self, parent: Pid, child: Pid) -> Option<i32> {
        if let Some(task) = self.tasks.get_mut(&parent) {
            task.children.remove(&child);
        }
        let task = self.tasks.remove(&child)?;
        log::debug!("{} reaped {}", parent, child);
        task.exit_code()
    }

    /// Completes the `wait4` calls of `parent` that can now be answered
    fn wake_waiters(&mut self, parent: Pid) {
        loop {
            let Some(task) = self.tasks.get(&parent) else {
                return;
            };
            let matched = task.waiters.iter().enumerate().find_map(|(index, waiter)| {
                self.zombie_child(parent, waiter.target)
                    .map(|child| (index, child))
            });
            let Some((index, child)) = matched else {
                break;
            };
            let Some(task) = self.tasks.get_mut(&parent) else {
                return;
            };
            let waiter = task.waiters.remove(index);
            match self.reap(parent, child) {
                Some(code) => waiter.ctx.succeed_with(vec![json!(child.as_u32()), json!(code)]),
                None => waiter.ctx.fail(Errno::ECHILD),
            }
        }

        // Waiters whose child was reaped by someone else can never succeed
        let Some(task) = self.tasks.get_mut(&parent) else {
            return;
        };
        let children = task.children.clone();
        let (hopeless, waiting): (Vec<_>, Vec<_>) =
            task.waiters.drain(..).partition(|waiter| match waiter.target {
                Some(target) => !children.contains(&target),
                None => children.is_empty(),
            });
        task.waiters = waiting;
        for waiter in hopeless {
            waiter.ctx.fail(Errno::ECHILD);
        }
    }

    fn has_live_parent(&self, task: &Task) -> bool {
        task.ppid().map_or(false, |parent| self.is_alive(parent))
    }
}

impl KernelApi for Kernel {
    fn spawn(&mut self, spec: TaskSpec) -> Result<Pid, KernelError> {
        let pid = self.next_pid;
        let mut files = FdTable::new();
        for (index, stdio) in spec.files.iter().enumerate() {
            match self.open_stdio(pid, index, stdio) {
                Ok(file) => files.insert_at(Fd::new(index as u32), file),
                Err(err) => {
                    files.close_all();
                    return Err(KernelError::SpawnFailed(format!(
                        "{}: fd {}: {}",
                        spec.exe_path, index, err
                    )));
                }
            }
        }

        let worker = match self.loader.load(&spec, self.port.worker_port(pid)) {
            Ok(worker) => worker,
            Err(err) => {
                files.close_all();
                return Err(err);
            }
        };
        self.next_pid = pid.next();

        let mut task = Task::new(pid, &spec, files, worker, self.port.clone());
        match spec.parent.and_then(|parent| self.tasks.get_mut(&parent)) {
            Some(parent) if !parent.is_exited() => {
                parent.children.insert(pid);
            }
            _ => task.orphan(),
        }
        self.tasks.insert(pid, task);
        self.scheduler.register(pid, spec.priority);
        self.make_runnable(pid);
        log::debug!("spawned {} ({})", pid, spec.exe_path);
        Ok(pid)
    }

    fn exit(&mut self, pid: Pid, code: i32) {
        let Some(task) = self.tasks.get_mut(&pid) else {
            log::debug!("exit({}) for unknown task {}", code, pid);
            return;
        };
        if !task.mark_exited(code) {
            log::debug!("{} already exited; ignoring exit({})", pid, code);
            self.scheduler
                .record(ScheduleEvent::ExitIgnored { pid, code });
            return;
        }
        let parent = task.ppid();
        let children = std::mem::take(&mut task.children);

        self.scheduler.remove(pid, code);
        log::debug!("{} exited with {}", pid, code);
        self.events
            .borrow_mut()
            .push_back(KernelEvent::Exited { pid, code });

        for child in children {
            let zombie = match self.tasks.get_mut(&child) {
                Some(task) => {
                    task.orphan();
                    task.is_exited()
                }
                None => false,
            };
            if zombie {
                self.tasks.remove(&child);
            }
        }
        if let Some(parent) = parent {
            self.wake_waiters(parent);
        }
    }

    fn set_priority(&mut self, pid: Pid, priority: Priority) -> Result<Priority, KernelError> {
        let task = self
            .tasks
            .get_mut(&pid)
            .filter(|task| !task.is_exited())
            .ok_or(KernelError::NoSuchTask(pid))?;
        let old = std::mem::replace(&mut task.priority, priority);
        self.scheduler.set_priority(pid, priority);
        Ok(old)
    }

    fn step(&mut self) -> bool {
        let mut progressed = false;

        for event in self.inbox.drain() {
            progressed = true;
            match event {
                InboxEvent::Request { pid, raw } => self.handle_request(pid, raw),
                InboxEvent::Completion { pid, message } => self.route_completion(pid, message),
                InboxEvent::Output { pid, stream, chunk } => {
                    if !self.is_alive(pid) {
                        log::debug!("{} is not running; dropping its output", pid);
                        continue;
                    }
                    self.events
                        .borrow_mut()
                        .push_back(KernelEvent::Output { pid, stream, chunk })
                }
            }
        }

        for task in self.tasks.values_mut() {
            task.files.collect();
        }

        for _ in 0..self.config.n_cpus {
            let Some(pid) = self.scheduler.dequeue_next() else {
                break;
            };
            if let Some(task) = self.tasks.get_mut(&pid) {
                task.run();
                progressed = true;
            }
        }

        self.scheduler.advance_step();
        progressed
    }

    fn run_until_idle(&mut self) -> usize {
        let mut steps = 0;
        while steps < self.config.max_iterations {
            if !self.step() {
                return steps;
            }
            steps += 1;
        }
        log::warn!("run_until_idle stopped after {} steps", steps);
        steps
    }

    fn drain_events(&mut self) -> Vec<KernelEvent> {
        let events: Vec<KernelEvent> = self.events.borrow_mut().drain(..).collect();
        for event in &events {
            if let KernelEvent::Exited { pid, .. } = event {
                let unclaimed = self
                    .tasks
                    .get(pid)
                    .map_or(false, |task| task.is_exited() && !self.has_live_parent(task));
                if unclaimed {
                    self.tasks.remove(pid);
                }
            }
        }
        events
    }

    fn is_alive(&self, pid: Pid) -> bool {
        self.tasks.get(&pid).map_or(false, |task| !task.is_exited())
    }

    fn connect(&mut self, file: &FileHandle, endpoint: Endpoint, cb: ConnectCallback) {
        self.network.connect(file, endpoint, cb)
    }

    fn unbind(&mut self, file: &FileHandle, endpoint: &Endpoint) -> Result<(), KernelError> {
        self.network.unbind(file, endpoint).map_err(KernelError::from)
    }

    fn hotplug(&mut self, kind: &str, args: &Value) -> Result<DeviceHandle, KernelError> {
        self.devices.hotplug(kind, args).map_err(KernelError::from)
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("tasks", &self.tasks.len())
            .field("runnable", &self.scheduler.runnable_count())
            .field("next_pid", &self.next_pid)
            .finish()
    }
}
