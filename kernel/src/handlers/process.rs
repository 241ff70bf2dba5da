//! Process control syscalls

use super::fs::resolve_path;
use crate::syscall::SyscallContext;
use crate::task::Waiter;
use crate::Kernel;
use core_types::{Fd, Pid, Priority};
use kernel_api::{Errno, KernelApi, StdioSpec, SyscallRequest, TaskSpec, WNOHANG};
use serde_json::json;

/// Largest signal number `kill` accepts
const MAX_SIGNAL: u32 = 64;

/// Descriptors a child inherits when `spawn` names none
const INHERITED_FDS: [Fd; 3] = [Fd::STDIN, Fd::STDOUT, Fd::STDERR];

pub fn exit(kernel: &mut Kernel, ctx: SyscallContext, request: SyscallRequest) {
    let SyscallRequest::Exit { code } = request else {
        return ctx.fail(Errno::EINVAL);
    };
    // Never completed: exiting cancels the context along with the task
    kernel.exit(ctx.pid(), code);
}

pub fn getpid(_kernel: &mut Kernel, ctx: SyscallContext, _request: SyscallRequest) {
    let pid = ctx.pid();
    ctx.succeed(json!(pid.as_u32()))
}

pub fn getppid(kernel: &mut Kernel, ctx: SyscallContext, _request: SyscallRequest) {
    match kernel.task(ctx.pid()) {
        Some(task) => {
            let ppid = task.ppid().map_or(0, Pid::as_u32);
            ctx.succeed(json!(ppid))
        }
        None => ctx.fail(Errno::ESRCH),
    }
}

pub fn spawn(kernel: &mut Kernel, ctx: SyscallContext, request: SyscallRequest) {
    let SyscallRequest::Spawn {
        cwd,
        path,
        args,
        env,
        files,
    } = request
    else {
        return ctx.fail(Errno::EINVAL);
    };
    let parent = ctx.pid();
    let Some(task) = kernel.task(parent) else {
        return ctx.fail(Errno::ESRCH);
    };

    let cwd = resolve_path(task.cwd(), &cwd);
    let exe_path = resolve_path(&cwd, &path);

    let mut stdio = Vec::new();
    if files.is_empty() {
        for fd in INHERITED_FDS {
            stdio.push(task.files().get(fd).map_or(StdioSpec::Null, StdioSpec::Handle));
        }
    } else {
        for fd in files {
            match task.files().get(fd) {
                Some(file) => stdio.push(StdioSpec::Handle(file)),
                None => return ctx.fail(Errno::EBADF),
            }
        }
    }

    let argv = if args.is_empty() {
        vec![exe_path.clone()]
    } else {
        args
    };
    let spec = TaskSpec::new(exe_path)
        .with_args(argv)
        .with_env(env)
        .with_cwd(cwd)
        .with_priority(kernel.config().default_priority)
        .with_files(stdio)
        .with_parent(parent);

    match kernel.spawn(spec) {
        Ok(child) => ctx.succeed(json!(child.as_u32())),
        Err(err) => {
            log::debug!("spawn from {} failed: {}", parent, err);
            ctx.fail(err.errno())
        }
    }
}

pub fn wait4(kernel: &mut Kernel, ctx: SyscallContext, request: SyscallRequest) {
    let SyscallRequest::Wait4 { pid, options } = request else {
        return ctx.fail(Errno::EINVAL);
    };
    let parent = ctx.pid();
    // Zero and negative pids wait for any child
    let target = match pid {
        p if p <= 0 => None,
        p => match u32::try_from(p).ok().and_then(Pid::from_raw) {
            Some(child) => Some(child),
            None => return ctx.fail(Errno::ECHILD),
        },
    };

    let Some(task) = kernel.task(parent) else {
        return ctx.fail(Errno::ESRCH);
    };
    let has_child = match target {
        Some(child) => task.children.contains(&child),
        None => !task.children.is_empty(),
    };
    if !has_child {
        return ctx.fail(Errno::ECHILD);
    }

    if let Some(child) = kernel.zombie_child(parent, target) {
        return match kernel.reap(parent, child) {
            Some(code) => ctx.succeed_with(vec![json!(child.as_u32()), json!(code)]),
            None => ctx.fail(Errno::ECHILD),
        };
    }
    if options & WNOHANG != 0 {
        return ctx.succeed_with(vec![json!(0), json!(0)]);
    }
    match kernel.task_mut(parent) {
        Some(task) => task.waiters.push(Waiter { target, ctx }),
        None => ctx.fail(Errno::ESRCH),
    }
}

pub fn kill(kernel: &mut Kernel, ctx: SyscallContext, request: SyscallRequest) {
    let SyscallRequest::Kill { pid, signal } = request else {
        return ctx.fail(Errno::EINVAL);
    };
    if signal > MAX_SIGNAL {
        return ctx.fail(Errno::EINVAL);
    }
    let Some(target) = Pid::from_raw(pid).filter(|target| kernel.is_alive(*target)) else {
        return ctx.fail(Errno::ESRCH);
    };
    if signal == 0 {
        return ctx.ok();
    }

    log::debug!("{} sends signal {} to {}", ctx.pid(), signal, target);
    ctx.ok();
    kernel.exit(target, 128 + signal as i32);
}

pub fn getpriority(kernel: &mut Kernel, ctx: SyscallContext, _request: SyscallRequest) {
    match kernel.task(ctx.pid()) {
        Some(task) => {
            let priority = task.priority().get();
            ctx.succeed(json!(priority))
        }
        None => ctx.fail(Errno::ESRCH),
    }
}

pub fn setpriority(kernel: &mut Kernel, ctx: SyscallContext, request: SyscallRequest) {
    let SyscallRequest::Setpriority { priority } = request else {
        return ctx.fail(Errno::EINVAL);
    };
    match kernel.set_priority(ctx.pid(), Priority::new(priority)) {
        Ok(old) => ctx.succeed(json!(old.get())),
        Err(err) => ctx.fail(err.errno()),
    }
}
