//! File and directory syscalls

use crate::pipe::pipe;
use crate::syscall::SyscallContext;
use crate::Kernel;
use kernel_api::{bytes_to_value, Errno, FileStat, IoResult, SyscallRequest};
use serde_json::{json, Value};

/// Resolves `path` against `cwd` and folds `.` and `..` components
pub fn resolve_path(cwd: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", cwd, path)
    };
    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn stat_value(stat: &FileStat) -> Value {
    serde_json::to_value(stat).unwrap_or(Value::Null)
}

fn stat_reply(ctx: SyscallContext) -> Box<dyn FnOnce(IoResult<FileStat>)> {
    Box::new(move |result| match result {
        Ok(stat) => ctx.succeed(stat_value(&stat)),
        Err(err) => ctx.fail(err.errno),
    })
}

pub fn getcwd(kernel: &mut Kernel, ctx: SyscallContext, _request: SyscallRequest) {
    match kernel.task(ctx.pid()) {
        Some(task) => {
            let cwd = task.cwd().to_string();
            ctx.succeed(json!(cwd))
        }
        None => ctx.fail(Errno::ESRCH),
    }
}

pub fn chdir(kernel: &mut Kernel, ctx: SyscallContext, request: SyscallRequest) {
    let SyscallRequest::Chdir { path } = request else {
        return ctx.fail(Errno::EINVAL);
    };
    let Some(task) = kernel.task(ctx.pid()) else {
        return ctx.fail(Errno::ESRCH);
    };
    let path = resolve_path(task.cwd(), &path);

    match kernel.fs.stat(&path) {
        Ok(stat) if stat.is_dir() => match kernel.task_mut(ctx.pid()) {
            Some(task) => {
                task.cwd = path;
                ctx.ok()
            }
            None => ctx.fail(Errno::ESRCH),
        },
        Ok(_) => ctx.fail(Errno::ENOTDIR),
        Err(err) => ctx.fail(err.errno),
    }
}

pub fn open(kernel: &mut Kernel, ctx: SyscallContext, request: SyscallRequest) {
    let SyscallRequest::Open { path, flags, mode } = request else {
        return ctx.fail(Errno::EINVAL);
    };
    let Some(task) = kernel.task(ctx.pid()) else {
        return ctx.fail(Errno::ESRCH);
    };
    let path = resolve_path(task.cwd(), &path);

    let file = match kernel.open_path(&path, flags, mode) {
        Ok(file) => file,
        Err(err) => {
            log::debug!("open {} failed: {}", path, err.message);
            return ctx.fail(err.errno);
        }
    };
    match kernel.task_mut(ctx.pid()) {
        Some(task) => {
            let fd = task.files.add_file(file);
            ctx.succeed(json!(fd.as_u32()))
        }
        None => ctx.fail(Errno::ESRCH),
    }
}

pub fn close(kernel: &mut Kernel, ctx: SyscallContext, request: SyscallRequest) {
    let SyscallRequest::Close { fd } = request else {
        return ctx.fail(Errno::EINVAL);
    };
    let Some(task) = kernel.task_mut(ctx.pid()) else {
        return ctx.fail(Errno::ESRCH);
    };
    match task.files.close(fd) {
        Ok(()) => ctx.ok(),
        Err(err) => ctx.fail(err.errno()),
    }
}

pub fn read(kernel: &mut Kernel, ctx: SyscallContext, request: SyscallRequest) {
    let SyscallRequest::Read { fd, len, position } = request else {
        return ctx.fail(Errno::EINVAL);
    };
    let Some(task) = kernel.task(ctx.pid()) else {
        return ctx.fail(Errno::ESRCH);
    };
    let cancelled = ctx.cancel_check();
    task.files.read(
        fd,
        len,
        position,
        cancelled,
        Box::new(move |result| match result {
            Ok(data) => ctx.succeed(bytes_to_value(&data)),
            Err(err) => ctx.fail(err.errno),
        }),
    );
}

pub fn write(kernel: &mut Kernel, ctx: SyscallContext, request: SyscallRequest) {
    let SyscallRequest::Write { fd, data } = request else {
        return ctx.fail(Errno::EINVAL);
    };
    let Some(task) = kernel.task(ctx.pid()) else {
        return ctx.fail(Errno::ESRCH);
    };
    task.files.write(
        fd,
        &data,
        Box::new(move |result| match result {
            Ok(written) => ctx.succeed(json!(written)),
            Err(err) => ctx.fail(err.errno),
        }),
    );
}

pub fn fstat(kernel: &mut Kernel, ctx: SyscallContext, request: SyscallRequest) {
    let SyscallRequest::Fstat { fd } = request else {
        return ctx.fail(Errno::EINVAL);
    };
    let Some(task) = kernel.task(ctx.pid()) else {
        return ctx.fail(Errno::ESRCH);
    };
    task.files.stat(fd, stat_reply(ctx));
}

pub fn stat(kernel: &mut Kernel, ctx: SyscallContext, request: SyscallRequest) {
    let SyscallRequest::Stat { path } = request else {
        return ctx.fail(Errno::EINVAL);
    };
    let Some(task) = kernel.task(ctx.pid()) else {
        return ctx.fail(Errno::ESRCH);
    };
    let path = resolve_path(task.cwd(), &path);

    if let Some(name) = path.strip_prefix("/dev/") {
        match kernel.devices.open(name) {
            Ok(file) => file.stat(stat_reply(ctx)),
            Err(err) => ctx.fail(err.errno),
        }
        return;
    }
    match kernel.fs.stat(&path) {
        Ok(stat) => ctx.succeed(stat_value(&stat)),
        Err(err) => ctx.fail(err.errno),
    }
}

pub fn readdir(kernel: &mut Kernel, ctx: SyscallContext, request: SyscallRequest) {
    let SyscallRequest::Readdir { fd } = request else {
        return ctx.fail(Errno::EINVAL);
    };
    let Some(task) = kernel.task(ctx.pid()) else {
        return ctx.fail(Errno::ESRCH);
    };
    task.files.readdir(
        fd,
        Box::new(move |result| match result {
            Ok(names) => ctx.succeed(json!(names)),
            Err(err) => ctx.fail(err.errno),
        }),
    );
}

pub fn dup(kernel: &mut Kernel, ctx: SyscallContext, request: SyscallRequest) {
    let SyscallRequest::Dup { fd } = request else {
        return ctx.fail(Errno::EINVAL);
    };
    let Some(task) = kernel.task_mut(ctx.pid()) else {
        return ctx.fail(Errno::ESRCH);
    };
    match task.files.get(fd) {
        Some(file) => {
            let copy = task.files.add_file(file);
            ctx.succeed(json!(copy.as_u32()))
        }
        None => ctx.fail(Errno::EBADF),
    }
}

pub fn dup2(kernel: &mut Kernel, ctx: SyscallContext, request: SyscallRequest) {
    let SyscallRequest::Dup2 { fd, target } = request else {
        return ctx.fail(Errno::EINVAL);
    };
    let Some(task) = kernel.task_mut(ctx.pid()) else {
        return ctx.fail(Errno::ESRCH);
    };
    let Some(file) = task.files.get(fd) else {
        return ctx.fail(Errno::EBADF);
    };
    if fd != target {
        task.files.insert_at(target, file);
    }
    ctx.succeed(json!(target.as_u32()))
}

pub fn pipe2(kernel: &mut Kernel, ctx: SyscallContext, _request: SyscallRequest) {
    let Some(task) = kernel.task_mut(ctx.pid()) else {
        return ctx.fail(Errno::ESRCH);
    };
    let (reader, writer) = pipe();
    let read_fd = task.files.add_file(reader);
    let write_fd = task.files.add_file(writer);
    ctx.succeed_with(vec![json!(read_fd.as_u32()), json!(write_fd.as_u32())])
}
