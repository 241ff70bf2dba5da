//! Socket syscalls

use crate::syscall::SyscallContext;
use crate::Kernel;
use kernel_api::{Endpoint, Errno, SyscallRequest};
use serde_json::json;

pub fn socket(kernel: &mut Kernel, ctx: SyscallContext, _request: SyscallRequest) {
    let file = kernel.network.socket();
    match kernel.task_mut(ctx.pid()) {
        Some(task) => {
            let fd = task.files.add_file(file);
            ctx.succeed(json!(fd.as_u32()))
        }
        None => ctx.fail(Errno::ESRCH),
    }
}

pub fn bind(kernel: &mut Kernel, ctx: SyscallContext, request: SyscallRequest) {
    let SyscallRequest::Bind { fd, address, port } = request else {
        return ctx.fail(Errno::EINVAL);
    };
    let Some(file) = kernel.task(ctx.pid()).and_then(|task| task.files().get(fd)) else {
        return ctx.fail(Errno::EBADF);
    };
    match kernel.network.bind(&file, Endpoint::new(address, port)) {
        Ok(()) => ctx.ok(),
        Err(err) => {
            log::debug!("bind from {} failed: {}", ctx.pid(), err);
            ctx.fail(err.errno())
        }
    }
}

pub fn connect(kernel: &mut Kernel, ctx: SyscallContext, request: SyscallRequest) {
    let SyscallRequest::Connect { fd, address, port } = request else {
        return ctx.fail(Errno::EINVAL);
    };
    let Some(file) = kernel.task(ctx.pid()).and_then(|task| task.files().get(fd)) else {
        return ctx.fail(Errno::EBADF);
    };
    kernel.network.connect(
        &file,
        Endpoint::new(address, port),
        Box::new(move |result| match result {
            Ok(()) => ctx.ok(),
            Err(err) => ctx.fail(err.errno()),
        }),
    );
}
