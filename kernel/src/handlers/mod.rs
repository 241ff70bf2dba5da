//! Syscall handlers
//!
//! Each handler receives the kernel, the caller's continuation and the
//! decoded request. Handlers complete the continuation themselves; those
//! that wait on a capability pass it into the capability's callback.

pub mod fs;
pub mod net;
pub mod process;

use crate::dispatcher::Dispatcher;

/// Builds the table with every syscall the kernel implements
pub fn default_dispatcher() -> Dispatcher {
    let mut dispatcher = Dispatcher::new();

    dispatcher.register("exit", process::exit);
    dispatcher.register("getpid", process::getpid);
    dispatcher.register("getppid", process::getppid);
    dispatcher.register("spawn", process::spawn);
    dispatcher.register("wait4", process::wait4);
    dispatcher.register("kill", process::kill);
    dispatcher.register("getpriority", process::getpriority);
    dispatcher.register("setpriority", process::setpriority);

    dispatcher.register("getcwd", fs::getcwd);
    dispatcher.register("chdir", fs::chdir);
    dispatcher.register("open", fs::open);
    dispatcher.register("close", fs::close);
    dispatcher.register("read", fs::read);
    dispatcher.register("write", fs::write);
    dispatcher.register("fstat", fs::fstat);
    dispatcher.register("stat", fs::stat);
    dispatcher.register("readdir", fs::readdir);
    dispatcher.register("dup", fs::dup);
    dispatcher.register("dup2", fs::dup2);
    dispatcher.register("pipe2", fs::pipe2);

    dispatcher.register("socket", net::socket);
    dispatcher.register("bind", net::bind);
    dispatcher.register("connect", net::connect);

    dispatcher
}
