//! Sockets, devices and their syscalls

use core_types::{Fd, Pid};
use kernel::test_utils::{recording_kernel, MemFs, RecordingLoader};
use kernel::Kernel;
use kernel_api::{
    bytes_from_value, split_completion, Endpoint, Errno, KernelApi, KernelError, OpenFlags,
    SyscallRequest, TaskSpec,
};
use serde_json::{json, Value};
use services_device_manager::DetachMode;
use services_network::{AllowAllPolicy, DenyAllPolicy, LoopbackStack, NetworkService};
use std::cell::RefCell;
use std::rc::Rc;

fn call(
    kernel: &mut Kernel,
    loader: &RecordingLoader,
    pid: Pid,
    id: u64,
    request: SyscallRequest,
) -> Option<Result<Vec<Value>, Errno>> {
    let before = loader.completions(pid).len();
    assert!(loader.request(pid, id, request));
    kernel.run_until_idle();
    let completions = loader.completions(pid);
    (completions.len() > before).then(|| {
        let message = &completions[completions.len() - 1];
        split_completion(&message.args).map(<[Value]>::to_vec)
    })
}

fn fd_of(result: Option<Result<Vec<Value>, Errno>>) -> Fd {
    let values = result.unwrap().unwrap();
    Fd::new(values[0].as_u64().unwrap() as u32)
}

/// Kernel over a loopback stack listening on `localhost:80`
fn networked() -> (Kernel, RecordingLoader, Rc<LoopbackStack>) {
    let loader = RecordingLoader::new();
    let stack = Rc::new(LoopbackStack::new());
    stack.listen(Endpoint::new("localhost", 80));
    let kernel = Kernel::new(Box::new(MemFs::new()), Box::new(loader.clone())).with_network(
        NetworkService::new(Box::new(AllowAllPolicy), stack.clone()),
    );
    (kernel, loader, stack)
}

fn start(kernel: &mut Kernel) -> Pid {
    let pid = kernel.spawn(TaskSpec::new("/usr/bin/prog")).unwrap();
    kernel.run_until_idle();
    pid
}

#[test]
fn test_socket_connect_then_echo() {
    let (mut kernel, loader, stack) = networked();
    let pid = start(&mut kernel);

    let sock = fd_of(call(&mut kernel, &loader, pid, 1, SyscallRequest::Socket));
    let connect = SyscallRequest::Connect {
        fd: sock,
        address: "localhost".to_string(),
        port: 80,
    };
    assert_eq!(call(&mut kernel, &loader, pid, 2, connect), Some(Ok(vec![])));
    assert_eq!(stack.connect_attempts(), 1);

    let write = SyscallRequest::Write {
        fd: sock,
        data: b"hello".to_vec(),
    };
    assert_eq!(call(&mut kernel, &loader, pid, 3, write), Some(Ok(vec![json!(5)])));
    let read = SyscallRequest::Read {
        fd: sock,
        len: 16,
        position: None,
    };
    let data = call(&mut kernel, &loader, pid, 4, read).unwrap().unwrap();
    assert_eq!(bytes_from_value(&data[0]), Some(b"hello".to_vec()));
}

#[test]
fn test_connect_refused_and_not_a_socket() {
    let (mut kernel, loader, _stack) = networked();
    let pid = start(&mut kernel);

    let sock = fd_of(call(&mut kernel, &loader, pid, 1, SyscallRequest::Socket));
    let refused = SyscallRequest::Connect {
        fd: sock,
        address: "localhost".to_string(),
        port: 81,
    };
    assert_eq!(
        call(&mut kernel, &loader, pid, 2, refused),
        Some(Err(Errno::ECONNREFUSED))
    );

    let stdout = SyscallRequest::Connect {
        fd: Fd::STDOUT,
        address: "localhost".to_string(),
        port: 80,
    };
    assert_eq!(
        call(&mut kernel, &loader, pid, 3, stdout),
        Some(Err(Errno::ENOTSOCK))
    );
}

#[test]
fn test_unconnected_socket_io_fails() {
    let (mut kernel, loader, _stack) = networked();
    let pid = start(&mut kernel);
    let sock = fd_of(call(&mut kernel, &loader, pid, 1, SyscallRequest::Socket));

    let write = SyscallRequest::Write {
        fd: sock,
        data: b"x".to_vec(),
    };
    assert_eq!(
        call(&mut kernel, &loader, pid, 2, write),
        Some(Err(Errno::ENOTCONN))
    );
}

#[test]
fn test_bind_is_exclusive_until_close() {
    let (mut kernel, loader, _stack) = networked();
    let pid = start(&mut kernel);

    let first = fd_of(call(&mut kernel, &loader, pid, 1, SyscallRequest::Socket));
    let second = fd_of(call(&mut kernel, &loader, pid, 2, SyscallRequest::Socket));
    let bind = |fd| SyscallRequest::Bind {
        fd,
        address: "0.0.0.0".to_string(),
        port: 8080,
    };

    assert_eq!(call(&mut kernel, &loader, pid, 3, bind(first)), Some(Ok(vec![])));
    assert_eq!(
        call(&mut kernel, &loader, pid, 4, bind(second)),
        Some(Err(Errno::EADDRINUSE))
    );
    assert!(kernel
        .network()
        .is_bound(&Endpoint::new("0.0.0.0", 8080)));

    // Closing the only descriptor releases the binding
    assert_eq!(
        call(&mut kernel, &loader, pid, 5, SyscallRequest::Close { fd: first }),
        Some(Ok(vec![]))
    );
    assert_eq!(call(&mut kernel, &loader, pid, 6, bind(second)), Some(Ok(vec![])));
}

#[test]
fn test_policy_denies_connect() {
    let loader = RecordingLoader::new();
    let mut kernel = Kernel::new(Box::new(MemFs::new()), Box::new(loader.clone())).with_network(
        NetworkService::new(Box::new(DenyAllPolicy), Rc::new(LoopbackStack::new())),
    );
    let pid = start(&mut kernel);

    let sock = fd_of(call(&mut kernel, &loader, pid, 1, SyscallRequest::Socket));
    let connect = SyscallRequest::Connect {
        fd: sock,
        address: "localhost".to_string(),
        port: 80,
    };
    assert_eq!(
        call(&mut kernel, &loader, pid, 2, connect),
        Some(Err(Errno::ECONNREFUSED))
    );
    let bind = SyscallRequest::Bind {
        fd: sock,
        address: "0.0.0.0".to_string(),
        port: 80,
    };
    assert_eq!(call(&mut kernel, &loader, pid, 3, bind), Some(Err(Errno::EACCES)));
}

#[test]
fn test_host_connect_and_unbind() {
    let (mut kernel, _loader, _stack) = networked();
    let socket = kernel.network().socket();
    let outcome: Rc<RefCell<Option<Result<(), KernelError>>>> = Rc::default();

    let sink = Rc::clone(&outcome);
    kernel.connect(
        &socket,
        Endpoint::new("localhost", 80),
        Box::new(move |result| *sink.borrow_mut() = Some(result)),
    );
    assert_eq!(*outcome.borrow(), Some(Ok(())));

    let endpoint = Endpoint::new("0.0.0.0", 9000);
    let err = kernel.unbind(&socket, &endpoint).unwrap_err();
    assert_eq!(err.errno(), Errno::EINVAL);

    kernel.network().bind(&socket, endpoint.clone()).unwrap();
    kernel.unbind(&socket, &endpoint).unwrap();
    assert!(!kernel.network().is_bound(&endpoint));
}

#[test]
fn test_hotplug_device_opens_under_dev() {
    let (mut kernel, loader) = recording_kernel();
    let handle = kernel.hotplug("null", &json!({ "name": "sink" })).unwrap();
    assert_eq!(handle.name, "sink");
    let pid = start(&mut kernel);

    let open = SyscallRequest::Open {
        path: "/dev/sink".to_string(),
        flags: OpenFlags::from_bits(OpenFlags::O_RDWR),
        mode: 0,
    };
    let fd = fd_of(call(&mut kernel, &loader, pid, 1, open));
    let write = SyscallRequest::Write {
        fd,
        data: b"gone".to_vec(),
    };
    assert_eq!(call(&mut kernel, &loader, pid, 2, write), Some(Ok(vec![json!(4)])));

    let stat = call(
        &mut kernel,
        &loader,
        pid,
        3,
        SyscallRequest::Stat {
            path: "/dev/sink".to_string(),
        },
    )
    .unwrap()
    .unwrap();
    assert_eq!(stat[0]["kind"], json!("char_device"));

    kernel.detach_device(handle.id, DetachMode::Release).unwrap();
    let reopen = SyscallRequest::Open {
        path: "/dev/sink".to_string(),
        flags: OpenFlags::read_only(),
        mode: 0,
    };
    assert_eq!(
        call(&mut kernel, &loader, pid, 4, reopen),
        Some(Err(Errno::ENOENT))
    );
}

#[test]
fn test_hotplug_errors() {
    let (mut kernel, _loader) = recording_kernel();

    let err = kernel.hotplug("gpu", &json!({})).unwrap_err();
    assert_eq!(err.errno(), Errno::ENODEV);

    let err = kernel.hotplug("null", &json!({ "name": "a/b" })).unwrap_err();
    assert_eq!(err.errno(), Errno::EINVAL);

    kernel.hotplug("null", &json!({})).unwrap();
    let err = kernel.hotplug("null", &json!({})).unwrap_err();
    assert_eq!(err.errno(), Errno::EEXIST);
}
