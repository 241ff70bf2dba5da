//! Contract tests for syscall envelopes and completions
//!
//! Workers build these by hand, so argument order and errno numbers are
//! part of the ABI.

#[cfg(test)]
mod tests {
    use crate::test_helpers::{assert_parses, assert_wire};
    use core_types::{Environment, Fd};
    use ipc::{SyscallId, SyscallMessage};
    use kernel::parse_envelope;
    use kernel_api::{split_completion, Errno, OpenFlags, SyscallRequest, SYSCALL_NAMES};
    use serde_json::{json, Value};

    #[test]
    fn test_request_envelope_golden() {
        let msg = SyscallRequest::Read {
            fd: Fd::new(3),
            len: 10,
            position: None,
        }
        .into_message(SyscallId::new(5));

        assert_wire(&msg, json!({ "id": 5, "name": "read", "args": [3, 10] }));
    }

    #[test]
    fn test_response_envelope_has_no_name() {
        let msg = SyscallMessage::response(SyscallId::new(5), vec![Value::Null, json!("hi")]);
        assert_wire(&msg, json!({ "id": 5, "args": [null, "hi"] }));
        assert_parses(json!({ "id": 5, "args": [null, "hi"] }), &msg);
    }

    #[test]
    fn test_positional_argument_order() {
        let cases = vec![
            (
                SyscallRequest::Open {
                    path: "/tmp/x".to_string(),
                    flags: OpenFlags::write_truncate(),
                    mode: 0o644,
                },
                json!(["/tmp/x", 0o1101, 0o644]),
            ),
            (
                SyscallRequest::Read {
                    fd: Fd::new(4),
                    len: 16,
                    position: Some(100),
                },
                json!([4, 16, 100]),
            ),
            (
                SyscallRequest::Write {
                    fd: Fd::STDOUT,
                    data: b"hi\n".to_vec(),
                },
                json!([1, "hi\n"]),
            ),
            (
                SyscallRequest::Write {
                    fd: Fd::STDOUT,
                    data: vec![0xff, 0x00],
                },
                json!([1, [255, 0]]),
            ),
            (
                SyscallRequest::Dup2 {
                    fd: Fd::new(3),
                    target: Fd::STDOUT,
                },
                json!([3, 1]),
            ),
            (
                SyscallRequest::Spawn {
                    cwd: "/".to_string(),
                    path: "/usr/bin/echo".to_string(),
                    args: vec!["echo".to_string(), "hi".to_string()],
                    env: Environment::new().with("PATH", "/usr/bin"),
                    files: vec![Fd::STDIN, Fd::new(4), Fd::STDERR],
                },
                json!(["/", "/usr/bin/echo", ["echo", "hi"], { "PATH": "/usr/bin" }, [0, 4, 2]]),
            ),
            (
                SyscallRequest::Wait4 { pid: -1, options: 1 },
                json!([-1, 1]),
            ),
            (
                SyscallRequest::Connect {
                    fd: Fd::new(3),
                    address: "localhost".to_string(),
                    port: 80,
                },
                json!([3, "localhost", 80]),
            ),
        ];

        for (request, expected) in cases {
            assert_eq!(
                Value::Array(request.encode_args()),
                expected,
                "argument order of {}",
                request.name()
            );
        }
    }

    #[test]
    fn test_decode_defaults() {
        assert_eq!(
            SyscallRequest::decode("exit", &[]).unwrap(),
            SyscallRequest::Exit { code: 0 }
        );
        assert_eq!(
            SyscallRequest::decode("kill", &[json!(4)]).unwrap(),
            SyscallRequest::Kill { pid: 4, signal: 15 }
        );
        assert_eq!(
            SyscallRequest::decode("open", &[json!("/etc/motd")]).unwrap(),
            SyscallRequest::Open {
                path: "/etc/motd".to_string(),
                flags: OpenFlags::read_only(),
                mode: 0o666,
            }
        );
    }

    #[test]
    fn test_errno_wire_values() {
        let table = [
            (Errno::EPERM, -1),
            (Errno::ENOENT, -2),
            (Errno::ESRCH, -3),
            (Errno::EIO, -5),
            (Errno::EBADF, -9),
            (Errno::ECHILD, -10),
            (Errno::EAGAIN, -11),
            (Errno::EACCES, -13),
            (Errno::EEXIST, -17),
            (Errno::ENODEV, -19),
            (Errno::ENOTDIR, -20),
            (Errno::EISDIR, -21),
            (Errno::EINVAL, -22),
            (Errno::EMFILE, -24),
            (Errno::ESPIPE, -29),
            (Errno::EPIPE, -32),
            (Errno::ENOSYS, -38),
            (Errno::EPROTO, -71),
            (Errno::ENOTSOCK, -88),
            (Errno::EADDRINUSE, -98),
            (Errno::EISCONN, -106),
            (Errno::ENOTCONN, -107),
            (Errno::ECONNREFUSED, -111),
        ];

        for (errno, wire) in table {
            assert_eq!(errno.wire_value(), wire, "{:?}", errno);
            assert_eq!(Errno::from_code(-wire as i32), Some(errno));
        }
    }

    #[test]
    fn test_completion_split() {
        assert_eq!(split_completion(&[Value::Null, json!(3)]), Ok(&[json!(3)][..]));
        assert_eq!(split_completion(&[json!(-2)]), Err(Errno::ENOENT));
        // Unknown numbers still read as an error
        assert_eq!(split_completion(&[json!(-4095)]), Err(Errno::EIO));
    }

    #[test]
    fn test_envelope_validation() {
        let ok = parse_envelope(&json!({ "id": 1, "name": "getpid", "args": [] })).unwrap();
        assert_eq!(ok.id, SyscallId::new(1));
        assert_eq!(ok.name, "getpid");

        let missing_args = parse_envelope(&json!({ "id": 7, "name": "getpid" })).unwrap_err();
        assert_eq!(missing_args.id, Some(SyscallId::new(7)));

        let bad_id = parse_envelope(&json!({ "id": "7", "name": "getpid", "args": [] }))
            .unwrap_err();
        assert_eq!(bad_id.id, None);

        assert!(parse_envelope(&json!([1, "getpid"])).is_err());
    }

    #[test]
    fn test_syscall_names_are_stable() {
        assert_eq!(
            SYSCALL_NAMES,
            [
                "exit",
                "getpid",
                "getppid",
                "getcwd",
                "chdir",
                "open",
                "close",
                "read",
                "write",
                "fstat",
                "stat",
                "readdir",
                "dup",
                "dup2",
                "pipe2",
                "spawn",
                "wait4",
                "kill",
                "getpriority",
                "setpriority",
                "socket",
                "bind",
                "connect",
            ]
        );
    }

    #[test]
    fn test_open_flag_bits() {
        assert_eq!(OpenFlags::O_RDONLY, 0);
        assert_eq!(OpenFlags::O_WRONLY, 0o1);
        assert_eq!(OpenFlags::O_RDWR, 0o2);
        assert_eq!(OpenFlags::O_CREAT, 0o100);
        assert_eq!(OpenFlags::O_EXCL, 0o200);
        assert_eq!(OpenFlags::O_TRUNC, 0o1000);
        assert_eq!(OpenFlags::O_APPEND, 0o2000);
        assert_eq!(OpenFlags::write_truncate().bits(), 0o1101);
    }
}
