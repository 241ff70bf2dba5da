//! Typed syscall requests
//!
//! Workers send positional JSON arguments. The dispatcher decodes them into a
//! [`SyscallRequest`] variant before a handler runs, so handlers never touch
//! raw values. Completions use the convention `[error, results...]` where the
//! error slot is `null` on success and a negative errno on failure.

use crate::capability::OpenFlags;
use crate::error::{Errno, KernelError};
use core_types::{Environment, Fd};
use ipc::{SyscallId, SyscallMessage};
use serde_json::{json, Value};

/// `wait4` option: return immediately when no child has exited
pub const WNOHANG: u32 = 1;

/// A decoded syscall
#[derive(Debug, Clone, PartialEq)]
pub enum SyscallRequest {
    Exit {
        code: i32,
    },
    Getpid,
    Getppid,
    Getcwd,
    Chdir {
        path: String,
    },
    Open {
        path: String,
        flags: OpenFlags,
        mode: u32,
    },
    Close {
        fd: Fd,
    },
    Read {
        fd: Fd,
        len: usize,
        position: Option<u64>,
    },
    Write {
        fd: Fd,
        data: Vec<u8>,
    },
    Fstat {
        fd: Fd,
    },
    Stat {
        path: String,
    },
    Readdir {
        fd: Fd,
    },
    Dup {
        fd: Fd,
    },
    Dup2 {
        fd: Fd,
        target: Fd,
    },
    Pipe2 {
        flags: u32,
    },
    Spawn {
        cwd: String,
        path: String,
        args: Vec<String>,
        env: Environment,
        files: Vec<Fd>,
    },
    Wait4 {
        /// Child pid, or -1 for any child
        pid: i64,
        options: u32,
    },
    Kill {
        pid: u32,
        signal: u32,
    },
    Getpriority,
    Setpriority {
        priority: i32,
    },
    Socket,
    Bind {
        fd: Fd,
        address: String,
        port: u16,
    },
    Connect {
        fd: Fd,
        address: String,
        port: u16,
    },
}

/// Every syscall name the kernel understands
pub const SYSCALL_NAMES: [&str; 23] = [
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
];

impl SyscallRequest {
    /// Decodes positional arguments for `name`
    pub fn decode(name: &str, args: &[Value]) -> Result<Self, KernelError> {
        let mut r = ArgReader::new(name, args);
        let request = match name {
            "exit" => SyscallRequest::Exit {
                code: r.i32_or("code", 0)?,
            },
            "getpid" => SyscallRequest::Getpid,
            "getppid" => SyscallRequest::Getppid,
            "getcwd" => SyscallRequest::Getcwd,
            "chdir" => SyscallRequest::Chdir {
                path: r.string("path")?,
            },
            "open" => SyscallRequest::Open {
                path: r.string("path")?,
                flags: OpenFlags::from_bits(r.u32_or("flags", 0)?),
                mode: r.u32_or("mode", 0o666)?,
            },
            "close" => SyscallRequest::Close { fd: r.fd("fd")? },
            "read" => SyscallRequest::Read {
                fd: r.fd("fd")?,
                len: r.u64("len")? as usize,
                position: r.optional_u64("position")?,
            },
            "write" => SyscallRequest::Write {
                fd: r.fd("fd")?,
                data: r.bytes("data")?,
            },
            "fstat" => SyscallRequest::Fstat { fd: r.fd("fd")? },
            "stat" => SyscallRequest::Stat {
                path: r.string("path")?,
            },
            "readdir" => SyscallRequest::Readdir { fd: r.fd("fd")? },
            "dup" => SyscallRequest::Dup { fd: r.fd("fd")? },
            "dup2" => SyscallRequest::Dup2 {
                fd: r.fd("fd")?,
                target: r.fd("target")?,
            },
            "pipe2" => SyscallRequest::Pipe2 {
                flags: r.u32_or("flags", 0)?,
            },
            "spawn" => SyscallRequest::Spawn {
                cwd: r.string("cwd")?,
                path: r.string("path")?,
                args: r.string_list("args")?,
                env: r.environment("env")?,
                files: r.fd_list("files")?,
            },
            "wait4" => SyscallRequest::Wait4 {
                pid: r.i64("pid")?,
                options: r.u32_or("options", 0)?,
            },
            "kill" => SyscallRequest::Kill {
                pid: r.u32("pid")?,
                signal: r.u32_or("signal", 15)?,
            },
            "getpriority" => SyscallRequest::Getpriority,
            "setpriority" => SyscallRequest::Setpriority {
                priority: r.i32("priority")?,
            },
            "socket" => SyscallRequest::Socket,
            "bind" => SyscallRequest::Bind {
                fd: r.fd("fd")?,
                address: r.string("addr")?,
                port: r.port("port")?,
            },
            "connect" => SyscallRequest::Connect {
                fd: r.fd("fd")?,
                address: r.string("addr")?,
                port: r.port("port")?,
            },
            other => return Err(KernelError::UnknownSyscall(other.to_string())),
        };
        Ok(request)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SyscallRequest::Exit { .. } => "exit",
            SyscallRequest::Getpid => "getpid",
            SyscallRequest::Getppid => "getppid",
            SyscallRequest::Getcwd => "getcwd",
            SyscallRequest::Chdir { .. } => "chdir",
            SyscallRequest::Open { .. } => "open",
            SyscallRequest::Close { .. } => "close",
            SyscallRequest::Read { .. } => "read",
            SyscallRequest::Write { .. } => "write",
            SyscallRequest::Fstat { .. } => "fstat",
            SyscallRequest::Stat { .. } => "stat",
            SyscallRequest::Readdir { .. } => "readdir",
            SyscallRequest::Dup { .. } => "dup",
            SyscallRequest::Dup2 { .. } => "dup2",
            SyscallRequest::Pipe2 { .. } => "pipe2",
            SyscallRequest::Spawn { .. } => "spawn",
            SyscallRequest::Wait4 { .. } => "wait4",
            SyscallRequest::Kill { .. } => "kill",
            SyscallRequest::Getpriority => "getpriority",
            SyscallRequest::Setpriority { .. } => "setpriority",
            SyscallRequest::Socket => "socket",
            SyscallRequest::Bind { .. } => "bind",
            SyscallRequest::Connect { .. } => "connect",
        }
    }

    /// Positional arguments as a worker would send them
    pub fn encode_args(&self) -> Vec<Value> {
        match self {
            SyscallRequest::Exit { code } => vec![json!(code)],
            SyscallRequest::Getpid
            | SyscallRequest::Getppid
            | SyscallRequest::Getcwd
            | SyscallRequest::Getpriority
            | SyscallRequest::Socket => vec![],
            SyscallRequest::Chdir { path } | SyscallRequest::Stat { path } => vec![json!(path)],
            SyscallRequest::Open { path, flags, mode } => {
                vec![json!(path), json!(flags.bits()), json!(mode)]
            }
            SyscallRequest::Close { fd }
            | SyscallRequest::Fstat { fd }
            | SyscallRequest::Readdir { fd }
            | SyscallRequest::Dup { fd } => vec![json!(fd.as_u32())],
            SyscallRequest::Read { fd, len, position } => {
                let mut args = vec![json!(fd.as_u32()), json!(len)];
                if let Some(position) = position {
                    args.push(json!(position));
                }
                args
            }
            SyscallRequest::Write { fd, data } => vec![json!(fd.as_u32()), bytes_to_value(data)],
            SyscallRequest::Dup2 { fd, target } => {
                vec![json!(fd.as_u32()), json!(target.as_u32())]
            }
            SyscallRequest::Pipe2 { flags } => vec![json!(flags)],
            SyscallRequest::Spawn {
                cwd,
                path,
                args,
                env,
                files,
            } => {
                let env: serde_json::Map<String, Value> = env
                    .iter()
                    .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                    .collect();
                let files: Vec<u32> = files.iter().map(|fd| fd.as_u32()).collect();
                vec![
                    json!(cwd),
                    json!(path),
                    json!(args),
                    Value::Object(env),
                    json!(files),
                ]
            }
            SyscallRequest::Wait4 { pid, options } => vec![json!(pid), json!(options)],
            SyscallRequest::Kill { pid, signal } => vec![json!(pid), json!(signal)],
            SyscallRequest::Setpriority { priority } => vec![json!(priority)],
            SyscallRequest::Bind { fd, address, port }
            | SyscallRequest::Connect { fd, address, port } => {
                vec![json!(fd.as_u32()), json!(address), json!(port)]
            }
        }
    }

    /// Wraps the request in a wire envelope
    pub fn into_message(self, id: SyscallId) -> SyscallMessage {
        SyscallMessage::request(id, self.name(), self.encode_args())
    }
}

/// Reads byte payloads sent either as a UTF-8 string or as an array of bytes
pub fn bytes_from_value(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(s) => Some(s.as_bytes().to_vec()),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect(),
        _ => None,
    }
}

/// Encodes bytes as a string when they are valid UTF-8, else as a byte array
pub fn bytes_to_value(data: &[u8]) -> Value {
    match std::str::from_utf8(data) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => json!(data),
    }
}

/// Splits a completion into its results, or the errno it reports
pub fn split_completion(args: &[Value]) -> Result<&[Value], Errno> {
    match args.split_first() {
        None => Ok(&[]),
        Some((Value::Null, rest)) => Ok(rest),
        Some((err, _)) => {
            let code = err.as_i64().and_then(|c| i32::try_from(c).ok());
            Err(code.and_then(Errno::from_code).unwrap_or(Errno::EIO))
        }
    }
}

struct ArgReader<'a> {
    name: &'a str,
    args: &'a [Value],
    pos: usize,
}

impl<'a> ArgReader<'a> {
    fn new(name: &'a str, args: &'a [Value]) -> Self {
        Self { name, args, pos: 0 }
    }

    fn next(&mut self) -> Option<&'a Value> {
        let value = self.args.get(self.pos);
        self.pos += 1;
        value.filter(|v| !v.is_null())
    }

    fn invalid(&self, field: &str) -> KernelError {
        KernelError::InvalidArgs(format!("{}: bad or missing `{}`", self.name, field))
    }

    fn i64(&mut self, field: &str) -> Result<i64, KernelError> {
        self.next()
            .and_then(Value::as_i64)
            .ok_or_else(|| self.invalid(field))
    }

    fn u64(&mut self, field: &str) -> Result<u64, KernelError> {
        self.next()
            .and_then(Value::as_u64)
            .ok_or_else(|| self.invalid(field))
    }

    fn optional_u64(&mut self, field: &str) -> Result<Option<u64>, KernelError> {
        match self.next() {
            None => Ok(None),
            Some(value) => {
                // Negative positions mean "current offset"
                if value.as_i64().is_some_and(|v| v < 0) {
                    return Ok(None);
                }
                value.as_u64().map(Some).ok_or_else(|| self.invalid(field))
            }
        }
    }

    fn i32(&mut self, field: &str) -> Result<i32, KernelError> {
        let raw = self.i64(field)?;
        i32::try_from(raw).map_err(|_| self.invalid(field))
    }

    fn i32_or(&mut self, field: &str, default: i32) -> Result<i32, KernelError> {
        if self.args.get(self.pos).map_or(true, Value::is_null) {
            self.pos += 1;
            return Ok(default);
        }
        self.i32(field)
    }

    fn u32(&mut self, field: &str) -> Result<u32, KernelError> {
        let raw = self.u64(field)?;
        u32::try_from(raw).map_err(|_| self.invalid(field))
    }

    fn u32_or(&mut self, field: &str, default: u32) -> Result<u32, KernelError> {
        if self.args.get(self.pos).map_or(true, Value::is_null) {
            self.pos += 1;
            return Ok(default);
        }
        self.u32(field)
    }

    fn fd(&mut self, field: &str) -> Result<Fd, KernelError> {
        self.u32(field).map(Fd::new)
    }

    fn port(&mut self, field: &str) -> Result<u16, KernelError> {
        let raw = self.u64(field)?;
        u16::try_from(raw).map_err(|_| self.invalid(field))
    }

    fn string(&mut self, field: &str) -> Result<String, KernelError> {
        self.next()
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| self.invalid(field))
    }

    fn bytes(&mut self, field: &str) -> Result<Vec<u8>, KernelError> {
        self.next()
            .and_then(bytes_from_value)
            .ok_or_else(|| self.invalid(field))
    }

    fn string_list(&mut self, field: &str) -> Result<Vec<String>, KernelError> {
        let Some(value) = self.next() else {
            return Ok(Vec::new());
        };
        value
            .as_array()
            .and_then(|items| {
                items
                    .iter()
                    .map(|item| item.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
            })
            .ok_or_else(|| self.invalid(field))
    }

    fn fd_list(&mut self, field: &str) -> Result<Vec<Fd>, KernelError> {
        let Some(value) = self.next() else {
            return Ok(Vec::new());
        };
        value
            .as_array()
            .and_then(|items| {
                items
                    .iter()
                    .map(|item| {
                        item.as_u64()
                            .and_then(|raw| u32::try_from(raw).ok())
                            .map(Fd::new)
                    })
                    .collect::<Option<Vec<_>>>()
            })
            .ok_or_else(|| self.invalid(field))
    }

    /// Accepts `{ "K": "V" }` or `["K=V", ...]`
    fn environment(&mut self, field: &str) -> Result<Environment, KernelError> {
        let Some(value) = self.next() else {
            return Ok(Environment::new());
        };
        match value {
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect::<Option<Environment>>()
                .ok_or_else(|| self.invalid(field)),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .and_then(|entry| entry.split_once('='))
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                })
                .collect::<Option<Environment>>()
                .ok_or_else(|| self.invalid(field)),
            _ => Err(self.invalid(field)),
        }
    }
}
