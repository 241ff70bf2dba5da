//! Test utilities
//!
//! In-memory collaborators for running the kernel without a host: a
//! filesystem, scripted workers with a handful of built-in programs, and a
//! recording worker for protocol-level tests.

use crate::Kernel;
use core_types::{Environment, Fd, KeepAlive, OutputStream, Pid};
use ipc::{InitMessage, SyscallId, SyscallMessage, WorkerMessage, WorkerPort};
use kernel_api::{
    bytes_from_value, split_completion, CapabilityError, Errno, File, FileHandle, FileKind,
    FileStat, FileSystem, IoCallback, IoResult, KernelError, KernelEvent, OpenFlags,
    ProgramLoader, SyscallRequest, TaskSpec, Worker,
};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

/// Builds a kernel over a fresh [`MemFs`] with the built-in programs
pub fn kernel() -> Kernel {
    Kernel::new(Box::new(MemFs::new()), Box::new(BuiltinLoader::new()))
}

/// Builds a kernel whose workers record everything they receive
pub fn recording_kernel() -> (Kernel, RecordingLoader) {
    let loader = RecordingLoader::new();
    let kernel = Kernel::new(Box::new(MemFs::new()), Box::new(loader.clone()));
    (kernel, loader)
}

/// Concatenates the output `pid` wrote to `stream`
pub fn output_of(events: &[KernelEvent], pid: Pid, stream: OutputStream) -> String {
    let mut bytes = Vec::new();
    for event in events {
        if let KernelEvent::Output {
            pid: from,
            stream: to,
            chunk,
        } = event
        {
            if *from == pid && *to == stream {
                bytes.extend_from_slice(chunk);
            }
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Exit code reported for `pid`, if it exited
pub fn exit_code_of(events: &[KernelEvent], pid: Pid) -> Option<i32> {
    events.iter().find_map(|event| match event {
        KernelEvent::Exited { pid: from, code } if *from == pid => Some(*code),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// In-memory filesystem
// ---------------------------------------------------------------------------

type Contents = Rc<RefCell<Vec<u8>>>;

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(index) => &path[..index],
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[derive(Default)]
struct MemFsState {
    files: BTreeMap<String, Contents>,
    dirs: BTreeSet<String>,
}

impl MemFsState {
    fn mkdir_all(&mut self, path: &str) {
        let mut current = path.to_string();
        loop {
            self.dirs.insert(current.clone());
            if current == "/" {
                break;
            }
            current = parent_of(&current).to_string();
        }
    }

    fn children(&self, dir: &str) -> Vec<String> {
        let names: BTreeSet<String> = self
            .dirs
            .iter()
            .filter(|path| path.as_str() != "/")
            .chain(self.files.keys())
            .filter(|path| parent_of(path) == dir)
            .map(|path| base_name(path).to_string())
            .collect();
        names.into_iter().collect()
    }
}

/// In-memory filesystem; clones share state
#[derive(Clone)]
pub struct MemFs {
    state: Rc<RefCell<MemFsState>>,
}

impl MemFs {
    /// An empty tree with `/usr/bin` and `/tmp`
    pub fn new() -> Self {
        let mut state = MemFsState::default();
        state.mkdir_all("/usr/bin");
        state.mkdir_all("/tmp");
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn with_file(self, path: &str, contents: impl AsRef<[u8]>) -> Self {
        self.add_file(path, contents);
        self
    }

    /// Creates or replaces a file, creating missing parent directories
    pub fn add_file(&self, path: &str, contents: impl AsRef<[u8]>) {
        let mut state = self.state.borrow_mut();
        state.mkdir_all(parent_of(path));
        state.files.insert(
            path.to_string(),
            Rc::new(RefCell::new(contents.as_ref().to_vec())),
        );
    }

    pub fn mkdir(&self, path: &str) {
        self.state.borrow_mut().mkdir_all(path);
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .borrow()
            .files
            .get(path)
            .map(|contents| contents.borrow().clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        let state = self.state.borrow();
        state.files.contains_key(path) || state.dirs.contains(path)
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for MemFs {
    fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> IoResult<FileHandle> {
        let mut state = self.state.borrow_mut();
        if state.dirs.contains(path) {
            if flags.write {
                return Err(CapabilityError::new(Errno::EISDIR, path));
            }
            return Ok(Rc::new(MemDir {
                names: state.children(path),
                keep_alive: KeepAlive::new(),
            }));
        }

        let existing = state.files.get(path).cloned();
        let contents = match existing {
            Some(_) if flags.create && flags.exclusive => {
                return Err(CapabilityError::new(Errno::EEXIST, path));
            }
            Some(contents) => contents,
            None if flags.create => {
                if !state.dirs.contains(parent_of(path)) {
                    return Err(CapabilityError::new(Errno::ENOENT, path));
                }
                let contents = Contents::default();
                state.files.insert(path.to_string(), Rc::clone(&contents));
                contents
            }
            None => return Err(CapabilityError::new(Errno::ENOENT, path)),
        };
        if flags.write && flags.truncate {
            contents.borrow_mut().clear();
        }

        Ok(Rc::new(MemFile {
            contents,
            offset: Cell::new(0),
            flags,
            mode,
            keep_alive: KeepAlive::new(),
        }))
    }

    fn stat(&self, path: &str) -> IoResult<FileStat> {
        let state = self.state.borrow();
        if state.dirs.contains(path) {
            return Ok(FileStat::new(FileKind::Directory, 0, 0o755));
        }
        match state.files.get(path) {
            Some(contents) => Ok(FileStat::new(
                FileKind::Regular,
                contents.borrow().len() as u64,
                0o644,
            )),
            None => Err(CapabilityError::new(Errno::ENOENT, path)),
        }
    }
}

/// An open regular file in a [`MemFs`]
pub struct MemFile {
    contents: Contents,
    offset: Cell<usize>,
    flags: OpenFlags,
    mode: u32,
    keep_alive: KeepAlive,
}

impl File for MemFile {
    fn write(&self, data: &[u8], cb: IoCallback<usize>) {
        if !self.flags.write {
            return cb(Err(Errno::EBADF.into()));
        }
        let end = {
            let mut contents = self.contents.borrow_mut();
            let start = if self.flags.append {
                contents.len()
            } else {
                self.offset.get()
            };
            let end = start + data.len();
            if contents.len() < end {
                contents.resize(end, 0);
            }
            contents[start..end].copy_from_slice(data);
            end
        };
        self.offset.set(end);
        cb(Ok(data.len()))
    }

    fn read(&self, len: usize, position: Option<u64>, cb: IoCallback<Vec<u8>>) {
        if !self.flags.read {
            return cb(Err(Errno::EBADF.into()));
        }
        let (start, chunk) = {
            let contents = self.contents.borrow();
            let start = position
                .map_or(self.offset.get(), |position| position as usize)
                .min(contents.len());
            let end = start.saturating_add(len).min(contents.len());
            (start, contents[start..end].to_vec())
        };
        if position.is_none() {
            self.offset.set(start + chunk.len());
        }
        cb(Ok(chunk))
    }

    fn stat(&self, cb: IoCallback<FileStat>) {
        let size = self.contents.borrow().len() as u64;
        cb(Ok(FileStat::new(FileKind::Regular, size, self.mode)))
    }

    fn keep_alive(&self) -> &KeepAlive {
        &self.keep_alive
    }
}

/// A directory snapshot taken at open time
struct MemDir {
    names: Vec<String>,
    keep_alive: KeepAlive,
}

impl File for MemDir {
    fn write(&self, _data: &[u8], cb: IoCallback<usize>) {
        cb(Err(Errno::EISDIR.into()))
    }

    fn read(&self, _len: usize, _position: Option<u64>, cb: IoCallback<Vec<u8>>) {
        cb(Err(Errno::EISDIR.into()))
    }

    fn stat(&self, cb: IoCallback<FileStat>) {
        cb(Ok(FileStat::new(FileKind::Directory, 0, 0o755)))
    }

    fn readdir(&self, cb: IoCallback<Vec<String>>) {
        cb(Ok(self.names.clone()))
    }

    fn keep_alive(&self) -> &KeepAlive {
        &self.keep_alive
    }
}

// ---------------------------------------------------------------------------
// Scripted workers
// ---------------------------------------------------------------------------

/// A program run by a [`ScriptWorker`]
///
/// Each call returns the next syscall to issue, or `None` to stop issuing.
/// `exit` never completes, so a program that issues it is not resumed again.
pub trait Program {
    fn start(&mut self, init: &InitMessage) -> Option<SyscallRequest>;
    fn resume(&mut self, result: Result<&[Value], Errno>) -> Option<SyscallRequest>;
}

/// Worker that drives a [`Program`] one syscall at a time
pub struct ScriptWorker {
    program: Box<dyn Program>,
    port: WorkerPort,
    next_id: u64,
    terminated: bool,
}

impl ScriptWorker {
    pub fn new(program: Box<dyn Program>, port: WorkerPort) -> Self {
        Self {
            program,
            port,
            next_id: 1,
            terminated: false,
        }
    }

    fn issue(&mut self, request: Option<SyscallRequest>) {
        let Some(request) = request else {
            return;
        };
        let id = SyscallId::new(self.next_id);
        self.next_id += 1;
        if self.port.post(request.into_message(id).to_value()).is_err() {
            self.terminated = true;
        }
    }
}

impl Worker for ScriptWorker {
    fn post_message(&mut self, message: WorkerMessage) {
        if self.terminated {
            return;
        }
        let request = match &message {
            WorkerMessage::Init(init) => self.program.start(init),
            WorkerMessage::Completion(completion) => {
                self.program.resume(split_completion(&completion.args))
            }
        };
        self.issue(request);
    }

    fn terminate(&mut self) {
        self.terminated = true;
    }
}

/// Results observed by a [`Script`], in order
pub type ScriptLog = Rc<RefCell<Vec<Result<Vec<Value>, Errno>>>>;

/// Issues a fixed list of requests, recording every result
pub struct Script {
    requests: VecDeque<SyscallRequest>,
    log: ScriptLog,
}

impl Script {
    pub fn new(requests: Vec<SyscallRequest>, log: ScriptLog) -> Self {
        Self {
            requests: requests.into(),
            log,
        }
    }
}

impl Program for Script {
    fn start(&mut self, _init: &InitMessage) -> Option<SyscallRequest> {
        self.requests.pop_front()
    }

    fn resume(&mut self, result: Result<&[Value], Errno>) -> Option<SyscallRequest> {
        self.log.borrow_mut().push(result.map(<[Value]>::to_vec));
        self.requests.pop_front()
    }
}

struct Echo;

impl Program for Echo {
    fn start(&mut self, init: &InitMessage) -> Option<SyscallRequest> {
        let text = init.args.get(1..).unwrap_or_default().join(" ");
        Some(SyscallRequest::Write {
            fd: Fd::STDOUT,
            data: format!("{}\n", text).into_bytes(),
        })
    }

    fn resume(&mut self, result: Result<&[Value], Errno>) -> Option<SyscallRequest> {
        Some(SyscallRequest::Exit {
            code: if result.is_ok() { 0 } else { 1 },
        })
    }
}

/// Exits with a fixed code (`true`, `false`)
struct ExitWith(i32);

impl Program for ExitWith {
    fn start(&mut self, _init: &InitMessage) -> Option<SyscallRequest> {
        Some(SyscallRequest::Exit { code: self.0 })
    }

    fn resume(&mut self, _result: Result<&[Value], Errno>) -> Option<SyscallRequest> {
        None
    }
}

const CAT_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CatStage {
    Opening,
    Reading,
    Writing,
    Closing,
}

/// Copies files (or stdin) to stdout
struct Cat {
    paths: VecDeque<String>,
    /// Open input file; `None` while copying stdin
    fd: Option<Fd>,
    stage: CatStage,
    status: i32,
}

impl Cat {
    fn new() -> Self {
        Self {
            paths: VecDeque::new(),
            fd: None,
            stage: CatStage::Reading,
            status: 0,
        }
    }

    fn read(&mut self) -> SyscallRequest {
        self.stage = CatStage::Reading;
        SyscallRequest::Read {
            fd: self.fd.unwrap_or(Fd::STDIN),
            len: CAT_CHUNK,
            position: None,
        }
    }

    fn next_input(&mut self) -> SyscallRequest {
        match self.paths.pop_front() {
            Some(path) => {
                self.stage = CatStage::Opening;
                SyscallRequest::Open {
                    path,
                    flags: OpenFlags::read_only(),
                    mode: 0,
                }
            }
            None => SyscallRequest::Exit { code: self.status },
        }
    }
}

impl Program for Cat {
    fn start(&mut self, init: &InitMessage) -> Option<SyscallRequest> {
        self.paths = init.args.iter().skip(1).cloned().collect();
        if self.paths.is_empty() {
            Some(self.read())
        } else {
            Some(self.next_input())
        }
    }

    fn resume(&mut self, result: Result<&[Value], Errno>) -> Option<SyscallRequest> {
        let request = match (self.stage, result) {
            (CatStage::Opening, Ok(values)) => {
                match values.first().and_then(Value::as_u64) {
                    Some(fd) => {
                        self.fd = Some(Fd::new(fd as u32));
                        self.read()
                    }
                    None => {
                        self.status = 1;
                        self.next_input()
                    }
                }
            }
            (CatStage::Reading, Ok(values)) => {
                let data = values.first().and_then(bytes_from_value).unwrap_or_default();
                if data.is_empty() {
                    match self.fd.take() {
                        Some(fd) => {
                            self.stage = CatStage::Closing;
                            SyscallRequest::Close { fd }
                        }
                        None => self.next_input(),
                    }
                } else {
                    self.stage = CatStage::Writing;
                    SyscallRequest::Write {
                        fd: Fd::STDOUT,
                        data,
                    }
                }
            }
            (CatStage::Writing, Ok(_)) => self.read(),
            (CatStage::Writing, Err(_)) => SyscallRequest::Exit { code: 1 },
            (CatStage::Closing, _) => self.next_input(),
            (CatStage::Opening, Err(_)) | (CatStage::Reading, Err(_)) => {
                self.status = 1;
                self.next_input()
            }
        };
        Some(request)
    }
}

// ---------------------------------------------------------------------------
// Shell
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Pipe,
    Separator,
    Input,
    Output,
}

fn tokenize(line: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    fn flush(tokens: &mut Vec<Token>, word: &mut String, in_word: &mut bool) {
        if *in_word {
            tokens.push(Token::Word(std::mem::take(word)));
            *in_word = false;
        }
    }

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => flush(&mut tokens, &mut word, &mut in_word),
            '|' | ';' | '&' | '<' | '>' => {
                flush(&mut tokens, &mut word, &mut in_word);
                tokens.push(match c {
                    '|' => Token::Pipe,
                    '<' => Token::Input,
                    '>' => Token::Output,
                    _ => Token::Separator,
                });
            }
            '\'' | '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some(q) if q == c => break,
                        Some(other) => word.push(other),
                        None => return Err("unterminated quote".to_string()),
                    }
                }
            }
            other => {
                in_word = true;
                word.push(other);
            }
        }
    }
    flush(&mut tokens, &mut word, &mut in_word);
    Ok(tokens)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Command {
    argv: Vec<String>,
    input: Option<String>,
    output: Option<String>,
}

/// Parses `a | b > f; c < g` into pipelines of commands
fn parse_script(line: &str) -> Result<Vec<Vec<Command>>, String> {
    let mut pipelines = Vec::new();
    let mut pipeline: Vec<Command> = Vec::new();
    let mut command = Command::default();
    let mut redirect: Option<Token> = None;

    for token in tokenize(line)? {
        match token {
            Token::Word(word) => match redirect.take() {
                Some(Token::Input) => command.input = Some(word),
                Some(_) => command.output = Some(word),
                None => command.argv.push(word),
            },
            _ if redirect.is_some() => return Err("missing redirect target".to_string()),
            Token::Input => redirect = Some(Token::Input),
            Token::Output => redirect = Some(Token::Output),
            Token::Pipe => {
                if command.argv.is_empty() {
                    return Err("empty command in pipeline".to_string());
                }
                pipeline.push(std::mem::take(&mut command));
            }
            Token::Separator => {
                if !command.argv.is_empty() {
                    pipeline.push(std::mem::take(&mut command));
                } else if !pipeline.is_empty() {
                    return Err("empty command in pipeline".to_string());
                }
                if !pipeline.is_empty() {
                    pipelines.push(std::mem::take(&mut pipeline));
                }
            }
        }
    }
    if redirect.is_some() {
        return Err("missing redirect target".to_string());
    }
    if !command.argv.is_empty() {
        pipeline.push(command);
    } else if !pipeline.is_empty() {
        return Err("empty command in pipeline".to_string());
    }
    if !pipeline.is_empty() {
        pipelines.push(pipeline);
    }
    Ok(pipelines)
}

/// Descriptor reference resolved once the syscall creating it completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Fixed(Fd),
    PipeRead(usize),
    PipeWrite(usize),
    Opened(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Pipe,
    Open { path: String, write: bool },
    Spawn { argv: Vec<String>, stdin: Slot, stdout: Slot },
    Close(Slot),
    Wait(usize),
    Report(String),
}

/// Lowers pipelines into the syscall plan the shell executes
fn compile(pipelines: Vec<Vec<Command>>) -> VecDeque<Op> {
    let mut ops = VecDeque::new();
    let (mut pipes, mut opened, mut children) = (0, 0, 0);

    for pipeline in pipelines {
        let count = pipeline.len();
        let first_child = children;
        let mut previous: Option<usize> = None;

        for (index, command) in pipeline.into_iter().enumerate() {
            let next = (index + 1 < count).then(|| {
                ops.push_back(Op::Pipe);
                pipes += 1;
                pipes - 1
            });
            let stdin = match (command.input, previous) {
                (Some(path), _) => {
                    ops.push_back(Op::Open { path, write: false });
                    opened += 1;
                    Slot::Opened(opened - 1)
                }
                (None, Some(pipe)) => Slot::PipeRead(pipe),
                (None, None) => Slot::Fixed(Fd::STDIN),
            };
            let stdout = match (command.output, next) {
                (Some(path), _) => {
                    ops.push_back(Op::Open { path, write: true });
                    opened += 1;
                    Slot::Opened(opened - 1)
                }
                (None, Some(pipe)) => Slot::PipeWrite(pipe),
                (None, None) => Slot::Fixed(Fd::STDOUT),
            };
            ops.push_back(Op::Spawn {
                argv: command.argv,
                stdin,
                stdout,
            });
            children += 1;

            // The shell keeps no descriptor a child has taken over
            let mut closes: Vec<Slot> = [stdin, stdout]
                .into_iter()
                .filter(|slot| !matches!(slot, Slot::Fixed(_)))
                .collect();
            if let Some(pipe) = previous.filter(|pipe| stdin != Slot::PipeRead(*pipe)) {
                closes.push(Slot::PipeRead(pipe));
            }
            if let Some(pipe) = next.filter(|pipe| stdout != Slot::PipeWrite(*pipe)) {
                closes.push(Slot::PipeWrite(pipe));
            }
            ops.extend(closes.into_iter().map(Op::Close));
            previous = next;
        }
        ops.extend((first_child..children).map(Op::Wait));
    }
    ops
}

fn command_path(name: &str) -> String {
    if name.contains('/') {
        name.to_string()
    } else {
        format!("/usr/bin/{}", name)
    }
}

fn value_u32(values: &[Value], index: usize) -> Option<u32> {
    values
        .get(index)
        .and_then(Value::as_u64)
        .and_then(|value| u32::try_from(value).ok())
}

/// `sh -c <script>`: runs `;`-separated pipelines with `<` / `>` redirection
struct Shell {
    ops: VecDeque<Op>,
    current: Option<Op>,
    pipes: Vec<Option<(Fd, Fd)>>,
    opened: Vec<Option<Fd>>,
    children: Vec<Option<u32>>,
    status: i32,
    cwd: String,
    env: Environment,
}

impl Shell {
    fn new() -> Self {
        Self {
            ops: VecDeque::new(),
            current: None,
            pipes: Vec::new(),
            opened: Vec::new(),
            children: Vec::new(),
            status: 0,
            cwd: "/".to_string(),
            env: Environment::new(),
        }
    }

    fn resolve(&self, slot: Slot) -> Option<Fd> {
        match slot {
            Slot::Fixed(fd) => Some(fd),
            Slot::PipeRead(index) => self.pipes.get(index).copied().flatten().map(|(r, _)| r),
            Slot::PipeWrite(index) => self.pipes.get(index).copied().flatten().map(|(_, w)| w),
            Slot::Opened(index) => self.opened.get(index).copied().flatten(),
        }
    }

    fn request_for(&mut self, op: &Op) -> Option<SyscallRequest> {
        match op {
            Op::Pipe => Some(SyscallRequest::Pipe2 { flags: 0 }),
            Op::Open { path, write } => Some(SyscallRequest::Open {
                path: path.clone(),
                flags: if *write {
                    OpenFlags::write_truncate()
                } else {
                    OpenFlags::read_only()
                },
                mode: 0o666,
            }),
            Op::Spawn {
                argv,
                stdin,
                stdout,
            } => match (self.resolve(*stdin), self.resolve(*stdout)) {
                (Some(stdin), Some(stdout)) => Some(SyscallRequest::Spawn {
                    cwd: self.cwd.clone(),
                    path: command_path(&argv[0]),
                    args: argv.clone(),
                    env: self.env.clone(),
                    files: vec![stdin, stdout, Fd::STDERR],
                }),
                _ => {
                    self.children.push(None);
                    self.status = 1;
                    None
                }
            },
            Op::Close(slot) => self.resolve(*slot).map(|fd| SyscallRequest::Close { fd }),
            Op::Wait(index) => self
                .children
                .get(*index)
                .copied()
                .flatten()
                .map(|pid| SyscallRequest::Wait4 {
                    pid: i64::from(pid),
                    options: 0,
                }),
            Op::Report(message) => Some(SyscallRequest::Write {
                fd: Fd::STDERR,
                data: message.clone().into_bytes(),
            }),
        }
    }

    fn advance(&mut self) -> SyscallRequest {
        while let Some(op) = self.ops.pop_front() {
            if let Some(request) = self.request_for(&op) {
                self.current = Some(op);
                return request;
            }
        }
        SyscallRequest::Exit { code: self.status }
    }
}

impl Program for Shell {
    fn start(&mut self, init: &InitMessage) -> Option<SyscallRequest> {
        self.cwd = init.cwd.clone();
        self.env = init.env.clone();

        let script = match init.args.get(1..) {
            Some([flag, script, ..]) if flag == "-c" => script.clone(),
            _ => {
                self.status = 2;
                self.ops.push_back(Op::Report("usage: sh -c <command>\n".to_string()));
                return Some(self.advance());
            }
        };
        match parse_script(&script) {
            Ok(pipelines) => self.ops = compile(pipelines),
            Err(reason) => {
                self.status = 2;
                self.ops.push_back(Op::Report(format!("sh: {}\n", reason)));
            }
        }
        Some(self.advance())
    }

    fn resume(&mut self, result: Result<&[Value], Errno>) -> Option<SyscallRequest> {
        let op = self.current.take()?;
        match (op, result) {
            (Op::Pipe, Ok(values)) => {
                let ends = value_u32(values, 0).zip(value_u32(values, 1));
                self.pipes
                    .push(ends.map(|(r, w)| (Fd::new(r), Fd::new(w))));
            }
            (Op::Pipe, Err(_)) => {
                self.pipes.push(None);
                self.status = 1;
            }
            (Op::Open { .. }, Ok(values)) => {
                self.opened.push(value_u32(values, 0).map(Fd::new));
            }
            (Op::Open { path, .. }, Err(errno)) => {
                self.opened.push(None);
                self.status = 1;
                self.ops.push_front(Op::Report(format!("sh: {}: {}\n", path, errno)));
            }
            (Op::Spawn { .. }, Ok(values)) => self.children.push(value_u32(values, 0)),
            (Op::Spawn { argv, .. }, Err(_)) => {
                self.children.push(None);
                self.status = 127;
                self.ops
                    .push_front(Op::Report(format!("sh: {}: not found\n", argv[0])));
            }
            (Op::Wait(_), Ok(values)) => {
                if let Some(code) = values.get(1).and_then(Value::as_i64) {
                    self.status = code as i32;
                }
            }
            _ => {}
        }
        Some(self.advance())
    }
}

// ---------------------------------------------------------------------------
// Loaders
// ---------------------------------------------------------------------------

/// Creates a fresh program instance per load
pub type ProgramFactory = Rc<dyn Fn() -> Box<dyn Program>>;

/// Loads programs by base name from a registry of factories
///
/// Comes with `echo`, `cat`, `true`, `false` and `sh`.
#[derive(Clone)]
pub struct BuiltinLoader {
    programs: BTreeMap<String, ProgramFactory>,
}

impl BuiltinLoader {
    pub fn new() -> Self {
        let loader = Self {
            programs: BTreeMap::new(),
        };
        loader
            .with_program("echo", || Box::new(Echo))
            .with_program("cat", || Box::new(Cat::new()))
            .with_program("true", || Box::new(ExitWith(0)))
            .with_program("false", || Box::new(ExitWith(1)))
            .with_program("sh", || Box::new(Shell::new()))
    }

    pub fn with_program(
        mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn Program> + 'static,
    ) -> Self {
        self.programs.insert(name.into(), Rc::new(factory));
        self
    }

    /// Registers a [`Script`] under `name`; every instance logs to the
    /// returned log
    pub fn with_script(self, name: impl Into<String>, requests: Vec<SyscallRequest>) -> (Self, ScriptLog) {
        let log = ScriptLog::default();
        let shared = Rc::clone(&log);
        let loader = self.with_program(name, move || {
            Box::new(Script::new(requests.clone(), Rc::clone(&shared)))
        });
        (loader, log)
    }

    pub fn has_program(&self, name: &str) -> bool {
        self.programs.contains_key(name)
    }
}

impl Default for BuiltinLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramLoader for BuiltinLoader {
    fn load(&self, spec: &TaskSpec, port: WorkerPort) -> Result<Box<dyn Worker>, KernelError> {
        let name = base_name(&spec.exe_path);
        let factory = self
            .programs
            .get(name)
            .ok_or_else(|| KernelError::SpawnFailed(format!("{}: not found", spec.exe_path)))?;
        Ok(Box::new(ScriptWorker::new(factory(), port)))
    }
}

/// What a recording worker has seen
#[derive(Debug)]
pub struct Probe {
    pub port: WorkerPort,
    pub messages: Vec<WorkerMessage>,
    pub terminated: bool,
}

#[derive(Debug, Default)]
struct RecordingState {
    probes: BTreeMap<Pid, Probe>,
    started: Vec<Pid>,
}

/// Loader whose workers only record; tests speak the protocol by hand
#[derive(Debug, Clone, Default)]
pub struct RecordingLoader {
    state: Rc<RefCell<RecordingState>>,
}

impl RecordingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything posted to `pid`'s worker, in order
    pub fn messages(&self, pid: Pid) -> Vec<WorkerMessage> {
        self.state
            .borrow()
            .probes
            .get(&pid)
            .map(|probe| probe.messages.clone())
            .unwrap_or_default()
    }

    /// Completions delivered to `pid`'s worker, in order
    pub fn completions(&self, pid: Pid) -> Vec<SyscallMessage> {
        self.messages(pid)
            .iter()
            .filter_map(WorkerMessage::as_completion)
            .cloned()
            .collect()
    }

    pub fn is_terminated(&self, pid: Pid) -> bool {
        self.state
            .borrow()
            .probes
            .get(&pid)
            .map_or(false, |probe| probe.terminated)
    }

    /// Pids in the order their workers received `Init`
    pub fn start_order(&self) -> Vec<Pid> {
        self.state.borrow().started.clone()
    }

    /// Posts a raw message as `pid`'s worker; false if unknown or closed
    pub fn post(&self, pid: Pid, raw: Value) -> bool {
        let port = self
            .state
            .borrow()
            .probes
            .get(&pid)
            .map(|probe| probe.port.clone());
        port.map_or(false, |port| port.post(raw).is_ok())
    }

    /// Posts a typed request with id `id` as `pid`'s worker
    pub fn request(&self, pid: Pid, id: u64, request: SyscallRequest) -> bool {
        self.post(pid, request.into_message(SyscallId::new(id)).to_value())
    }
}

impl ProgramLoader for RecordingLoader {
    fn load(&self, _spec: &TaskSpec, port: WorkerPort) -> Result<Box<dyn Worker>, KernelError> {
        let pid = port.pid();
        self.state.borrow_mut().probes.insert(
            pid,
            Probe {
                port,
                messages: Vec::new(),
                terminated: false,
            },
        );
        Ok(Box::new(RecordingWorker {
            pid,
            state: Rc::clone(&self.state),
        }))
    }
}

struct RecordingWorker {
    pid: Pid,
    state: Rc<RefCell<RecordingState>>,
}

impl Worker for RecordingWorker {
    fn post_message(&mut self, message: WorkerMessage) {
        let mut state = self.state.borrow_mut();
        if matches!(message, WorkerMessage::Init(_)) {
            state.started.push(self.pid);
        }
        if let Some(probe) = state.probes.get_mut(&self.pid) {
            if !probe.terminated {
                probe.messages.push(message);
            }
        }
    }

    fn terminate(&mut self) {
        if let Some(probe) = self.state.borrow_mut().probes.get_mut(&self.pid) {
            probe.terminated = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(argv: &[&str]) -> Vec<String> {
        argv.iter().map(|word| word.to_string()).collect()
    }

    #[test]
    fn test_tokenize_metacharacters_without_spaces() {
        let tokens = tokenize("echo 'a b'|cat>out").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Word("echo".to_string()),
                Token::Word("a b".to_string()),
                Token::Pipe,
                Token::Word("cat".to_string()),
                Token::Output,
                Token::Word("out".to_string()),
            ]
        );
        assert!(tokenize("echo 'oops").is_err());
    }

    #[test]
    fn test_parse_script() {
        let pipelines = parse_script("echo hi | cat > /tmp/x; cat < /tmp/x").unwrap();
        assert_eq!(pipelines.len(), 2);
        assert_eq!(pipelines[0].len(), 2);
        assert_eq!(pipelines[0][0].argv, words(&["echo", "hi"]));
        assert_eq!(pipelines[0][1].output.as_deref(), Some("/tmp/x"));
        assert_eq!(pipelines[1][0].input.as_deref(), Some("/tmp/x"));

        assert!(parse_script("echo |").is_err());
        assert!(parse_script("cat >").is_err());
        assert!(parse_script("| cat").is_err());
        assert_eq!(parse_script(";;").unwrap(), Vec::<Vec<Command>>::new());
    }

    #[test]
    fn test_compile_pipeline_closes_shell_copies() {
        let ops = compile(parse_script("a | b").unwrap());
        assert_eq!(
            ops.into_iter().collect::<Vec<_>>(),
            vec![
                Op::Pipe,
                Op::Spawn {
                    argv: words(&["a"]),
                    stdin: Slot::Fixed(Fd::STDIN),
                    stdout: Slot::PipeWrite(0),
                },
                Op::Close(Slot::PipeWrite(0)),
                Op::Spawn {
                    argv: words(&["b"]),
                    stdin: Slot::PipeRead(0),
                    stdout: Slot::Fixed(Fd::STDOUT),
                },
                Op::Close(Slot::PipeRead(0)),
                Op::Wait(0),
                Op::Wait(1),
            ]
        );
    }

    #[test]
    fn test_memfs_open_modes() {
        let fs = MemFs::new().with_file("/etc/motd", "hello");
        assert!(fs.exists("/etc"));

        let err = fs
            .open("/missing", OpenFlags::read_only(), 0)
            .err()
            .map(|e| e.errno);
        assert_eq!(err, Some(Errno::ENOENT));

        let file = fs.open("/tmp/new", OpenFlags::write_truncate(), 0o644).unwrap();
        file.write(b"abc", Box::new(|r| assert_eq!(r.unwrap(), 3)));
        assert_eq!(fs.read_file("/tmp/new"), Some(b"abc".to_vec()));

        let excl = OpenFlags::from_bits(OpenFlags::O_WRONLY | OpenFlags::O_CREAT | OpenFlags::O_EXCL);
        assert_eq!(
            fs.open("/tmp/new", excl, 0).err().map(|e| e.errno),
            Some(Errno::EEXIST)
        );
        assert_eq!(
            fs.open("/tmp", OpenFlags::write_truncate(), 0).err().map(|e| e.errno),
            Some(Errno::EISDIR)
        );
    }

    #[test]
    fn test_memfile_reads_advance_offset() {
        let fs = MemFs::new().with_file("/f", "abcdef");
        let file = fs.open("/f", OpenFlags::read_only(), 0).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));

        for position in [None, None, Some(1), None] {
            let sink = Rc::clone(&seen);
            file.read(
                2,
                position,
                Box::new(move |r| sink.borrow_mut().push(r.unwrap())),
            );
        }
        assert_eq!(
            *seen.borrow(),
            vec![b"ab".to_vec(), b"cd".to_vec(), b"bc".to_vec(), b"ef".to_vec()]
        );
        file.write(b"x", Box::new(|r| assert_eq!(r.unwrap_err().errno, Errno::EBADF)));
    }

    #[test]
    fn test_memfs_readdir() {
        let fs = MemFs::new().with_file("/usr/bin/echo", "");
        let dir = fs.open("/usr", OpenFlags::read_only(), 0).unwrap();
        dir.readdir(Box::new(|r| assert_eq!(r.unwrap(), vec!["bin".to_string()])));
        assert!(fs.stat("/usr/bin").unwrap().is_dir());
        assert_eq!(fs.stat("/usr/bin/echo").unwrap().kind, FileKind::Regular);
    }

    #[test]
    fn test_builtin_loader_rejects_unknown_program() {
        let loader = BuiltinLoader::new();
        assert!(loader.has_program("sh"));
        let (port, _inbox) = ipc::inbox();
        let result = loader.load(&TaskSpec::new("/usr/bin/nope"), port.worker_port(Pid::first()));
        assert!(matches!(result, Err(KernelError::SpawnFailed(_))));
    }
}
