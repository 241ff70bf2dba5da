//! Command line resolution

use crate::ProcessManagerError;
use serde::{Deserialize, Serialize};

/// Shell used for command lines with pipes, lists or redirections
pub const SHELL_PATH: &str = "/usr/bin/sh";

/// Directory bare program names resolve into
pub const BIN_DIR: &str = "/usr/bin";

const METACHARACTERS: [char; 5] = ['|', '&', ';', '<', '>'];

/// A resolved command: what to load and the argv it sees
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLine {
    pub exe_path: String,
    pub args: Vec<String>,
}

impl CommandLine {
    /// Runs `script` through the shell
    pub fn shell(script: &str) -> Self {
        Self {
            exe_path: SHELL_PATH.to_string(),
            args: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        }
    }

    /// True when the command goes through the shell
    pub fn is_shell(&self) -> bool {
        self.exe_path == SHELL_PATH && self.args.get(1).map(String::as_str) == Some("-c")
    }
}

/// Resolves a command line
///
/// Anything containing a shell metacharacter runs as `sh -c <cmd>`.
/// Otherwise the line is split on whitespace and a bare program name is
/// looked up in [`BIN_DIR`]; `args[0]` keeps the name as written.
pub fn resolve_command(cmd: &str) -> Result<CommandLine, ProcessManagerError> {
    let cmd = cmd.trim();
    if cmd.is_empty() {
        return Err(ProcessManagerError::EmptyCommand);
    }
    if cmd.contains(METACHARACTERS) {
        return Ok(CommandLine::shell(cmd));
    }

    let args: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
    let name = &args[0];
    let exe_path = if name.contains('/') {
        name.clone()
    } else {
        format!("{}/{}", BIN_DIR, name)
    };
    Ok(CommandLine { exe_path, args })
}
