//! External tool execution.
//!
//! Every stage of the pipeline shells out to a system tool. Stages never build
//! shell syntax themselves (except the two documented pipelines run through
//! `bash -c`); they describe a [`ToolCommand`] and hand it to a
//! [`CommandRunner`], which makes the stages testable without root or real
//! block devices.

use std::{
    ffi::OsStr,
    fmt,
    io::Write,
    path::PathBuf,
    process::{Command, Stdio},
};

use crate::{error::BuildError, utils::StdioUtils};

#[cfg(test)]
pub mod mock;

/// External tools the pipeline may call, by logical name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Bash,
    Chroot,
    Cp,
    Dd,
    Extlinux,
    Genisoimage,
    Kpartx,
    Lsmod,
    Mkfs,
    Mksquashfs,
    Modprobe,
    Mount,
    QemuImg,
    QemuNbd,
    Sfdisk,
    Umount,
}

impl Tool {
    pub const ALL: [Tool; 16] = [
        Tool::Bash,
        Tool::Chroot,
        Tool::Cp,
        Tool::Dd,
        Tool::Extlinux,
        Tool::Genisoimage,
        Tool::Kpartx,
        Tool::Lsmod,
        Tool::Mkfs,
        Tool::Mksquashfs,
        Tool::Modprobe,
        Tool::Mount,
        Tool::QemuImg,
        Tool::QemuNbd,
        Tool::Sfdisk,
        Tool::Umount,
    ];

    /// Executable looked up on `PATH`
    pub fn binary(&self) -> &'static str {
        match self {
            Tool::Bash => "bash",
            Tool::Chroot => "chroot",
            Tool::Cp => "cp",
            Tool::Dd => "dd",
            Tool::Extlinux => "extlinux",
            Tool::Genisoimage => "genisoimage",
            Tool::Kpartx => "kpartx",
            Tool::Lsmod => "lsmod",
            Tool::Mkfs => "mkfs",
            Tool::Mksquashfs => "mksquashfs",
            Tool::Modprobe => "modprobe",
            Tool::Mount => "mount",
            Tool::QemuImg => "qemu-img",
            Tool::QemuNbd => "qemu-nbd",
            Tool::Sfdisk => "sfdisk",
            Tool::Umount => "umount",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

/// An invocation of one external tool: argument vector plus optional stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    tool: Tool,
    args: Vec<String>,
    stdin: Option<String>,
}

impl ToolCommand {
    pub fn new(tool: Tool) -> Self {
        ToolCommand {
            tool,
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    /// Data written to the tool's standard input
    pub fn stdin(&mut self, input: impl Into<String>) -> &mut Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn tool(&self) -> Tool {
        self.tool
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tool)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Exit status and captured output of a finished tool
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Short description of a failure: exit status plus the tail of stderr
    pub fn failure_reason(&self) -> String {
        let status = match self.code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        };
        let tail = StdioUtils::tail_n_str(StdioUtils::stderr_to_lines(self.stderr.as_bytes()), 5);
        if tail.trim().is_empty() {
            status
        } else {
            format!("{}, stderr: {}", status, tail.trim_end())
        }
    }
}

/// Resolves and runs external tools.
pub trait CommandRunner: Send + Sync {
    /// Resolve the tool's executable. A missing executable is an
    /// [`BuildError::Environment`] error.
    fn locate(&self, tool: Tool) -> Result<PathBuf, BuildError>;

    /// Run the command to completion. A non-zero exit is not an error here;
    /// callers decide what it means through [`run_checked`].
    fn run(&self, cmd: &ToolCommand) -> Result<CommandOutput, BuildError>;
}

/// Runs tools found on `PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn locate(&self, tool: Tool) -> Result<PathBuf, BuildError> {
        which::which(tool.binary()).map_err(|e| {
            BuildError::Environment(format!("{} not found in PATH: {}", tool.binary(), e))
        })
    }

    fn run(&self, cmd: &ToolCommand) -> Result<CommandOutput, BuildError> {
        let program = self.locate(cmd.tool())?;
        log::debug!("Running: {}", cmd);

        let mut command = Command::new(&program);
        command
            .args(cmd.get_args())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if cmd.get_stdin().is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        let mut child = command
            .spawn()
            .map_err(|e| BuildError::io(format!("Failed to spawn {}", program.display()), e))?;

        if let Some(input) = cmd.get_stdin() {
            // stdin is dropped at the end of this block so the child sees EOF
            let mut stdin = child.stdin.take().ok_or_else(|| {
                BuildError::ToolFailed {
                    tool: cmd.tool().to_string(),
                    reason: "stdin not available".to_string(),
                }
            })?;
            stdin
                .write_all(input.as_bytes())
                .map_err(|e| BuildError::io(format!("Failed to write stdin of {}", cmd.tool()), e))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| BuildError::io(format!("Failed to wait for {}", cmd.tool()), e))?;

        let output = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        log::trace!("{} finished: {:?}", cmd.tool(), output.code);
        Ok(output)
    }
}

/// Run a command and turn a non-zero exit into the error built by `on_fail`.
pub fn run_checked<F>(
    runner: &dyn CommandRunner,
    cmd: &ToolCommand,
    on_fail: F,
) -> Result<CommandOutput, BuildError>
where
    F: FnOnce(String) -> BuildError,
{
    let output = runner.run(cmd)?;
    if output.success() {
        Ok(output)
    } else {
        log::error!("Command failed: {} ({})", cmd, output.failure_reason());
        Err(on_fail(output.failure_reason()))
    }
}

/// Check that every tool is resolvable before any stage starts.
pub fn ensure_tools(runner: &dyn CommandRunner, tools: &[Tool]) -> Result<(), BuildError> {
    let missing: Vec<&str> = tools
        .iter()
        .filter(|tool| runner.locate(**tool).is_err())
        .map(|tool| tool.binary())
        .collect();

    if missing.is_empty() {
        return Ok(());
    }
    Err(BuildError::Environment(format!(
        "missing required tools: {}",
        missing.join(", ")
    )))
}

/// Location of every known tool, `None` for the ones not found.
pub fn tool_report(runner: &dyn CommandRunner) -> Vec<(Tool, Option<PathBuf>)> {
    Tool::ALL
        .iter()
        .map(|tool| (*tool, runner.locate(*tool).ok()))
        .collect()
}
