//! A recording [`CommandRunner`] for unit tests.

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::Mutex,
};

use super::{CommandOutput, CommandRunner, Tool, ToolCommand};
use crate::error::BuildError;

/// Default `lsmod` output: the nbd module is loaded.
pub const LSMOD_WITH_NBD: &str = "Module                  Size  Used by\nnbd                    65536  0\next4                  1003520  1\n";

/// Default `kpartx -a -v` output for a raw image with two partitions.
pub const KPARTX_ADD_OUTPUT: &str = "add map loop7p1 (253:0): 0 1024000 linear 7:7 2048\nadd map loop7p2 (253:1): 0 1019904 linear 7:7 1026048\n";

struct FailRule {
    tool: Tool,
    /// Only fail when some argument contains this text
    arg_contains: Option<String>,
    /// Only fail this many times, `None` for always
    remaining: Option<usize>,
}

/// Records every command and answers with scripted results.
///
/// Every tool succeeds with empty output unless a failure rule matches or a
/// response was set. `lsmod` and `kpartx -a` have realistic default output.
pub struct RecordingRunner {
    calls: Mutex<Vec<ToolCommand>>,
    fail_rules: Mutex<Vec<FailRule>>,
    responses: Mutex<Vec<(Tool, String)>>,
    missing: Mutex<HashSet<Tool>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        RecordingRunner {
            calls: Mutex::new(Vec::new()),
            fail_rules: Mutex::new(Vec::new()),
            responses: Mutex::new(vec![
                (Tool::Lsmod, LSMOD_WITH_NBD.to_string()),
                (Tool::Kpartx, KPARTX_ADD_OUTPUT.to_string()),
            ]),
            missing: Mutex::new(HashSet::new()),
        }
    }

    /// Make every invocation of `tool` (optionally only those with an
    /// argument containing `arg_contains`) exit with status 1.
    pub fn fail_when(&self, tool: Tool, arg_contains: Option<&str>) {
        self.fail_rules.lock().unwrap().push(FailRule {
            tool,
            arg_contains: arg_contains.map(|s| s.to_string()),
            remaining: None,
        });
    }

    /// Like [`fail_when`](Self::fail_when) but only for the first matching call.
    pub fn fail_once(&self, tool: Tool, arg_contains: Option<&str>) {
        self.fail_rules.lock().unwrap().push(FailRule {
            tool,
            arg_contains: arg_contains.map(|s| s.to_string()),
            remaining: Some(1),
        });
    }

    /// Replace the stdout returned for `tool`
    pub fn respond(&self, tool: Tool, stdout: &str) {
        let mut responses = self.responses.lock().unwrap();
        responses.retain(|(t, _)| *t != tool);
        responses.push((tool, stdout.to_string()));
    }

    pub fn set_missing(&self, tool: Tool) {
        self.missing.lock().unwrap().insert(tool);
    }

    pub fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, tool: Tool) -> usize {
        self.calls().iter().filter(|c| c.tool() == tool).count()
    }

    /// Number of calls of `tool` whose first argument is `first_arg`
    pub fn count_with(&self, tool: Tool, first_arg: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.tool() == tool && c.get_args().first().map(String::as_str) == Some(first_arg))
            .count()
    }

    /// Tools in call order
    pub fn tools(&self) -> Vec<Tool> {
        self.calls().iter().map(|c| c.tool()).collect()
    }

    fn should_fail(&self, cmd: &ToolCommand) -> bool {
        let mut rules = self.fail_rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if rule.tool != cmd.tool() {
                continue;
            }
            let arg_matches = match &rule.arg_contains {
                Some(text) => cmd.get_args().iter().any(|a| a.contains(text.as_str())),
                None => true,
            };
            if !arg_matches {
                continue;
            }
            match rule.remaining.as_mut() {
                Some(0) => continue,
                Some(n) => {
                    *n -= 1;
                    return true;
                }
                None => return true,
            }
        }
        false
    }
}

impl CommandRunner for RecordingRunner {
    fn locate(&self, tool: Tool) -> Result<PathBuf, BuildError> {
        if self.missing.lock().unwrap().contains(&tool) {
            return Err(BuildError::Environment(format!(
                "{} not found in PATH",
                tool.binary()
            )));
        }
        Ok(PathBuf::from("/usr/bin").join(tool.binary()))
    }

    fn run(&self, cmd: &ToolCommand) -> Result<CommandOutput, BuildError> {
        self.locate(cmd.tool())?;
        self.calls.lock().unwrap().push(cmd.clone());

        if self.should_fail(cmd) {
            return Ok(CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: format!("{}: injected failure", cmd.tool()),
            });
        }

        let stdout = self
            .responses
            .lock()
            .unwrap()
            .iter()
            .find(|(tool, _)| *tool == cmd.tool())
            .map(|(_, out)| out.clone())
            .unwrap_or_default();

        Ok(CommandOutput {
            code: Some(0),
            stdout,
            stderr: String::new(),
        })
    }
}
