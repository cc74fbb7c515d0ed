//! Scripted executor for stage tests.

use async_trait::async_trait;
use std::sync::Mutex;

use super::{CommandOutput, ExecError, ExecOptions, RemoteExecutor};

struct Rule {
    needle: String,
    output: CommandOutput,
    /// Remaining uses; `None` means unlimited.
    remaining: Option<usize>,
}

/// Answers commands by the first rule whose needle is a substring of the command.
/// Unmatched commands succeed with empty stdout.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<(String, ExecOptions)>>,
    closed: Mutex<usize>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, needle: &str, stdout: &str) -> Self {
        self.push(needle, stdout, 0, None)
    }

    pub fn fail(self, needle: &str, exit_code: i32) -> Self {
        self.push(needle, "", exit_code, None)
    }

    /// Like [`on`](Self::on) but only answers once; later matches fall through.
    pub fn once(self, needle: &str, stdout: &str) -> Self {
        self.push(needle, stdout, 0, Some(1))
    }

    fn push(self, needle: &str, stdout: &str, exit_code: i32, remaining: Option<usize>) -> Self {
        self.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            output: CommandOutput {
                stdout: stdout.to_string(),
                exit_code,
            },
            remaining,
        });
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn calls(&self) -> Vec<(String, ExecOptions)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.commands().iter().any(|c| c.contains(needle))
    }

    /// How many times [`close`](RemoteExecutor::close) was called.
    pub fn closed(&self) -> usize {
        *self.closed.lock().unwrap()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn execute(&self, command: &str, opts: &ExecOptions) -> Result<CommandOutput, ExecError> {
        self.calls
            .lock()
            .unwrap()
            .push((command.to_string(), opts.clone()));

        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if !command.contains(&rule.needle) || rule.remaining == Some(0) {
                continue;
            }
            if let Some(n) = rule.remaining.as_mut() {
                *n -= 1;
            }
            return Ok(rule.output.clone());
        }

        Ok(CommandOutput::default())
    }

    async fn close(&self) -> Result<(), ExecError> {
        *self.closed.lock().unwrap() += 1;
        Ok(())
    }
}
