//! Test doubles shared by the collector tests

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sitrep_exec::{CommandResult, CommandRunner, ExecError};

/// Write `content` below `root`, creating parent directories
pub fn write_file(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

/// Command runner returning canned output
///
/// Responses are matched on the full command line first, then on the program
/// name. Unmatched programs are reported as not installed.
#[derive(Default)]
pub struct StubRunner {
    responses: HashMap<String, CommandResult>,
    calls: Mutex<Vec<String>>,
}

impl StubRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(self, command: &str, stdout: &str) -> Self {
        self.with_result(command, 0, stdout, "")
    }

    pub fn with_failure(self, command: &str, status: i32, stderr: &str) -> Self {
        self.with_result(command, status, "", stderr)
    }

    fn with_result(mut self, command: &str, status: i32, stdout: &str, stderr: &str) -> Self {
        self.responses.insert(
            command.to_string(),
            CommandResult {
                status,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                duration: Duration::from_millis(1),
            },
        );
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for StubRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandResult, ExecError> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().unwrap().push(line.clone());
        self.responses
            .get(&line)
            .or_else(|| self.responses.get(program))
            .cloned()
            .ok_or_else(|| ExecError::NotFound(program.to_string()))
    }

    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        _timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        self.run(program, args).await
    }
}
