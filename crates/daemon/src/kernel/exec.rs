//! Thin wrapper around `std::process::Command` for the system tools

use netplane_common::{Error, Result};
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::trace;

/// Captured result of a finished tool invocation
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A system binary invoked by path or name
#[derive(Debug, Clone)]
pub struct Tool {
    program: String,
}

impl Tool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.program, args.join(" "))
    }

    /// Run the tool and return its output whatever the exit status.
    /// Only a failure to spawn is an error.
    pub fn run(&self, args: &[&str]) -> Result<ToolOutput> {
        self.run_with_stdin(args, None)
    }

    /// Run the tool, feeding `input` on stdin when given
    pub fn run_with_stdin(&self, args: &[&str], input: Option<&str>) -> Result<ToolOutput> {
        trace!("exec: {}", self.describe(args));

        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command
            .spawn()
            .map_err(|e| Error::external(self.describe(args), format!("failed to spawn: {}", e)))?;

        if let Some(input) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes())?;
            }
        }

        let output = child.wait_with_output()?;
        Ok(ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run the tool and fail with `ExternalState` on a non-zero exit
    pub fn run_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;
        self.check(args, output)
    }

    pub fn run_checked_with_stdin(&self, args: &[&str], input: &str) -> Result<String> {
        let output = self.run_with_stdin(args, Some(input))?;
        self.check(args, output)
    }

    fn check(&self, args: &[&str], output: ToolOutput) -> Result<String> {
        if !output.success() {
            return Err(Error::external(
                self.describe(args),
                match output.code {
                    Some(code) => format!("exit status {}: {}", code, output.stderr),
                    None => format!("terminated by signal: {}", output.stderr),
                },
            ));
        }
        Ok(output.stdout)
    }
}
