//! External process execution
//!
//! Every PKI and WireGuard tool is invoked through [`CommandRunner`] as an
//! argv array, never through a shell. A non-zero exit status becomes
//! [`ProvisionError::CommandFailed`] and callers abort the containing step
//! with `?`.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ProvisionError, ProvisionResult};

/// Description of a single process invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Data piped to the child's stdin
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Extra variable layered over the inherited environment
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn input(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured output of a successful invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn new(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Seam between the protocol managers and the operating system
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion; non-zero exit is an error
    async fn run(&self, spec: &CommandSpec) -> ProvisionResult<CommandOutput>;
}

/// Runs commands as real child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> ProvisionResult<CommandOutput> {
        debug!("Running: {}", spec);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let mut child = cmd.spawn().map_err(|e| ProvisionError::CommandFailed {
            cmd: spec.to_string(),
            code: None,
            stderr: format!("failed to spawn: {}", e),
        })?;

        // Fed concurrently so a child filling stdout cannot stall on us
        let writer = match (&spec.stdin, child.stdin.take()) {
            (Some(input), Some(mut stdin)) => {
                let input = input.clone().into_bytes();
                Some(tokio::spawn(async move {
                    let written = stdin.write_all(&input).await;
                    // EOF for the child
                    drop(stdin);
                    written
                }))
            }
            _ => None,
        };

        let output = child.wait_with_output().await?;
        let written = match writer {
            Some(task) => task.await?,
            None => Ok(()),
        };
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            warn!(
                "Command '{}' failed with exit code {:?}: {}",
                spec,
                output.status.code(),
                stderr.trim()
            );
            return Err(ProvisionError::CommandFailed {
                cmd: spec.to_string(),
                code: output.status.code(),
                stderr,
            });
        }

        if let Err(e) = written {
            warn!("Command '{}' did not accept its input: {}", spec, e);
            return Err(ProvisionError::CommandFailed {
                cmd: spec.to_string(),
                code: output.status.code(),
                stderr: format!("failed to write stdin: {}; {}", e, stderr.trim()),
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }
}
