//! Exec — the external command seam.
//!
//! The provisioners shell out to mount(8), mkfs, ip(8), iptables(8),
//! and the CNI plugin. Those calls go through this trait so the logic
//! around them can be unit-tested with a scripted fake instead of
//! requiring root and real kernel state.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{AgentError, AgentResult};

/// An external command invocation.
#[derive(Debug, Clone, Default)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// The command line as a single string, for logs and errors.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Command execution contract.
#[async_trait]
pub trait Exec: Send + Sync {
    async fn run(&self, cmd: &Cmd) -> AgentResult<ExecOutput>;

    /// Run a command and turn a non-zero exit into `CommandFailed`.
    async fn run_checked(&self, cmd: &Cmd) -> AgentResult<ExecOutput> {
        let output = self.run(cmd).await?;
        if output.success {
            Ok(output)
        } else {
            Err(AgentError::CommandFailed {
                command: cmd.display(),
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Executes commands on the host via `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct SystemExec;

#[async_trait]
impl Exec for SystemExec {
    async fn run(&self, cmd: &Cmd) -> AgentResult<ExecOutput> {
        debug!(command = %cmd.display(), "exec");

        let mut command = tokio::process::Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &cmd.env {
            command.env(key, value);
        }
        if cmd.stdin.is_some() {
            command.stdin(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|e| AgentError::Spawn {
            command: cmd.display(),
            source: e,
        })?;

        if let Some(input) = &cmd.stdin
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| AgentError::Spawn {
                    command: cmd.display(),
                    source: e,
                })?;
            drop(stdin);
        }

        let output = child.wait_with_output().await.map_err(|e| AgentError::Spawn {
            command: cmd.display(),
            source: e,
        })?;

        Ok(ExecOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
pub mod scripted {
    //! Scripted command fake for provisioner tests.

    use std::sync::Mutex;

    use super::*;

    /// A rule matched against the rendered command line.
    struct Rule {
        pattern: String,
        output: ExecOutput,
    }

    /// Records every invocation; responds per substring-matched rules,
    /// succeeding with empty output by default.
    #[derive(Default)]
    pub struct ScriptedExec {
        rules: Mutex<Vec<Rule>>,
        invocations: Mutex<Vec<Cmd>>,
    }

    impl ScriptedExec {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail any command whose line contains `pattern`.
        pub fn fail_when(&self, pattern: &str, stderr: &str) {
            self.rules.lock().unwrap().push(Rule {
                pattern: pattern.to_string(),
                output: ExecOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                },
            });
        }

        /// Respond to any command whose line contains `pattern` with stdout.
        pub fn respond_when(&self, pattern: &str, stdout: &str) {
            self.rules.lock().unwrap().push(Rule {
                pattern: pattern.to_string(),
                output: ExecOutput {
                    success: true,
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                },
            });
        }

        /// Every command line run so far, in order.
        pub fn invocations(&self) -> Vec<String> {
            self.commands().iter().map(Cmd::display).collect()
        }

        /// Every full command (args, env, stdin) run so far, in order.
        pub fn commands(&self) -> Vec<Cmd> {
            self.invocations.lock().unwrap().clone()
        }

        /// Whether some invocation contains `pattern`.
        pub fn ran(&self, pattern: &str) -> bool {
            self.invocations().iter().any(|line| line.contains(pattern))
        }
    }

    #[async_trait]
    impl Exec for ScriptedExec {
        async fn run(&self, cmd: &Cmd) -> AgentResult<ExecOutput> {
            let line = cmd.display();
            self.invocations.lock().unwrap().push(cmd.clone());
            let rules = self.rules.lock().unwrap();
            for rule in rules.iter() {
                if line.contains(&rule.pattern) {
                    return Ok(rule.output.clone());
                }
            }
            Ok(ExecOutput {
                success: true,
                ..ExecOutput::default()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::ScriptedExec;
    use super::*;

    #[test]
    fn cmd_builder_renders_display_line() {
        let cmd = Cmd::new("mount")
            .arg("-o")
            .arg("loop")
            .args(["/img", "/mnt"])
            .env("LANG", "C");
        assert_eq!(cmd.display(), "mount -o loop /img /mnt");
        assert_eq!(cmd.env, vec![("LANG".to_string(), "C".to_string())]);
    }

    #[tokio::test]
    async fn run_checked_surfaces_failures() {
        let exec = ScriptedExec::new();
        exec.fail_when("mkfs", "device busy");

        let err = exec
            .run_checked(&Cmd::new("mkfs.ext4").arg("/img"))
            .await
            .unwrap_err();
        match err {
            AgentError::CommandFailed { command, stderr } => {
                assert!(command.contains("mkfs.ext4"));
                assert_eq!(stderr, "device busy");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn system_exec_captures_output() {
        let exec = SystemExec;
        let output = exec.run(&Cmd::new("echo").arg("hello")).await.unwrap();
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn system_exec_pipes_stdin() {
        let exec = SystemExec;
        let output = exec.run(&Cmd::new("cat").stdin("ping")).await.unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "ping");
    }
}
