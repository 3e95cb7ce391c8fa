//! Subprocess launcher and the running child it produces.
//!
//! POSIX exec semantics: the launcher accumulates argv, cwd, an environment
//! overlay, and a flag set, then `spawn()`s the child. `run-on-host` would,
//! in a containerized runtime, escape the container to run on the host
//! directly; this crate has no containerized-runtime abstraction to escape,
//! so the flag is accepted and reported but otherwise inert — every child
//! here already runs on the host.

use std::collections::HashMap;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::error::{Error, ExitDisposition, Result};

/// Bit flags controlling how a subprocess is spawned and wired up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubprocessFlags(u32);

impl SubprocessFlags {
    pub const NONE: SubprocessFlags = SubprocessFlags(0);
    pub const STDOUT_PIPE: SubprocessFlags = SubprocessFlags(1 << 0);
    pub const STDERR_PIPE: SubprocessFlags = SubprocessFlags(1 << 1);
    pub const STDIN_INHERIT: SubprocessFlags = SubprocessFlags(1 << 2);
    pub const STDERR_MERGE: SubprocessFlags = SubprocessFlags(1 << 3);
    pub const STDERR_SILENCE: SubprocessFlags = SubprocessFlags(1 << 4);
    pub const RUN_ON_HOST: SubprocessFlags = SubprocessFlags(1 << 5);
    pub const CLEAR_ENV: SubprocessFlags = SubprocessFlags(1 << 6);

    pub fn contains(self, other: SubprocessFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(self, other: SubprocessFlags) -> SubprocessFlags {
        SubprocessFlags(self.0 & !other.0)
    }
}

impl BitOr for SubprocessFlags {
    type Output = SubprocessFlags;
    fn bitor(self, rhs: Self) -> Self::Output {
        SubprocessFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for SubprocessFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Builder for a child-process invocation.
#[derive(Debug, Clone, Default)]
pub struct SubprocessLauncher {
    argv: Vec<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    flags: SubprocessFlags,
}

impl SubprocessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_argv(&mut self, arg: impl Into<String>) -> &mut Self {
        self.argv.push(arg.into());
        self
    }

    pub fn push_args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn set_cwd(&mut self, cwd: impl Into<PathBuf>) -> &mut Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn cwd(&self) -> Option<&PathBuf> {
        self.cwd.as_ref()
    }

    pub fn setenv(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn flags(&self) -> SubprocessFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: SubprocessFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    /// A shell-quoted rendering of the invocation, used by `StageProcess`
    /// to log what it is about to run.
    pub fn render(&self) -> String {
        let mut out = String::from("Executing ");
        if let Some(first) = self.argv.first() {
            out.push_str(first);
            for arg in &self.argv[1..] {
                out.push(' ');
                out.push_str(&shell_words::quote(arg));
            }
        }
        if let Some(cwd) = &self.cwd {
            out.push_str(" from directory '");
            out.push_str(&cwd.display().to_string());
            out.push('\'');
        }
        out
    }

    /// Spawn the child process.
    pub fn spawn(&self) -> Result<Subprocess> {
        let mut cmd = match self.argv.split_first() {
            Some((program, rest)) => {
                let mut c = Command::new(program);
                c.args(rest);
                c
            }
            None => {
                return Err(Error::Configuration(
                    "subprocess launcher has no argv[0]".to_string(),
                ));
            }
        };

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        if self.flags.contains(SubprocessFlags::CLEAR_ENV) {
            cmd.env_clear();
        }
        cmd.envs(&self.env);

        cmd.stdin(if self.flags.contains(SubprocessFlags::STDIN_INHERIT) {
            Stdio::inherit()
        } else {
            Stdio::null()
        });

        cmd.stdout(if self.flags.contains(SubprocessFlags::STDOUT_PIPE) {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        cmd.stderr(if self.flags.contains(SubprocessFlags::STDERR_SILENCE) {
            Stdio::null()
        } else if self.flags.contains(SubprocessFlags::STDERR_MERGE) {
            Stdio::piped()
        } else if self.flags.contains(SubprocessFlags::STDERR_PIPE) {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let child = cmd.spawn().map_err(Error::Spawn)?;

        Ok(Subprocess { child })
    }
}

/// A running child process.
pub struct Subprocess {
    child: Child,
}

impl Subprocess {
    /// Take the stdout pipe, if the launcher requested one. Can only be
    /// taken once.
    pub fn stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take the stderr pipe, if the launcher requested one. Can only be
    /// taken once.
    pub fn stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for the child to exit, succeeding iff it exited with status
    /// zero.
    pub async fn wait_check(mut self) -> Result<()> {
        let status = self.child.wait().await.map_err(Error::Spawn)?;

        if status.success() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Err(Error::ExitFailure(ExitDisposition::Signal(signal)));
            }
        }

        Err(Error::ExitFailure(ExitDisposition::Code(
            status.code().unwrap_or(-1),
        )))
    }

    /// Request the child be killed. Used for cancellation.
    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

/// Read an `AsyncRead` pipe line-by-line, forwarding each complete line to
/// `on_line`. Used by `Stage::log_subprocess` to tail stdout/stderr
/// independently; the two readers have no ordering relationship between
/// each other.
pub async fn read_lines<R, F>(reader: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    use tokio::io::{AsyncBufReadExt, BufReader};

    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => on_line(&line),
            Ok(None) => break,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn spawn_and_wait_check_succeeds() {
        let mut launcher = SubprocessLauncher::new();
        launcher.push_args(["true"]);
        let sub = launcher.spawn().expect("spawn");
        sub.wait_check().await.expect("exit zero");
    }

    #[tokio::test]
    async fn wait_check_fails_on_nonzero_exit() {
        let mut launcher = SubprocessLauncher::new();
        launcher.push_args(["sh", "-c", "exit 2"]);
        let sub = launcher.spawn().expect("spawn");
        let err = sub.wait_check().await.unwrap_err();
        assert!(matches!(
            err,
            Error::ExitFailure(ExitDisposition::Code(2))
        ));
    }

    #[tokio::test]
    async fn stdout_lines_are_read_in_order() {
        let mut launcher = SubprocessLauncher::new();
        launcher.push_args(["sh", "-c", "echo one; echo two"]);
        launcher.set_flags(SubprocessFlags::STDOUT_PIPE);
        let mut sub = launcher.spawn().expect("spawn");
        let stdout = sub.stdout().expect("stdout piped");

        let lines = Arc::new(Mutex::new(Vec::new()));
        let collected = lines.clone();
        read_lines(stdout, |line| collected.lock().unwrap().push(line.to_string())).await;

        sub.wait_check().await.expect("exit zero");
        assert_eq!(*lines.lock().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn render_quotes_arguments() {
        let mut launcher = SubprocessLauncher::new();
        launcher.push_args(["configure", "--with spaces"]);
        launcher.set_cwd("/tmp/build");
        let rendered = launcher.render();
        assert!(rendered.starts_with("Executing configure "));
        assert!(rendered.contains("from directory '/tmp/build'"));
    }

    #[test]
    fn spawn_without_argv_is_configuration_error() {
        let launcher = SubprocessLauncher::new();
        let err = launcher.spawn().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
