//! Local OS process adapter (spec.md §4.3).
//!
//! Process-group kill discipline is adapted from `pantsbuild-pants`'s
//! `ManagedChild` (`process_execution/src/children.rs`): `setsid()` in
//! `pre_exec` so the child owns its own PGID, then `kill(-pgid, signal)` to
//! reach the whole group instead of just the immediate child. That repo
//! drives the grace-then-SIGKILL wait with a blocking poll loop since its
//! caller is synchronous; here the same two-step signal is exposed async
//! through [`Adapter::launch`]'s `signal`, and the handle layer owns the
//! grace-timer/SIGKILL escalation (spec.md §4.7).

use std::process::Stdio;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::{getpgid, Pid};
use tokio::process::{Child, Command as TokioCommand};

use crate::adapters::{Adapter, BoxedRead, BoxedWrite, Exit, RunningProcess};
use crate::command::{Command, Invocation, StdinSource, StdioMode};
use crate::error::{Result, XecError};

pub struct LocalAdapter;

impl LocalAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn build_tokio_command(command: &Command) -> Result<TokioCommand> {
    let mut cmd = match (&command.shell, &command.invocation) {
        (Some(shell), Invocation::Shell(s)) => {
            let mut c = TokioCommand::new(shell);
            c.arg("-c").arg(s);
            c
        }
        (None, Invocation::Argv(argv)) => {
            if argv.is_empty() {
                return Err(XecError::Validation("empty argv".to_string()));
            }
            let mut c = TokioCommand::new(&argv[0]);
            c.args(&argv[1..]);
            c
        }
        (Some(shell), Invocation::Argv(argv)) => {
            let mut c = TokioCommand::new(shell);
            c.arg("-c").arg(crate::escaping::join(argv));
            c
        }
        (None, Invocation::Shell(s)) => {
            let argv = crate::escaping::split(s)
                .map_err(|e| XecError::Validation(format!("invalid raw command: {e}")))?;
            if argv.is_empty() {
                return Err(XecError::Validation("empty command".to_string()));
            }
            let mut c = TokioCommand::new(&argv[0]);
            c.args(&argv[1..]);
            c
        }
    };

    if let Some(cwd) = &command.cwd {
        cmd.current_dir(cwd);
    }
    cmd.envs(&command.env);

    cmd.stdin(match command.stdin {
        StdinSource::None => Stdio::null(),
        StdinSource::Inherit => Stdio::inherit(),
        StdinSource::Text(_) | StdinSource::Bytes(_) | StdinSource::Piped => Stdio::piped(),
    });
    cmd.stdout(stdio_for(command.stdout_mode));
    cmd.stderr(stdio_for(command.stderr_mode));

    cmd.kill_on_drop(true);
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid()
                .map(|_| ())
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        });
    }

    Ok(cmd)
}

fn stdio_for(mode: StdioMode) -> Stdio {
    match mode {
        StdioMode::Capture | StdioMode::Stream => Stdio::piped(),
        StdioMode::Inherit => Stdio::inherit(),
        StdioMode::Ignore => Stdio::null(),
    }
}

fn signal_by_name(name: &str) -> Result<Signal> {
    name.parse::<Signal>()
        .map_err(|_| XecError::Validation(format!("unknown signal: {name}")))
}

pub struct LocalProcess {
    child: Child,
}

impl LocalProcess {
    fn pgid(&self) -> Result<Pid> {
        let pid = self
            .child
            .id()
            .ok_or_else(|| XecError::InvalidState("process already reaped".to_string()))?;
        getpgid(Some(Pid::from_raw(pid as i32)))
            .map_err(|e| XecError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
    }
}

#[async_trait]
impl RunningProcess for LocalProcess {
    fn take_stdout(&mut self) -> Option<BoxedRead> {
        self.child.stdout.take().map(|s| Box::pin(s) as BoxedRead)
    }

    fn take_stderr(&mut self) -> Option<BoxedRead> {
        self.child.stderr.take().map(|s| Box::pin(s) as BoxedRead)
    }

    fn take_stdin(&mut self) -> Option<BoxedWrite> {
        self.child.stdin.take().map(|s| Box::pin(s) as BoxedWrite)
    }

    async fn wait(&mut self) -> Result<Exit> {
        let status = self.child.wait().await?;
        Ok(Exit {
            exit_code: status.code(),
            signal: unix_signal_name(&status),
        })
    }

    /// Signals the whole process group (negative PGID), matching
    /// `ManagedChild::signal_pg`.
    async fn signal(&mut self, signal: &str) -> Result<()> {
        let pgid = match self.pgid() {
            Ok(p) => p,
            Err(XecError::InvalidState(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let sig = signal_by_name(signal)?;
        match signal::kill(Pid::from_raw(-pgid.as_raw()), sig) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(XecError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))),
        }
    }

    async fn dispose(&mut self) -> Result<()> {
        let _ = self.child.start_kill();
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn unix_signal_name(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().and_then(|n| Signal::try_from(n).ok()).map(|s| s.as_str().to_string())
}

#[cfg(not(target_os = "linux"))]
fn unix_signal_name(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

#[async_trait]
impl Adapter for LocalAdapter {
    async fn launch(&self, command: &Command) -> Result<Box<dyn RunningProcess>> {
        let mut cmd = build_tokio_command(command)?;
        let mut child = cmd.spawn()?;

        if let StdinSource::Text(text) = &command.stdin {
            use tokio::io::AsyncWriteExt;
            if let Some(mut stdin) = child.stdin.take() {
                let text = text.clone();
                tokio::spawn(async move {
                    let _ = stdin.write_all(text.as_bytes()).await;
                });
            }
        } else if let StdinSource::Bytes(bytes) = &command.stdin {
            use tokio::io::AsyncWriteExt;
            if let Some(mut stdin) = child.stdin.take() {
                let bytes = bytes.clone();
                tokio::spawn(async move {
                    let _ = stdin.write_all(&bytes).await;
                });
            }
        }

        Ok(Box::new(LocalProcess { child }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::AdapterTarget;
    use std::collections::HashMap;
    use std::time::Duration;

    fn echo_command(text: &str) -> Command {
        Command {
            invocation: Invocation::Argv(vec!["echo".to_string(), text.to_string()]),
            cwd: None,
            env: HashMap::new(),
            stdin: StdinSource::None,
            stdout_mode: StdioMode::Capture,
            stderr_mode: StdioMode::Capture,
            shell: None,
            timeout: None,
            kill_signal: "SIGTERM".to_string(),
            kill_grace: Duration::from_secs(5),
            raw: false,
            interactive: false,
            nothrow: false,
            quiet: false,
            cacheable: false,
            target: AdapterTarget::Local,
        }
    }

    #[tokio::test]
    async fn runs_argv_and_captures_stdout() {
        use tokio::io::AsyncReadExt;
        let adapter = LocalAdapter::new();
        let mut proc = adapter.launch(&echo_command("hello")).await.unwrap();
        let mut stdout = proc.take_stdout().unwrap();
        let mut buf = String::new();
        stdout.read_to_string(&mut buf).await.unwrap();
        let exit = proc.wait().await.unwrap();
        assert_eq!(buf, "hello\n");
        assert_eq!(exit.exit_code, Some(0));
    }

    #[tokio::test]
    async fn reports_non_zero_exit_code() {
        let mut cmd = echo_command("ignored");
        cmd.shell = Some("/bin/sh".into());
        cmd.invocation = Invocation::Shell("exit 3".to_string());
        let adapter = LocalAdapter::new();
        let mut proc = adapter.launch(&cmd).await.unwrap();
        let exit = proc.wait().await.unwrap();
        assert_eq!(exit.exit_code, Some(3));
    }
}
