//! Docker persistent-exec: run a command inside an already-running
//! container (spec.md §4.5), the `exec create/start/inspect` endpoints
//! named in §6.

use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;

use crate::adapters::{BoxedRead, BoxedWrite, Exit, ExitSlot, RunningProcess};
use crate::command::{Command, Invocation, StdinSource};
use crate::error::{Result, XecError};

async fn container_state(docker: &Docker, container: &str) -> Result<()> {
    let info = docker.inspect_container(container, None).await.map_err(|e| {
        if let bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } = e {
            XecError::ContainerNotFound(container.to_string())
        } else {
            XecError::DockerUnavailable(e.to_string())
        }
    })?;
    let running = info.state.and_then(|s| s.running).unwrap_or(false);
    if !running {
        return Err(XecError::ContainerNotRunning(container.to_string()));
    }
    Ok(())
}

pub async fn launch(docker: Docker, container: String, command: &Command) -> Result<Box<dyn RunningProcess>> {
    container_state(&docker, &container).await?;

    let cmd = match (&command.shell, &command.invocation) {
        (Some(shell), Invocation::Shell(s)) => vec![shell.to_string_lossy().into_owned(), "-c".to_string(), s.clone()],
        (None, Invocation::Argv(argv)) => argv.clone(),
        (Some(shell), Invocation::Argv(argv)) => {
            vec![shell.to_string_lossy().into_owned(), "-c".to_string(), crate::escaping::join(argv)]
        }
        (None, Invocation::Shell(s)) => crate::escaping::split(s)
            .map_err(|e| XecError::Validation(format!("invalid raw command: {e}")))?,
    };

    let env: Vec<String> = command.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

    let options = CreateExecOptions {
        cmd: Some(cmd),
        env: Some(env),
        working_dir: command.cwd.as_ref().map(|p| p.to_string_lossy().into_owned()),
        attach_stdin: Some(matches!(command.stdin, StdinSource::Text(_) | StdinSource::Bytes(_) | StdinSource::Piped) || command.interactive),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(command.interactive),
        ..Default::default()
    };

    let created = docker
        .create_exec(&container, options)
        .await
        .map_err(|e| XecError::ExecCreateFailed(e.to_string()))?;

    let start = docker
        .start_exec(&created.id, None)
        .await
        .map_err(|e| XecError::ExecCreateFailed(e.to_string()))?;

    let StartExecResults::Attached { mut output, mut input } = start else {
        return Err(XecError::ExecCreateFailed("exec started detached unexpectedly".to_string()));
    };

    let (stdout_local, stdout_remote) = tokio::io::duplex(64 * 1024);
    let (stderr_local, stderr_remote) = tokio::io::duplex(64 * 1024);
    let (exit_tx, exit_rx) = oneshot::channel();

    match &command.stdin {
        StdinSource::Text(text) => {
            let _ = input.write_all(text.as_bytes()).await;
        }
        StdinSource::Bytes(bytes) => {
            let _ = input.write_all(bytes).await;
        }
        StdinSource::None | StdinSource::Inherit | StdinSource::Piped => {}
    }

    let exec_id = created.id.clone();
    let docker_for_poll = docker.clone();
    tokio::spawn(async move {
        let mut stdout_remote = stdout_remote;
        let mut stderr_remote = stderr_remote;
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(bollard::container::LogOutput::StdOut { message }) => {
                    let _ = stdout_remote.write_all(&message).await;
                }
                Ok(bollard::container::LogOutput::StdErr { message }) => {
                    let _ = stderr_remote.write_all(&message).await;
                }
                Ok(bollard::container::LogOutput::Console { message }) => {
                    let _ = stdout_remote.write_all(&message).await;
                }
                Ok(bollard::container::LogOutput::StdIn { .. }) => {}
                Err(_) => break,
            }
        }
        let exit_code = docker_for_poll
            .inspect_exec(&exec_id)
            .await
            .ok()
            .and_then(|i| i.exit_code)
            .map(|c| c as i32);
        let _ = exit_tx.send(Exit { exit_code, signal: None });
    });

    Ok(Box::new(PersistentExecProcess {
        docker,
        container,
        exec_id: created.id,
        stdout: Some(stdout_local),
        stderr: Some(stderr_local),
        stdin: Some(input as BoxedWrite),
        exit: ExitSlot::new(exit_rx),
    }))
}

struct PersistentExecProcess {
    docker: Docker,
    container: String,
    exec_id: String,
    stdout: Option<tokio::io::DuplexStream>,
    stderr: Option<tokio::io::DuplexStream>,
    stdin: Option<BoxedWrite>,
    exit: ExitSlot,
}

#[async_trait::async_trait]
impl RunningProcess for PersistentExecProcess {
    fn take_stdout(&mut self) -> Option<BoxedRead> {
        self.stdout.take().map(|s| Box::pin(s) as BoxedRead)
    }

    fn take_stderr(&mut self) -> Option<BoxedRead> {
        self.stderr.take().map(|s| Box::pin(s) as BoxedRead)
    }

    fn take_stdin(&mut self) -> Option<BoxedWrite> {
        self.stdin.take()
    }

    async fn wait(&mut self) -> Result<Exit> {
        self.exit.wait().await
    }

    /// Bollard's exec API has no per-exec signal endpoint, so signal
    /// delivery falls back to a best-effort `kill` of the exec's pid inside
    /// the container via a second exec (spec.md §4.5 "Docker's exec signal
    /// path or, if unsupported, best-effort SIGKILL of the exec's pid").
    async fn signal(&mut self, signal: &str) -> Result<()> {
        let Some(pid) = self.docker.inspect_exec(&self.exec_id).await.ok().and_then(|i| i.pid) else {
            return Ok(());
        };
        let signal = signal.trim_start_matches("SIG");
        let options = CreateExecOptions {
            cmd: Some(vec!["kill".to_string(), format!("-{signal}"), pid.to_string()]),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            ..Default::default()
        };
        if let Ok(kill_exec) = self.docker.create_exec(&self.container, options).await {
            let _ = self.docker.start_exec(&kill_exec.id, None).await;
        }
        Ok(())
    }

    async fn dispose(&mut self) -> Result<()> {
        self.stdin = None;
        Ok(())
    }
}
