//! Docker ephemeral run: create a throwaway container, run one command,
//! remove it (spec.md §4.5, §8 scenario 6 "two distinct container names,
//! both removed, no name collision").
//!
//! Grounded on `environment/docker/container.rs` (`create_container`,
//! `ensure_image_exists`/`pull_image`) and `environment/docker/power.rs`
//! (`attach_container`, `wait_for_container_exit`, `terminate_container`),
//! generalized from "one persistent game-server container" to "one
//! one-shot container per launch."

use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    RemoveContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{BoxedRead, BoxedWrite, Exit, ExitSlot, RunningProcess};
use crate::command::{Command, DockerEphemeralOptions, Invocation, StdinSource};
use crate::error::{Result, XecError};
use crate::events::{EventBus, EventKind, Payload};

async fn ensure_image(docker: &Docker, image: &str) -> Result<()> {
    if docker.inspect_image(image).await.is_ok() {
        return Ok(());
    }
    info!(image, "pulling docker image for ephemeral run");
    let options = CreateImageOptions { from_image: image, ..Default::default() };
    let mut stream = docker.create_image(Some(options), None, None);
    while let Some(result) = stream.next().await {
        result.map_err(|e| XecError::ImagePullFailed(e.to_string()))?;
    }
    Ok(())
}

fn container_name(opts: &DockerEphemeralOptions) -> String {
    opts.name.clone().unwrap_or_else(|| format!("xec-{}", Uuid::new_v4()))
}

pub async fn launch(
    docker: Docker,
    opts: DockerEphemeralOptions,
    command: &Command,
    events: EventBus,
) -> Result<Box<dyn RunningProcess>> {
    ensure_image(&docker, &opts.image).await?;

    let name = container_name(&opts);

    // Shell-mode commands must override the image's own `ENTRYPOINT` to the
    // shell binary itself, or the entrypoint gets prepended ahead of
    // `-c <script>` instead of exec'ing it (spec.md §4.5 "Shell-mode
    // commands in an image with an ENTRYPOINT must override the entrypoint
    // (to sh)"). An explicit `entrypoint_override` from the caller always
    // wins.
    let mut entrypoint = opts.entrypoint_override.clone();
    let cmd = match (&command.shell, &command.invocation) {
        (Some(shell), Invocation::Shell(s)) => {
            if entrypoint.is_none() {
                entrypoint = Some(vec![shell.to_string_lossy().into_owned()]);
            }
            Some(vec!["-c".to_string(), s.clone()])
        }
        (None, Invocation::Argv(argv)) if !argv.is_empty() => Some(argv.clone()),
        (None, Invocation::Argv(_)) => None,
        (Some(shell), Invocation::Argv(argv)) => {
            if entrypoint.is_none() {
                entrypoint = Some(vec![shell.to_string_lossy().into_owned()]);
            }
            Some(vec!["-c".to_string(), crate::escaping::join(argv)])
        }
        (None, Invocation::Shell(s)) => Some(
            crate::escaping::split(s).map_err(|e| XecError::Validation(format!("invalid raw command: {e}")))?,
        ),
    };

    let mut env: Vec<String> = opts.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    env.extend(command.env.iter().map(|(k, v)| format!("{k}={v}")));

    let mounts: Vec<Mount> = opts
        .volumes
        .iter()
        .map(|(source, target, read_only)| Mount {
            source: Some(source.clone()),
            target: Some(target.clone()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(*read_only),
            ..Default::default()
        })
        .collect();

    let host_config = HostConfig {
        mounts: if mounts.is_empty() { None } else { Some(mounts) },
        auto_remove: Some(false), // removal is explicit, below, so we control ordering with `wait`
        ..Default::default()
    };

    let container_config = Config {
        image: Some(opts.image.clone()),
        cmd,
        env: Some(env),
        entrypoint,
        working_dir: opts.workdir.clone().or_else(|| command.cwd.as_ref().map(|p| p.to_string_lossy().into_owned())),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        open_stdin: Some(true),
        host_config: Some(host_config),
        ..Default::default()
    };

    let create_options = CreateContainerOptions { name: name.clone(), platform: None };
    docker
        .create_container(Some(create_options), container_config)
        .await
        .map_err(|e| XecError::DockerUnavailable(format!("create {name}: {e}")))?;
    events.emit(Uuid::new_v4(), "docker:ephemeral", EventKind::AdapterContainerCreate, Payload::Message(name.clone()));

    let attach_options = AttachContainerOptions::<String> {
        stdin: Some(true),
        stdout: Some(true),
        stderr: Some(true),
        stream: Some(true),
        logs: Some(true),
        ..Default::default()
    };
    let AttachContainerResults { mut output, mut input } = docker
        .attach_container(&name, Some(attach_options))
        .await
        .map_err(|e| XecError::DockerUnavailable(format!("attach {name}: {e}")))?;

    docker
        .start_container::<String>(&name, None)
        .await
        .map_err(|e| XecError::DockerUnavailable(format!("start {name}: {e}")))?;

    match &command.stdin {
        StdinSource::Text(text) => {
            let _ = input.write_all(text.as_bytes()).await;
        }
        StdinSource::Bytes(bytes) => {
            let _ = input.write_all(bytes).await;
        }
        StdinSource::None | StdinSource::Inherit | StdinSource::Piped => {}
    }

    let (stdout_local, stdout_remote) = tokio::io::duplex(64 * 1024);
    let (stderr_local, stderr_remote) = tokio::io::duplex(64 * 1024);
    let (exit_tx, exit_rx) = oneshot::channel();

    let docker_for_wait = docker.clone();
    let name_for_wait = name.clone();
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

        let exit_code = wait_for_exit(&docker_for_wait, &name_for_wait).await;
        let _ = exit_tx.send(Exit { exit_code, signal: None });
    });

    Ok(Box::new(EphemeralProcess {
        docker,
        name,
        auto_remove: opts.auto_remove,
        stdout: Some(stdout_local),
        stderr: Some(stderr_local),
        stdin: Some(input as BoxedWrite),
        exit: ExitSlot::new(exit_rx),
        disposed: false,
        events,
    }))
}

async fn wait_for_exit(docker: &Docker, name: &str) -> Option<i32> {
    let options = WaitContainerOptions { condition: "not-running" };
    let mut stream = docker.wait_container(name, Some(options));
    while let Some(result) = stream.next().await {
        match result {
            Ok(response) => return Some(response.status_code as i32),
            Err(e) => {
                warn!(container = name, error = %e, "error waiting for ephemeral container");
                return None;
            }
        }
    }
    None
}

async fn remove(docker: &Docker, name: &str, events: &EventBus) {
    let options = RemoveContainerOptions { force: true, v: false, ..Default::default() };
    match docker.remove_container(name, Some(options)).await {
        Ok(_) => debug!(container = name, "removed ephemeral container"),
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {}
        Err(e) => warn!(container = name, error = %e, "failed to remove ephemeral container"),
    }
    events.emit(
        Uuid::new_v4(),
        "docker:ephemeral",
        EventKind::AdapterContainerRemove,
        Payload::Message(name.to_string()),
    );
}

struct EphemeralProcess {
    docker: Docker,
    name: String,
    auto_remove: bool,
    stdout: Option<tokio::io::DuplexStream>,
    stderr: Option<tokio::io::DuplexStream>,
    stdin: Option<BoxedWrite>,
    exit: ExitSlot,
    disposed: bool,
    events: EventBus,
}

#[async_trait::async_trait]
impl RunningProcess for EphemeralProcess {
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

    /// Kills the container outright — ephemeral runs have no "graceful
    /// signal then wait" distinction worth making since the container is
    /// discarded either way (spec.md §4.5 "Non-goals").
    async fn signal(&mut self, signal: &str) -> Result<()> {
        use bollard::container::KillContainerOptions;
        let options = KillContainerOptions { signal };
        match self.docker.kill_container(&self.name, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404 | 409, .. }) => Ok(()),
            Err(e) => Err(XecError::DockerUnavailable(e.to_string())),
        }
    }

    /// Destroyed only when `auto_remove` is set (spec.md §3 "Ephemeral
    /// Docker containers are owned by the handle and destroyed on
    /// completion when auto-remove is set") — called on every completion
    /// path, normal or cancelled/timed-out, so a caller who explicitly
    /// disabled auto-remove can still inspect the container afterward.
    async fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        if self.auto_remove {
            remove(&self.docker, &self.name, &self.events).await;
        }
        Ok(())
    }
}
