//! Docker adapter entry point: dispatches to the persistent-exec or
//! ephemeral-run sub-mode by `AdapterTarget` variant, not by trait impl
//! (spec.md §9 "Ephemeral vs persistent Docker is a sub-variant").

use async_trait::async_trait;
use bollard::Docker;

use crate::adapters::{Adapter, RunningProcess};
use crate::command::{AdapterTarget, Command};
use crate::error::{Result, XecError};
use crate::events::EventBus;

use super::{ephemeral, persistent};

pub struct DockerAdapter {
    docker: Docker,
    events: EventBus,
}

impl DockerAdapter {
    pub fn new(events: EventBus) -> Result<Self> {
        Ok(Self { docker: super::client::connect()?, events })
    }
}

#[async_trait]
impl Adapter for DockerAdapter {
    async fn launch(&self, command: &Command) -> Result<Box<dyn RunningProcess>> {
        match &command.target {
            AdapterTarget::DockerPersistent { container } => {
                persistent::launch(self.docker.clone(), container.clone(), command).await
            }
            AdapterTarget::DockerEphemeral(opts) => {
                ephemeral::launch(self.docker.clone(), opts.clone(), command, self.events.clone()).await
            }
            _ => Err(XecError::Validation("docker adapter received non-docker target".to_string())),
        }
    }
}
