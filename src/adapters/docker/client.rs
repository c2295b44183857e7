//! Docker client construction (spec.md §6: `DOCKER_HOST`, local socket).
//!
//! Mirrors `DockerEnvironment::new`/`with_client`
//! (`environment/docker/environment.rs`): connect to the local socket by
//! default, or to `DOCKER_HOST` when set.

use bollard::Docker;

use crate::error::{Result, XecError};

pub fn connect() -> Result<Docker> {
    let docker = match std::env::var("DOCKER_HOST") {
        Ok(host) if !host.is_empty() => Docker::connect_with_http(&host, 30, bollard::API_DEFAULT_VERSION),
        _ => Docker::connect_with_local_defaults(),
    };
    docker.map_err(|e| XecError::DockerUnavailable(e.to_string()))
}
