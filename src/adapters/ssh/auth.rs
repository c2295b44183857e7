//! SSH authentication, tried in the order agent → key → password
//! (spec.md §4.4).

use russh_keys::key::KeyPair;
use russh_keys::load_secret_key;

use crate::command::SshAuth;
use crate::error::{Result, XecError};

/// Attempts each configured method in order against an open `client::Handle`,
/// returning on the first success.
pub async fn authenticate(
    handle: &mut russh::client::Handle<super::adapter::ClientHandler>,
    user: &str,
    methods: &[SshAuth],
) -> Result<()> {
    if methods.is_empty() {
        return Err(XecError::Validation("no SSH auth methods configured".to_string()));
    }

    let mut last_error = None;
    for method in methods {
        let outcome = match method {
            SshAuth::Agent => try_agent(handle, user).await,
            SshAuth::PrivateKey { path, passphrase } => {
                try_private_key(handle, user, path, passphrase.as_deref()).await
            }
            SshAuth::Password(password) => {
                handle
                    .authenticate_password(user, password)
                    .await
                    .map_err(|e| XecError::AuthFailure(e.to_string()))
            }
        };
        match outcome {
            Ok(true) => return Ok(()),
            Ok(false) => last_error = Some(XecError::AuthFailure("rejected by server".to_string())),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| XecError::AuthFailure("all auth methods exhausted".to_string())))
}

async fn try_agent(
    handle: &mut russh::client::Handle<super::adapter::ClientHandler>,
    user: &str,
) -> Result<bool> {
    let Ok(mut agent) = russh_keys::agent::client::AgentClient::connect_env().await else {
        return Ok(false);
    };
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| XecError::AuthFailure(format!("agent: {e}")))?;
    for key in identities {
        match handle.authenticate_future(user, key, agent).await {
            (returned_agent, Ok(true)) => {
                let _ = returned_agent;
                return Ok(true);
            }
            (returned_agent, _) => agent = returned_agent,
        }
    }
    Ok(false)
}

async fn try_private_key(
    handle: &mut russh::client::Handle<super::adapter::ClientHandler>,
    user: &str,
    path: &std::path::Path,
    passphrase: Option<&str>,
) -> Result<bool> {
    let key: KeyPair = load_secret_key(path, passphrase)
        .map_err(|e| XecError::AuthFailure(format!("loading key {}: {e}", path.display())))?;
    handle
        .authenticate_publickey(user, std::sync::Arc::new(key))
        .await
        .map_err(|e| XecError::AuthFailure(e.to_string()))
}
