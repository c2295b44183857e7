//! Smoke-test binary: exercises [`xec_core::Engine`] against the local
//! adapter only. Not the CLI described in spec.md §6 — that remains an
//! external collaborator; this just proves the library links and runs.

use anyhow::Result;
use tracing::info;
use xec_core::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "xec_core=info".into()),
        )
        .init();

    let engine = Engine::new()?;

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(kind = %event.kind, command_id = %event.command_id, "event");
        }
    });

    let result = engine.sh("echo hello from xec-core")?.run().await?;
    info!(stdout = %result.stdout.trim_end(), "smoke test command completed");

    let piped = engine.sh("printf 'a\\nb\\nc\\n'")?.pipe(engine.sh("grep b")?).run().await?;
    info!(stdout = %piped.stdout.trim_end(), "piped smoke test completed");

    engine.dispose().await;
    Ok(())
}
