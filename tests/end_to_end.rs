//! Crate-level scenarios spanning engine + handle + pipe + parallel against
//! the local adapter only (spec.md §8) — no live Docker/SSH/K8s substrate
//! required.

use std::collections::HashMap;

use xec_core::{parallel, Engine, RetryConfig, XecError};

#[tokio::test]
async fn scenario_1_local_success() {
    let engine = Engine::new().unwrap();
    let result = engine.sh("echo hello").unwrap().run().await.unwrap();
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.exit_code, Some(0));
    assert!(result.ok());
    assert_eq!(result.cause(), None);
}

#[tokio::test]
async fn scenario_2_local_failure_raises_command_error() {
    let engine = Engine::new().unwrap();
    let err = engine.sh("exit 3").unwrap().run().await.unwrap_err();
    match err {
        XecError::Command(result) => {
            assert_eq!(result.exit_code, Some(3));
            assert_eq!(result.cause().unwrap().to_string(), "exitCode: 3");
        }
        other => panic!("expected XecError::Command, got {other:?}"),
    }
}

#[tokio::test]
async fn scenario_3_nothrow_resolves_instead_of_rejecting() {
    let engine = Engine::new().unwrap();
    let result = engine.sh("exit 3").unwrap().nothrow().unwrap().run().await.unwrap();
    assert!(!result.ok());
    assert_eq!(result.cause().unwrap().to_string(), "exitCode: 3");
}

#[tokio::test]
async fn scenario_4_timeout_reaps_the_process() {
    let engine = Engine::new().unwrap();
    let handle = engine.sh("sleep 5").unwrap().timeout(100).unwrap();
    let err = handle.run().await.unwrap_err();
    assert!(matches!(err, XecError::Timeout(_)));
}

#[tokio::test]
async fn scenario_7_pipe_filters_through_grep() {
    let engine = Engine::new().unwrap();
    let upstream = engine.sh("printf 'a\\nb\\nc\\n'").unwrap();
    let downstream = engine.sh("grep b").unwrap();
    let result = upstream.pipe(downstream).run().await.unwrap();
    assert_eq!(result.stdout, "b\n");
    assert_eq!(result.exit_code, Some(0));
}

#[tokio::test]
async fn scenario_8_parallel_all_fails_fast_and_cancels_siblings() {
    let engine = Engine::new().unwrap();
    let sleeper = engine.sh("sleep 5").unwrap();
    let failing = engine.sh("exit 1").unwrap();

    let started = std::time::Instant::now();
    let err = parallel::all(vec![sleeper.clone(), failing]).await.unwrap_err();
    assert!(matches!(err, XecError::Command(_)));
    assert!(started.elapsed() < std::time::Duration::from_secs(4), "should fail fast, not wait out the sleep");

    // The sleeping sibling was signalled to cancel rather than left running
    // to completion in the background.
    assert_ne!(sleeper.state(), xec_core::HandleState::Configured);
}

#[tokio::test]
async fn env_overrides_are_visible_to_the_child_process() {
    let engine = Engine::new().unwrap();
    let mut vars = HashMap::new();
    vars.insert("XEC_TEST_VAR".to_string(), "prod".to_string());
    let result = engine.env(vars, false).sh("echo $XEC_TEST_VAR").unwrap().run().await.unwrap();
    assert_eq!(result.stdout, "prod\n");
}

#[tokio::test]
async fn cached_handles_share_a_single_underlying_execution() {
    let engine = Engine::new().unwrap().cached();
    let first = engine.sh("echo cached").unwrap().run().await.unwrap();
    let second = engine.sh("echo cached").unwrap().run().await.unwrap();
    assert_eq!(first.started_at, second.started_at);
    assert_eq!(first.stdout, second.stdout);
}

#[tokio::test]
async fn retries_exhaust_then_surface_the_underlying_error() {
    let engine = Engine::new().unwrap();
    // A non-zero exit is only retried when a predicate opts into it (spec.md
    // §4.2); exercise that path explicitly rather than relying on a default.
    let retry = RetryConfig {
        times: 2,
        backoff: std::time::Duration::from_millis(1),
        predicate: Some(std::sync::Arc::new(|_| true)),
        ..RetryConfig::default()
    };
    let err = engine.retry(retry).sh("exit 7").unwrap().run().await.unwrap_err();
    match err {
        XecError::Command(result) => assert_eq!(result.exit_code, Some(7)),
        other => panic!("expected XecError::Command, got {other:?}"),
    }
}

#[tokio::test]
async fn subscribed_events_observe_the_full_command_lifecycle() {
    let engine = Engine::new().unwrap();
    let mut events = engine.subscribe();
    engine.sh("echo hi").unwrap().run().await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    assert!(kinds.contains(&xec_core::EventKind::Start));
    assert!(kinds.contains(&xec_core::EventKind::Complete));
}
