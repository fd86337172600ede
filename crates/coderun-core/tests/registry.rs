#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use coderun_core::{
    AdmissionError, CancelError, Event, EventKind, LifecycleMarker, LimitPolicy, RegistryConfig,
    RegistryError, RunRequest, SessionRegistry, SessionState, SessionUpdate,
};
use coderun_sandbox::{
    LimitOverrides, PythonToolchain, SandboxPolicy, SandboxRunner, Toolchain,
};

fn policy() -> SandboxPolicy {
    SandboxPolicy::default().with_grace_period(Duration::from_millis(200))
}

fn registry() -> SessionRegistry {
    registry_with(RegistryConfig::default())
}

fn registry_with(config: RegistryConfig) -> SessionRegistry {
    SessionRegistry::new(SandboxRunner::new(policy()), config, LimitPolicy::default())
}

fn shell(workspace: &str, source: &str) -> RunRequest {
    RunRequest::new(workspace, "sh", source)
}

async fn collect_all(registry: &SessionRegistry, id: coderun_core::SessionId) -> Vec<Event> {
    let mut sub = registry.subscribe(id, 1).unwrap();
    let mut events = Vec::new();
    while let Some(event) = sub.next().await {
        events.push(event);
    }
    events
}

fn payloads(events: &[Event], kind: EventKind) -> Vec<&str> {
    events
        .iter()
        .filter(|e| e.kind == kind)
        .map(|e| e.payload.as_str())
        .collect()
}

fn assert_gapless(events: &[Event]) {
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64 + 1, "sequence gap at index {}", i);
    }
}

#[tokio::test]
async fn test_shell_run_succeeds_with_ordered_events() {
    let registry = registry();
    let id = registry.submit(shell("w1", "echo hello\necho oops >&2\n")).unwrap();

    let events = collect_all(&registry, id).await;
    let session = registry.get(id).unwrap();

    assert_eq!(session.state, SessionState::Succeeded);
    assert_eq!(session.exit_code, Some(0));
    assert!(session.started_at.is_some() && session.ended_at.is_some());
    assert_gapless(&events);
    assert!(events.first().unwrap().is_lifecycle(&LifecycleMarker::Started));
    assert!(events.last().unwrap().is_lifecycle(&LifecycleMarker::Exited(0)));
    assert_eq!(payloads(&events, EventKind::Stdout), vec!["hello"]);
    assert_eq!(payloads(&events, EventKind::Stderr), vec!["oops"]);
}

#[tokio::test]
async fn test_nonzero_exit_fails() {
    let registry = registry();
    let id = registry.submit(shell("w1", "exit 7\n")).unwrap();
    let session = registry.wait(id).await.unwrap();

    assert_eq!(session.state, SessionState::Failed);
    assert_eq!(session.exit_code, Some(7));
    assert_eq!(session.failure, Some(coderun_core::FailureCause::NonZeroExit));
}

#[tokio::test]
async fn test_second_submit_is_busy_and_leaves_first_untouched() {
    let registry = registry();
    let first = registry.submit(shell("w1", "sleep 5\n")).unwrap();
    let before = registry.get(first).unwrap();

    let err = registry.submit(shell("w1", "echo second\n")).unwrap_err();
    assert!(matches!(err, AdmissionError::Busy { active, .. } if active == first));
    assert_eq!(err.code(), "busy");

    let after = registry.get(first).unwrap();
    assert_eq!(before, after);
    assert_eq!(registry.list(Some("w1")).len(), 1);
    assert_eq!(registry.active_count(), 1);

    // Other workspaces are independent
    let other = registry.submit(shell("w2", "true\n")).unwrap();
    registry.wait(other).await.unwrap();

    registry.cancel(first).unwrap();
    let cancelled = registry.wait(first).await.unwrap();
    assert_eq!(cancelled.state, SessionState::Cancelled);
}

#[tokio::test]
async fn test_cancel_running_session() {
    let registry = registry();
    let id = registry.submit(shell("w1", "echo started\nsleep 30\n")).unwrap();

    let mut sub = registry.subscribe(id, 1).unwrap();
    // Wait until the script is actually running
    while let Some(event) = sub.next().await {
        if event.kind == EventKind::Stdout {
            break;
        }
    }

    let started = Instant::now();
    registry.cancel(id).unwrap();
    let session = registry.wait(id).await.unwrap();

    assert_eq!(session.state, SessionState::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
    let events = registry.events(id).unwrap().events_from(1);
    assert!(events.last().unwrap().is_lifecycle(&LifecycleMarker::Cancelled));

    // The workspace is free again
    let next = registry.submit(shell("w1", "true\n")).unwrap();
    registry.wait(next).await.unwrap();
}

#[tokio::test]
async fn test_cancel_terminal_session_is_rejected() {
    let registry = registry();
    let id = registry.submit(shell("w1", "echo done\n")).unwrap();
    let finished = registry.wait(id).await.unwrap();

    let err = registry.cancel(id).unwrap_err();
    assert_eq!(err.code(), "already_terminal");
    assert!(matches!(err, CancelError::AlreadyTerminal { state: SessionState::Succeeded, .. }));
    assert_eq!(registry.get(id).unwrap(), finished);
}

#[tokio::test]
async fn test_cancel_unknown_session() {
    let registry = registry();
    let id = coderun_core::SessionId::new();
    assert_eq!(registry.cancel(id), Err(CancelError::NotFound(id)));
    assert_eq!(registry.get(id), Err(RegistryError::NotFound(id)));
}

#[tokio::test]
async fn test_wall_clock_timeout() {
    let registry = registry();
    let request = shell("w1", "sleep 30\n").with_limits(LimitOverrides {
        timeout: Some(Duration::from_millis(300)),
        ..Default::default()
    });

    let started = Instant::now();
    let id = registry.submit(request).unwrap();
    let session = registry.wait(id).await.unwrap();

    assert_eq!(session.state, SessionState::TimedOut);
    assert_eq!(session.failure, Some(coderun_core::FailureCause::Timeout));
    assert!(started.elapsed() < Duration::from_secs(5));
    let events = registry.events(id).unwrap().events_from(1);
    assert!(events.last().unwrap().is_lifecycle(&LifecycleMarker::TimedOut));
}

#[tokio::test]
async fn test_output_is_truncated_at_cap() {
    let registry = registry();
    let script = "i=0\nwhile [ $i -lt 200 ]; do echo line$i; i=$((i+1)); done\necho tail >&2\n";
    let request = shell("w1", script).with_limits(LimitOverrides {
        max_output_bytes: Some(100),
        ..Default::default()
    });

    let id = registry.submit(request).unwrap();
    let events = collect_all(&registry, id).await;
    let session = registry.get(id).unwrap();

    // Truncation is reported but does not fail the run
    assert_eq!(session.state, SessionState::Succeeded);
    assert_gapless(&events);

    let truncated: Vec<_> = events
        .iter()
        .filter(|e| e.is_lifecycle(&LifecycleMarker::Truncated))
        .collect();
    assert_eq!(truncated.len(), 1);

    let relayed: usize = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Stdout | EventKind::Stderr))
        .map(|e| e.payload.len() + 1)
        .sum();
    assert!(relayed <= 101, "relayed {} bytes", relayed);
    assert!(!payloads(&events, EventKind::Stderr).contains(&"tail"));
}

#[tokio::test]
async fn test_diagnostics_count_against_output_cap() {
    let registry = registry();
    let script = "i=0\nwhile [ $i -lt 2000 ]; do echo \"x: line 1: boom $i\" >&2; i=$((i+1)); done\n";
    let request = shell("w1", script).with_limits(LimitOverrides {
        max_output_bytes: Some(300),
        ..Default::default()
    });

    let id = registry.submit(request).unwrap();
    let events = collect_all(&registry, id).await;
    let session = registry.get(id).unwrap();

    assert_eq!(session.state, SessionState::Succeeded);
    assert_gapless(&events);
    assert_eq!(
        events
            .iter()
            .filter(|e| e.is_lifecycle(&LifecycleMarker::Truncated))
            .count(),
        1
    );

    let charged: usize = events
        .iter()
        .filter(|e| e.kind != EventKind::Lifecycle)
        .map(|e| e.payload.len() + 1)
        .sum();
    assert!(charged <= 301, "relayed {} bytes", charged);

    let problems = registry.problems(id).unwrap();
    assert_eq!(problems.len(), payloads(&events, EventKind::Diagnostic).len());
    assert!(problems.len() < 5, "{} problems recorded", problems.len());
}

#[tokio::test]
async fn test_replay_matches_live_stream() {
    let registry = registry();
    let id = registry
        .submit(shell("w1", "for i in 1 2 3 4 5; do echo $i; echo e$i >&2; done\n"))
        .unwrap();

    let live = collect_all(&registry, id).await;
    assert_gapless(&live);

    let stream = registry.events(id).unwrap();
    for from in [1u64, 2, 5, live.len() as u64] {
        let replay = stream.events_from(from);
        assert_eq!(replay.as_slice(), &live[from as usize - 1..]);

        let mut sub = registry.subscribe(id, from).unwrap();
        let mut resubscribed = Vec::new();
        while let Some(event) = sub.next().await {
            resubscribed.push(event);
        }
        assert_eq!(resubscribed, replay);
    }
}

#[tokio::test]
async fn test_shell_errors_become_problems() {
    let registry = registry();
    let id = registry
        .submit(shell("w1", "echo ok\ncoderun_missing_command_xyz\n"))
        .unwrap();
    let events = collect_all(&registry, id).await;
    let session = registry.get(id).unwrap();

    assert_eq!(session.state, SessionState::Failed);
    let problems = registry.problems(id).unwrap();
    assert_eq!(problems.len(), 1);
    assert_eq!(problems[0].diagnostic.line, Some(2));
    assert_eq!(problems[0].session_id, id);

    let diagnostic_events = payloads(&events, EventKind::Diagnostic);
    assert_eq!(diagnostic_events.len(), 1);
    let decoded: serde_json::Value = serde_json::from_str(diagnostic_events[0]).unwrap();
    assert_eq!(decoded["severity"], "error");
    assert_eq!(decoded["line"], 2);

    assert_eq!(registry.workspace_problems("w1"), problems);
}

#[tokio::test]
async fn test_new_run_clears_workspace_problems() {
    let registry = registry();
    let failing = registry.submit(shell("w1", "coderun_missing_command_xyz\n")).unwrap();
    registry.wait(failing).await.unwrap();
    assert_eq!(registry.workspace_problems("w1").len(), 1);

    let clean = registry.submit(shell("w1", "sleep 0.2\n")).unwrap();
    assert!(registry.workspace_problems("w1").is_empty());
    registry.wait(clean).await.unwrap();
    assert!(registry.workspace_problems("w1").is_empty());

    // The older run keeps its own problems
    assert_eq!(registry.problems(failing).unwrap().len(), 1);
}

#[tokio::test]
async fn test_retention_purges_oldest_sessions() {
    let registry = registry_with(RegistryConfig {
        history_per_workspace: 2,
        ..Default::default()
    });

    let mut ids = Vec::new();
    for i in 0..3 {
        let id = registry.submit(shell("w1", &format!("echo {}\n", i))).unwrap();
        registry.wait(id).await.unwrap();
        ids.push(id);
    }

    assert_eq!(registry.get(ids[0]), Err(RegistryError::NotFound(ids[0])));
    assert!(registry.events(ids[0]).is_err());
    assert!(registry.get(ids[1]).is_ok());
    assert!(registry.get(ids[2]).is_ok());

    let listed: Vec<_> = registry.list(Some("w1")).into_iter().map(|s| s.id).collect();
    assert_eq!(listed, vec![ids[2], ids[1]]);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let registry = registry_with(RegistryConfig {
        max_source_bytes: 16,
        ..Default::default()
    });

    let cases = [
        (RunRequest::new("", "sh", "true"), "bad_request"),
        (RunRequest::new("w1", "cobol", "DISPLAY 'HI'"), "invalid_language"),
        (RunRequest::new("w1", "sh", "   \n"), "bad_request"),
        (RunRequest::new("w1", "sh", "echo this source is too long"), "bad_request"),
    ];
    for (request, code) in cases {
        let err = registry.submit(request).unwrap_err();
        assert_eq!(err.code(), code, "{}", err);
    }
    assert!(registry.list(None).is_empty());
    assert_eq!(registry.active_count(), 0);
}

#[tokio::test]
async fn test_missing_toolchain_creates_no_session() {
    let missing: Arc<dyn Toolchain> =
        Arc::new(PythonToolchain::with_binary_path("/nonexistent/python3".into()));
    let runner = SandboxRunner::new(policy()).with_toolchain(missing);
    let registry = SessionRegistry::new(runner, RegistryConfig::default(), LimitPolicy::default());

    let err = registry
        .submit(RunRequest::new("w1", "python", "print(1)"))
        .unwrap_err();
    assert_eq!(err.code(), "sandbox_unavailable");
    assert!(registry.list(None).is_empty());

    // The reservation was released
    let id = registry.submit(shell("w1", "true\n")).unwrap();
    registry.wait(id).await.unwrap();
}

#[tokio::test]
async fn test_updates_are_broadcast() {
    let registry = registry();
    let mut updates = registry.updates();
    let id = registry.submit(shell("w1", "true\n")).unwrap();
    registry.wait(id).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(update) = tokio::time::timeout(Duration::from_secs(2), updates.recv()).await {
        let update = update.unwrap();
        assert_eq!(update.session_id(), id);
        let done = matches!(update, SessionUpdate::Completed { .. });
        seen.push(update.event_name());
        if done {
            break;
        }
    }
    assert_eq!(seen, vec!["session_created", "session_updated", "session_completed"]);
}

#[tokio::test]
async fn test_limits_are_clamped_to_ceiling() {
    let registry = registry();
    let request = shell("w1", "true\n").with_limits(LimitOverrides {
        timeout: Some(Duration::from_secs(3600)),
        max_memory: Some(u64::MAX),
        max_output_bytes: None,
    });
    let id = registry.submit(request).unwrap();
    let session = registry.wait(id).await.unwrap();

    let ceiling = registry.limits().ceiling;
    assert_eq!(session.limits.timeout, ceiling.timeout);
    assert_eq!(session.limits.max_memory, ceiling.max_memory);
    assert_eq!(
        session.limits.max_output_bytes,
        registry.limits().defaults.max_output_bytes
    );
}

#[tokio::test]
async fn test_archive_run_completes_with_run_end() {
    let registry = registry();
    let dir = tempfile::tempdir().unwrap();
    let id = registry.submit(shell("w1", "echo archived\n")).unwrap();

    let path = coderun_core::archive_run(&registry, id, dir.path()).await.unwrap();
    let session = registry.get(id).unwrap();
    assert!(session.state.is_terminal());

    let lines = coderun_logging::RunArchive::read(&path).unwrap();
    assert!(matches!(
        lines.first(),
        Some(coderun_logging::ArchiveLine::RunStart { workspace_id, .. }) if workspace_id == "w1"
    ));
    assert!(lines.iter().any(|line| matches!(
        line,
        coderun_logging::ArchiveLine::Event { payload, .. } if payload == "archived"
    )));
    assert!(matches!(
        lines.last(),
        Some(coderun_logging::ArchiveLine::RunEnd { state, exit_code: Some(0), .. }) if state == "succeeded"
    ));
}
