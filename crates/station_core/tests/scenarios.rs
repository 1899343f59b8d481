mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, tree, wait_finished, GatedCompiler, Harness};
use station_core::{
    CompilerStatus, ControlError, ErrorKind, JobOutcome, MoveOutcome, RepositoryStatus, Resource,
    RuntimeStatus, ValidationError, WatchdogStatus,
};

#[tokio::test(flavor = "multi_thread")]
async fn test_second_compile_is_busy_until_first_finishes() {
    let harness = Harness::with_compiler(GatedCompiler::gated());
    harness.provision().await;
    let service = &harness.service;

    let first = service.compiler().compile().unwrap();
    harness.compiler.entered.notified().await;
    assert_eq!(service.compiler().status(), CompilerStatus::Compiling);

    let err = service.compiler().compile().unwrap_err();
    assert!(matches!(err, ControlError::Busy { resource: Resource::Compiler }));
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert!(!service.jobs().coordinator().is_locked(Resource::Repository));

    harness.compiler.release_one();
    let record = wait_finished(service, Resource::Compiler, first.id).await;
    assert!(record.outcome.as_ref().is_some_and(JobOutcome::is_success));
    assert_eq!(service.compiler().status(), CompilerStatus::Compiled);

    let third = service.compiler().compile().unwrap();
    harness.compiler.release_one();
    wait_finished(service, Resource::Compiler, third.id).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_compile_leaves_compiler_retryable() {
    let harness = Harness::new();
    harness.provision().await;
    harness
        .compiler
        .fail
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let record = harness.compile().await;
    assert!(matches!(
        record.outcome,
        Some(JobOutcome::Failed {
            kind: ErrorKind::ExternalTool,
            ..
        })
    ));
    assert_eq!(harness.service.compiler().status(), CompilerStatus::Error);
    assert!(harness
        .service
        .compiler()
        .last_error()
        .is_some_and(|e| e.contains("1 error")));
    assert!(harness
        .chat
        .messages
        .lock()
        .iter()
        .any(|(text, admin)| *admin && text.contains("failed")));

    harness
        .compiler
        .fail
        .store(false, std::sync::atomic::Ordering::SeqCst);
    let record = harness.compile().await;
    assert!(record.outcome.as_ref().is_some_and(JobOutcome::is_success));
    assert_eq!(
        harness.service.compiler().pending().await.unwrap().as_deref(),
        Some("a")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_move_while_compiling_reports_compiler_busy() {
    let harness = Harness::with_compiler(GatedCompiler::gated());
    harness.provision().await;
    let service = &harness.service;
    let original = harness.server_dir();

    let ticket = service.compiler().compile().unwrap();
    harness.compiler.entered.notified().await;
    let before = tree(harness.dir.path());

    let err = service
        .move_server_directory(&harness.dir.path().join("relocated"))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Busy { resource: Resource::Compiler }));

    let coordinator = service.jobs().coordinator();
    assert!(!coordinator.is_locked(Resource::Repository));
    assert!(!coordinator.is_locked(Resource::RuntimeInstall));
    assert!(!coordinator.is_locked(Resource::Watchdog));
    assert_eq!(tree(harness.dir.path()), before);
    assert_eq!(harness.server_dir(), original);

    harness.compiler.release_one();
    wait_finished(service, Resource::Compiler, ticket.id).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_move_relocates_server_directory() {
    let harness = Harness::new();
    harness.provision().await;
    let service = &harness.service;
    let original = harness.server_dir();
    let target = harness.dir.path().join("relocated");

    let outcome = service.move_server_directory(&target).await.unwrap();
    assert!(matches!(outcome, MoveOutcome::Moved { .. }));
    assert_eq!(service.server_directory(), outcome.path());
    assert!(outcome.path().join("repository").join(".git").exists());
    assert!(!original.exists());

    assert_eq!(service.repository().branch().await.unwrap(), "main");
    let record = harness.compile().await;
    assert!(record.outcome.as_ref().is_some_and(JobOutcome::is_success));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_move_is_degraded_when_configuration_cannot_be_saved() {
    let harness = Harness::file_backed();
    harness.provision().await;
    let service = &harness.service;
    let original = harness.server_dir();
    let target = harness.dir.path().join("relocated");

    let config_path = harness.config_path();
    let _ = std::fs::remove_file(&config_path);
    std::fs::create_dir(&config_path).unwrap();

    let outcome = service.move_server_directory(&target).await.unwrap();
    match &outcome {
        MoveOutcome::Degraded { warning, .. } => {
            assert!(warning.contains("configuration was not saved"), "{}", warning)
        }
        other => panic!("expected a degraded move, got {:?}", other),
    }
    assert_eq!(service.server_directory(), outcome.path());
    assert!(outcome.path().join("repository").join(".git").exists());
    assert!(!original.exists());
    assert_eq!(service.status().repository, RepositoryStatus::Idle);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_move_is_degraded_when_old_directory_survives() {
    use std::os::unix::fs::PermissionsExt;

    let harness = Harness::new();
    harness.provision().await;
    let service = &harness.service;
    let original = harness.server_dir();
    let root = harness.dir.path().to_path_buf();
    let elsewhere = root.join("elsewhere");
    std::fs::create_dir(&elsewhere).unwrap();

    // A read-only parent blocks both the rename and the final delete.
    std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o555)).unwrap();
    let write_check = root.join("write_check");
    if std::fs::write(&write_check, b"").is_ok() {
        // Privileged users ignore directory permissions.
        let _ = std::fs::remove_file(&write_check);
        std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }

    let result = service.move_server_directory(&elsewhere.join("server")).await;
    std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o755)).unwrap();

    match result.unwrap() {
        MoveOutcome::Degraded { path, warning } => {
            assert_eq!(path, elsewhere.join("server"));
            assert!(warning.contains("could not be fully deleted"), "{}", warning);
        }
        other => panic!("expected a degraded move, got {:?}", other),
    }
    assert_eq!(service.server_directory(), elsewhere.join("server"));
    assert!(elsewhere.join("server").join("repository").join(".git").exists());
    assert!(original.exists());
    assert_eq!(service.repository().branch().await.unwrap(), "main");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_move_into_own_subdirectory_is_rejected() {
    let harness = Harness::new();
    harness.provision().await;
    let service = &harness.service;
    let before = tree(harness.dir.path());

    let err = service
        .move_server_directory(&harness.server_dir().join("nested"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControlError::Validation(ValidationError::MoveIntoChild(_))
    ));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(tree(harness.dir.path()), before);

    std::fs::create_dir_all(harness.dir.path().join("taken")).unwrap();
    let err = service
        .move_server_directory(&harness.dir.path().join("taken"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControlError::Validation(ValidationError::MoveTargetExists(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_without_artifact_fails_like_can_start() {
    let harness = Harness::new();
    harness.provision().await;
    let supervisor = harness.service.supervisor();

    let predicted = supervisor.can_start().await.unwrap_err();
    let actual = supervisor.start().await.unwrap_err();
    assert!(matches!(
        actual,
        ControlError::Validation(ValidationError::NoCompiledArtifact)
    ));
    assert_eq!(predicted.kind(), actual.kind());
    assert_eq!(predicted.to_string(), actual.to_string());
    assert_eq!(supervisor.status(), WatchdogStatus::Offline);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_setup_then_branch_and_commit_then_head() {
    let harness = Harness::new();
    let repository = harness.service.repository();

    let ticket = repository
        .setup("https://example.com/station.git", Some("feature/lighting"))
        .unwrap();
    let record = wait_finished(&harness.service, Resource::Repository, ticket.id).await;
    assert!(record.outcome.as_ref().is_some_and(JobOutcome::is_success));
    assert_eq!(repository.branch().await.unwrap(), "feature/lighting");
    assert_eq!(
        harness
            .service
            .config()
            .read(|c| c.repository.branch.clone()),
        "feature/lighting"
    );

    let before = repository.head().await.unwrap();
    repository.commit(Some("Update changelog")).await.unwrap();
    let after = repository.head().await.unwrap();
    assert_ne!(before, after);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_merge_pull_request_is_recorded_until_hard_update() {
    let harness = Harness::new();
    harness.provision().await;
    let repository = harness.service.repository();

    let err = repository.merge_pull_request(0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    repository.merge_pull_request(4521).await.unwrap();
    let merged = repository.merged_pull_requests().await.unwrap();
    assert_eq!(merged.get(&4521).map(|pr| pr.sha.as_str()), Some("pr4521sha"));

    let ticket = repository.update(true).unwrap();
    wait_finished(&harness.service, Resource::Repository, ticket.id).await;
    assert!(repository.merged_pull_requests().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_compiler_status_is_monotonic_during_a_job() {
    let harness = Arc::new(Harness::with_compiler(GatedCompiler::gated()));
    harness.provision().await;

    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    let poller = {
        let harness = harness.clone();
        tokio::spawn(async move {
            let mut seen = vec![harness.service.compiler().status()];
            let _ = ready_tx.send(());
            for _ in 0..5000 {
                let status = harness.service.compiler().status();
                if seen.last() != Some(&status) {
                    seen.push(status);
                }
                if status == CompilerStatus::Compiled {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            seen
        })
    };

    ready_rx.await.unwrap();
    let ticket = harness.service.compiler().compile().unwrap();
    harness.compiler.entered.notified().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    harness.compiler.release_one();
    wait_finished(&harness.service, Resource::Compiler, ticket.id).await;

    let seen = poller.await.unwrap();
    assert_eq!(
        seen,
        vec![
            CompilerStatus::Initialized,
            CompilerStatus::Compiling,
            CompilerStatus::Compiled
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_runtime_install_stays_staged_while_server_runs() {
    let harness = Harness::new();
    harness.provision().await;
    let service = &harness.service;
    assert_eq!(service.runtime().version(false).await.unwrap().as_deref(), Some("514.1589"));

    harness.compile().await;
    service.supervisor().start().await.unwrap();

    let ticket = service.runtime().install("515.1610").unwrap();
    wait_finished(service, Resource::RuntimeInstall, ticket.id).await;
    assert_eq!(service.runtime().status(), RuntimeStatus::Staged);
    assert_eq!(service.runtime().version(true).await.unwrap().as_deref(), Some("515.1610"));

    service.supervisor().restart().await.unwrap();
    assert_eq!(service.runtime().status(), RuntimeStatus::Idle);
    assert_eq!(service.runtime().version(false).await.unwrap().as_deref(), Some("515.1610"));

    service.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_start_and_stop_game_server() {
    let harness = Harness::new();
    harness.provision().await;
    let service = &harness.service;
    harness.compile().await;

    service.supervisor().set_port(4040).await.unwrap();
    service.supervisor().start().await.unwrap();
    assert_eq!(service.status().watchdog, WatchdogStatus::Online);
    assert_eq!(service.supervisor().active_settings().map(|s| s.port), Some(4040));
    assert_eq!(service.compiler().live().await.unwrap().as_deref(), Some("a"));
    assert_eq!(service.compiler().pending().await.unwrap(), None);

    let err = service.supervisor().start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = service
        .move_server_directory(&harness.dir.path().join("elsewhere"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControlError::Validation(ValidationError::WatchdogRunning)
    ));

    assert_eq!(service.supervisor().stop().await.unwrap(), "server stopped");
    assert_eq!(service.status().watchdog, WatchdogStatus::Offline);
    assert_eq!(service.supervisor().active_settings(), None);
    assert_eq!(
        service.supervisor().stop().await.unwrap(),
        "server was not running"
    );
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_crashing_server_gives_up_after_max_restarts() {
    let harness = Harness::new();
    *harness.runtime.script.lock() = "#!/bin/sh\nexit 3\n".to_string();
    harness.provision().await;
    harness
        .service
        .config()
        .update(|c| c.watchdog.max_restarts = 2);
    harness.compile().await;

    harness.service.supervisor().start().await.unwrap();

    let chat = harness.chat.clone();
    eventually(move || {
        chat.messages
            .lock()
            .iter()
            .any(|(text, _)| text.contains("could not be restarted after 2 attempts"))
    })
    .await;
    assert_eq!(harness.service.supervisor().status(), WatchdogStatus::Offline);
    assert!(harness
        .chat
        .messages
        .lock()
        .iter()
        .any(|(text, _)| text.starts_with("Server crashed")));

    harness.service.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_failed_compile_keeps_last_good_build_startable() {
    let harness = Harness::new();
    harness.provision().await;
    let service = &harness.service;

    harness.compile().await;
    service.supervisor().start().await.unwrap();
    service.supervisor().stop().await.unwrap();
    assert_eq!(service.compiler().live().await.unwrap().as_deref(), Some("a"));

    harness.compile().await;
    assert_eq!(service.compiler().pending().await.unwrap().as_deref(), Some("b"));

    harness
        .compiler
        .fail
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let record = harness.compile().await;
    assert!(!record.outcome.as_ref().is_some_and(JobOutcome::is_success));
    assert_eq!(service.compiler().pending().await.unwrap(), None);

    service.supervisor().can_start().await.unwrap();
    service.supervisor().start().await.unwrap();
    assert_eq!(service.compiler().live().await.unwrap().as_deref(), Some("a"));
    assert_eq!(service.status().watchdog, WatchdogStatus::Online);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_refuses_new_jobs() {
    let harness = Harness::new();
    harness.provision().await;
    harness.service.shutdown().await;

    let err = harness.service.compiler().compile().unwrap_err();
    assert!(matches!(err, ControlError::ShuttingDown));
    assert_eq!(harness.service.status().watchdog, WatchdogStatus::Offline);
}
