mod common;

use common::{discovery, FakeLauncher, FakePlugin};
use plugin_ipc::credentials::{
    GetAuthenticationCredentials, GetAuthenticationCredentialsRequest,
};
use plugin_ipc::error::IpcError;
use plugin_ipc::plugin::{
    DiscoveryResult, PluginFileState, PluginRegistry, PluginState, RegistryOptions, ReleasePolicy,
};
use plugin_ipc::protocol::{ContractRegistry, ProtocolVersion};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;
use url::Url;

fn registry(launcher: Arc<FakeLauncher>, options: RegistryOptions) -> PluginRegistry {
    PluginRegistry::new(launcher, Arc::new(ContractRegistry::with_defaults()), options)
}

fn credentials_request() -> GetAuthenticationCredentialsRequest {
    GetAuthenticationCredentialsRequest::new(
        Url::parse("https://example.org").unwrap(),
        false,
        false,
    )
}

#[tokio::test]
async fn test_acquire_creates_ready_handle() {
    let launcher = FakeLauncher::new(FakePlugin::default());
    let registry = registry(launcher.clone(), RegistryOptions::default());

    let lease = assert_ok!(
        registry
            .acquire(&discovery("alpha"), &CancellationToken::new())
            .await
    );

    assert_eq!(lease.state(), PluginState::Ready);
    assert_eq!(lease.ref_count(), 1);
    assert_eq!(lease.protocol_version(), Some(ProtocolVersion::new(2, 0, 0)));
    assert_eq!(launcher.launches(), 1);
    assert_eq!(launcher.transcript(0).requests_for("Handshake").len(), 1);

    registry.release(lease).await;
    let plugins = registry.plugins();
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0].ref_count, 0);
    assert_eq!(plugins[0].state, PluginState::Ready);
}

#[tokio::test]
async fn test_concurrent_acquire_launches_once() {
    let launcher = FakeLauncher::slow(FakePlugin::default(), Duration::from_millis(50));
    let registry = registry(launcher.clone(), RegistryOptions::default());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            registry
                .acquire(&discovery("shared"), &CancellationToken::new())
                .await
        }));
    }

    let leases: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert_eq!(launcher.launches(), 1);
    let first = leases[0].instance_id();
    assert!(leases.iter().all(|lease| lease.instance_id() == first));
    assert_eq!(leases[0].ref_count(), 8);
}

#[tokio::test]
async fn test_distinct_identities_get_distinct_handles() {
    let launcher = FakeLauncher::new(FakePlugin::default());
    let registry = registry(launcher.clone(), RegistryOptions::default());
    let cancel = CancellationToken::new();

    let a = registry.acquire(&discovery("a"), &cancel).await.unwrap();
    let b = registry.acquire(&discovery("b"), &cancel).await.unwrap();
    let versioned = registry
        .acquire(&discovery("a").with_version("1.0.0"), &cancel)
        .await
        .unwrap();

    assert_ne!(a.instance_id(), b.instance_id());
    assert_ne!(a.instance_id(), versioned.instance_id());
    assert_eq!(launcher.launches(), 3);
}

#[tokio::test]
async fn test_launch_failure_reaches_every_waiter_and_clears_slot() {
    let launcher = FakeLauncher::failing("no such executable");
    let registry = registry(launcher.clone(), RegistryOptions::default());

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            registry
                .acquire(&discovery("broken"), &CancellationToken::new())
                .await
        }));
    }

    for result in futures::future::join_all(tasks).await {
        let err = result.unwrap().unwrap_err();
        assert!(matches!(err, IpcError::Launch { ref reason, .. } if reason == "no such executable"));
    }
    assert_eq!(launcher.launches(), 1);
    assert!(registry.plugins().is_empty());

    // The slot was cleared, so the next acquire retries.
    let _ = registry
        .acquire(&discovery("broken"), &CancellationToken::new())
        .await;
    assert_eq!(launcher.launches(), 2);
}

#[tokio::test]
async fn test_invalid_file_state_never_launches() {
    let launcher = FakeLauncher::new(FakePlugin::default());
    let registry = registry(launcher.clone(), RegistryOptions::default());

    let missing = DiscoveryResult::new("/plugins/gone", "gone", PluginFileState::NotFound);
    let err = assert_err!(registry.acquire(&missing, &CancellationToken::new()).await);

    assert!(matches!(err, IpcError::Launch { .. }));
    assert_eq!(launcher.launches(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_discards_handle() {
    let launcher = FakeLauncher::new(FakePlugin::silent_handshake());
    let registry = registry(
        launcher.clone(),
        RegistryOptions {
            handshake_timeout: Duration::from_millis(200),
            ..Default::default()
        },
    );

    let err = registry
        .acquire(&discovery("mute"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, IpcError::HandshakeTimeout { .. }));
    assert!(registry.plugins().is_empty());
}

#[tokio::test]
async fn test_incompatible_protocol_version_fails_handshake() {
    let launcher = FakeLauncher::new(FakePlugin {
        protocol_version: Some("3.0.0".into()),
        ..Default::default()
    });
    let registry = registry(launcher, RegistryOptions::default());

    let err = registry
        .acquire(&discovery("future"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, IpcError::HandshakeFailed { .. }));
}

#[tokio::test]
async fn test_cancelled_waiter_does_not_abort_shared_creation() {
    let launcher = FakeLauncher::slow(FakePlugin::default(), Duration::from_millis(100));
    let registry = registry(launcher.clone(), RegistryOptions::default());

    let impatient = CancellationToken::new();
    let first = {
        let registry = registry.clone();
        let impatient = impatient.clone();
        tokio::spawn(async move { registry.acquire(&discovery("slow"), &impatient).await })
    };
    let second = {
        let registry = registry.clone();
        tokio::spawn(async move {
            registry
                .acquire(&discovery("slow"), &CancellationToken::new())
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    impatient.cancel();

    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(err, IpcError::AcquireCancelled { .. }));

    let lease = second.await.unwrap().unwrap();
    assert_eq!(lease.state(), PluginState::Ready);
    assert_eq!(lease.ref_count(), 1);
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test]
async fn test_release_and_dispose_waits_for_other_leases() {
    let launcher = FakeLauncher::new(FakePlugin::default());
    let registry = registry(launcher.clone(), RegistryOptions::default());
    let cancel = CancellationToken::new();

    let first = registry.acquire(&discovery("x"), &cancel).await.unwrap();
    let second = registry.acquire(&discovery("x"), &cancel).await.unwrap();
    let handle = Arc::clone(first.handle());

    registry.release_and_dispose(first).await;
    assert_eq!(handle.state(), PluginState::Ready);
    assert!(handle.is_dispose_requested());

    registry.release(second).await;
    assert_eq!(handle.state(), PluginState::Disposed);
    assert!(registry.plugins().is_empty());
    assert!(matches!(handle.connection(), Err(IpcError::Disposed(_))));

    let fresh = registry.acquire(&discovery("x"), &cancel).await.unwrap();
    assert_ne!(fresh.instance_id(), handle.instance_id());
    assert_eq!(launcher.launches(), 2);
}

#[tokio::test]
async fn test_dispose_when_idle_policy() {
    let launcher = FakeLauncher::new(FakePlugin::default());
    let registry = registry(
        launcher.clone(),
        RegistryOptions {
            release_policy: ReleasePolicy::DisposeWhenIdle,
            ..Default::default()
        },
    );

    let lease = registry
        .acquire(&discovery("idle"), &CancellationToken::new())
        .await
        .unwrap();
    let handle = Arc::clone(lease.handle());
    registry.release(lease).await;

    assert_eq!(handle.state(), PluginState::Disposed);
    assert!(registry.plugins().is_empty());
}

#[tokio::test]
async fn test_dropped_lease_releases_reference() {
    let launcher = FakeLauncher::new(FakePlugin::default());
    let registry = registry(launcher.clone(), RegistryOptions::default());
    let cancel = CancellationToken::new();

    let lease = registry.acquire(&discovery("drop"), &cancel).await.unwrap();
    let handle = Arc::clone(lease.handle());
    drop(lease);

    assert_eq!(handle.ref_count(), 0);
    assert_eq!(handle.state(), PluginState::Ready);

    let again = registry.acquire(&discovery("drop"), &cancel).await.unwrap();
    assert_eq!(again.instance_id(), handle.instance_id());
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test]
async fn test_dead_plugin_fails_pending_and_is_replaced() {
    let launcher = FakeLauncher::new(FakePlugin {
        credential_response: None,
        ..Default::default()
    });
    let registry = registry(launcher.clone(), RegistryOptions::default());
    let cancel = CancellationToken::new();

    let lease = registry.acquire(&discovery("dying"), &cancel).await.unwrap();
    let dead = Arc::clone(lease.handle());

    let pending = tokio::spawn(async move {
        let result = lease
            .send_request::<GetAuthenticationCredentials>(&credentials_request(), &CancellationToken::new())
            .await;
        (lease, result)
    });

    while launcher.transcript(0).requests_for("GetAuthenticationCredentials").is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    launcher.kill(0);

    let (lease, result) = pending.await.unwrap();
    assert!(matches!(result, Err(IpcError::ConnectionFault(_))));
    assert_eq!(dead.state(), PluginState::Faulted);
    registry.release(lease).await;

    let fresh = registry.acquire(&discovery("dying"), &cancel).await.unwrap();
    assert_ne!(fresh.instance_id(), dead.instance_id());
    assert_eq!(fresh.state(), PluginState::Ready);
    assert_eq!(launcher.launches(), 2);
}

#[tokio::test]
async fn test_faulted_handle_evicted_on_acquire() {
    let launcher = FakeLauncher::new(FakePlugin::default());
    let registry = registry(launcher.clone(), RegistryOptions::default());
    let cancel = CancellationToken::new();

    let lease = registry.acquire(&discovery("flaky"), &cancel).await.unwrap();
    let old = Arc::clone(lease.handle());
    registry.release(lease).await;

    launcher.kill(0);
    while old.state() == PluginState::Ready {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let fresh = registry.acquire(&discovery("flaky"), &cancel).await.unwrap();
    assert_ne!(fresh.instance_id(), old.instance_id());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(old.state(), PluginState::Disposed);
}

#[tokio::test]
async fn test_plugin_log_requests_are_answered() {
    let launcher = FakeLauncher::new(FakePlugin {
        log_after_handshake: true,
        ..Default::default()
    });
    let registry = registry(launcher.clone(), RegistryOptions::default());

    let _lease = registry
        .acquire(&discovery("chatty"), &CancellationToken::new())
        .await
        .unwrap();

    let transcript = launcher.transcript(0);
    while transcript.replies.lock().unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let reply = transcript.replies.lock().unwrap()[0].clone();
    assert_eq!(reply.method, "Log");
    assert_eq!(reply.correlation_id, "plugin-log-1");
    assert_eq!(reply.payload, Some(serde_json::json!({"responseCode": "Success"})));
}

#[tokio::test]
async fn test_shutdown_disposes_everything() {
    let launcher = FakeLauncher::new(FakePlugin::default());
    let registry = registry(launcher.clone(), RegistryOptions::default());
    let cancel = CancellationToken::new();

    let lease = registry.acquire(&discovery("one"), &cancel).await.unwrap();
    let handle = Arc::clone(lease.handle());

    registry.shutdown().await;

    assert_eq!(handle.state(), PluginState::Disposed);
    assert!(registry.plugins().is_empty());
    assert!(registry.is_closed());

    let err = registry.acquire(&discovery("one"), &cancel).await.unwrap_err();
    assert!(matches!(err, IpcError::RegistryClosed));

    // Returning a lease after shutdown is harmless.
    registry.release(lease).await;
    registry.shutdown().await;
}

#[tokio::test]
async fn test_plugin_exiting_after_handshake_is_not_relaunched() {
    let launcher = FakeLauncher::new(FakePlugin::exiting_after_handshake());
    let registry = registry(launcher.clone(), RegistryOptions::default());

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        registry.acquire(&discovery("flaky"), &CancellationToken::new()),
    )
    .await
    .expect("acquire kept relaunching the plugin");

    let err = assert_err!(result);
    assert!(matches!(err, IpcError::ConnectionFault(_)));
    assert_eq!(launcher.launches(), 1);
    assert!(registry.plugins().is_empty());
}
