//! End-to-end connect scenarios over mock transports

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{hop, host_key, next_disconnect, BrokenForwarding, Fixture, ALGORITHM};
use panemux::config::LayoutSettings;
use panemux::pane::Orientation;
use panemux::session::{
    ConnectionEvent, DisconnectSource, SerialParams, SessionState, SessionTarget,
};
use panemux::ssh::{
    fingerprint_sha256, AuthMethod, ConnectError, FingerprintRecord, JumpHost, PromptChannel,
    PromptRequest, SshTarget, TrustStore,
};
use panemux::{OrchestratorError, PaneOrchestrator};

fn direct(host_id: &str) -> SessionTarget {
    SessionTarget::Ssh(SshTarget::direct(hop(host_id, AuthMethod::password("secret"))))
}

/// Fixture with profile "dmz": jump1 -> jump2 -> target
fn chained_fixture() -> Fixture {
    let mut fixture = Fixture::new();
    fixture.resolver.add_profile(
        "dmz",
        vec![
            JumpHost::new("jump1", "jump1.internal", "ops"),
            JumpHost::new("jump2", "jump2.internal", "ops"),
        ],
    );
    fixture.credentials.insert("jump1", AuthMethod::password("j1"));
    fixture.credentials.insert("jump2", AuthMethod::password("j2"));
    fixture
}

#[tokio::test]
async fn known_fingerprint_skips_verification_prompt() {
    let fixture = Fixture::new();
    fixture
        .trust
        .upsert_fingerprint(FingerprintRecord::trusted(
            "web",
            ALGORITHM,
            fingerprint_sha256(&host_key("web")),
        ))
        .unwrap();
    let connector = fixture.connector();
    let session = connector.registry().create(direct("web")).unwrap();

    connector
        .connect_ssh(&session, &CancellationToken::new())
        .await
        .unwrap();

    assert!(fixture.prompt.host_key_calls.lock().is_empty());
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test]
async fn first_contact_prompts_once_then_trusts() {
    let fixture = Fixture::new();
    let connector = fixture.connector();
    let cancel = CancellationToken::new();

    let first = connector.registry().create(direct("web")).unwrap();
    connector.connect_ssh(&first, &cancel).await.unwrap();
    let second = connector.registry().create(direct("web")).unwrap();
    connector.connect_ssh(&second, &cancel).await.unwrap();

    assert_eq!(*fixture.prompt.host_key_calls.lock(), vec!["web".to_string()]);
    let stored = fixture.trust.get_fingerprint("web", ALGORITHM).unwrap().unwrap();
    assert_eq!(stored.fingerprint, fingerprint_sha256(&host_key("web")));
    assert!(stored.is_trusted);
}

#[tokio::test]
async fn changed_key_rejected_keeps_old_record() {
    let fixture = Fixture::new();
    fixture
        .trust
        .upsert_fingerprint(FingerprintRecord::trusted("web", ALGORITHM, "SHA256:old"))
        .unwrap();
    fixture.prompt.reject_hosts.lock().insert("web".into());
    let connector = fixture.connector();
    let session = connector.registry().create(direct("web")).unwrap();

    let err = connector
        .connect_ssh(&session, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectError::HostKeyRejected { .. }));
    let stored = fixture.trust.get_fingerprint("web", ALGORITHM).unwrap().unwrap();
    assert_eq!(stored.fingerprint, "SHA256:old");
}

#[tokio::test]
async fn chain_connects_hops_in_order() {
    let fixture = chained_fixture();
    let connector = fixture.connector();
    let target = SessionTarget::Ssh(SshTarget::via(
        hop("web", AuthMethod::password("secret")),
        "dmz",
    ));
    let session = connector.registry().create(target).unwrap();

    connector
        .connect_ssh(&session, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        fixture.journal().entries(),
        vec![
            "connect jump1",
            "tunnel jump1->jump2.internal",
            "connect jump2 (tunnelled)",
            "tunnel jump2->web.internal",
            "connect web (tunnelled)",
            "terminal web",
        ]
    );
    // A distinct key per hop, each trusted on first use
    assert_eq!(fixture.trust.len(), 3);
}

#[tokio::test]
async fn rejected_middle_hop_fails_closed() {
    let fixture = chained_fixture();
    fixture.prompt.reject_hosts.lock().insert("jump2".into());
    let connector = fixture.connector();
    let mut events = connector.subscribe();
    let target = SessionTarget::Ssh(SshTarget::via(
        hop("web", AuthMethod::password("secret")),
        "dmz",
    ));
    let session = connector.registry().create(target).unwrap();

    let err = connector
        .connect_ssh(&session, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectError::HostKeyRejected { ref host, .. } if host == "jump2.internal"));
    assert!(fixture.trust.records_for_host("jump2").is_empty());
    assert_eq!(fixture.trust.records_for_host("jump1").len(), 1);
    assert!(fixture.journal().contains("close jump1"));
    assert!(!fixture.journal().contains("connect web (tunnelled)"));
    assert!(matches!(session.state(), SessionState::Failed { .. }));
    assert!(!fixture.history.entries()[0].success);
    assert!(matches!(
        events.recv().await.unwrap(),
        ConnectionEvent::Completed { success: false, .. }
    ));
}

#[tokio::test]
async fn missing_jump_credentials_fall_back_to_direct() {
    let fixture = chained_fixture();
    fixture.credentials.remove("jump2");
    let connector = fixture.connector();
    let target = SessionTarget::Ssh(SshTarget::via(
        hop("web", AuthMethod::password("secret")),
        "dmz",
    ));
    let session = connector.registry().create(target).unwrap();

    connector
        .connect_ssh(&session, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        fixture.journal().entries(),
        vec!["connect web", "terminal web"]
    );
}

#[tokio::test]
async fn cancellation_mid_chain_releases_established_hops() {
    let fixture = chained_fixture();
    *fixture.ssh.hang_on.lock() = Some("jump2".into());
    let connector = fixture.connector();
    let target = SessionTarget::Ssh(SshTarget::via(
        hop("web", AuthMethod::password("secret")),
        "dmz",
    ));
    let session = connector.registry().create(target).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = connector.connect_ssh(&session, &cancel).await.unwrap_err();
    assert!(matches!(err, ConnectError::Cancelled));
    assert!(fixture.journal().contains("close jump1"));
    assert!(session.connection().is_none());
}

#[tokio::test]
async fn keyboard_interactive_cancel_fails_attempt() {
    let fixture = Fixture::new();
    let connector = fixture.connector();
    let target = SessionTarget::Ssh(SshTarget::direct(hop(
        "bastion",
        AuthMethod::KeyboardInteractive,
    )));
    let session = connector.registry().create(target).unwrap();
    let cancel = CancellationToken::new();

    let err = connector.connect_ssh(&session, &cancel).await.unwrap_err();
    assert!(matches!(err, ConnectError::AuthenticationCancelled));
    assert_eq!(fixture.prompt.kbi_calls.load(Ordering::SeqCst), 1);

    *fixture.prompt.kbi_answer.lock() = Some(vec!["123456".into()]);
    connector.connect_ssh(&session, &cancel).await.unwrap();
    assert_eq!(fixture.prompt.kbi_calls.load(Ordering::SeqCst), 2);
    assert!(session.is_connected());
}

#[tokio::test]
async fn forwarding_failure_does_not_fail_connect() {
    let mut fixture = Fixture::new();
    fixture.forwarding = Arc::new(BrokenForwarding);
    let connector = fixture.connector();
    let session = connector.registry().create(direct("web")).unwrap();

    connector
        .connect_ssh(&session, &CancellationToken::new())
        .await
        .unwrap();
    assert!(session.is_connected());
    assert!(fixture.history.entries()[0].success);
}

#[tokio::test]
async fn prompt_channel_drives_host_key_decision() {
    let fixture = Fixture::new();
    let (channel, mut requests) = PromptChannel::new(4, Duration::from_secs(5));
    let channel = Arc::new(channel);
    let connector = panemux::session::SessionConnector::new(panemux::session::ConnectorDeps {
        registry: Arc::new(panemux::session::SessionRegistry::new()),
        ssh: fixture.ssh.clone(),
        serial: fixture.serial.clone(),
        resolver: Arc::new(fixture.resolver.clone()),
        credentials: fixture.credentials.clone(),
        trust_store: fixture.trust.clone(),
        host_key_prompt: channel.clone(),
        kbi_prompt: channel,
        history: fixture.history.clone(),
        forwarding: fixture.forwarding.clone(),
        reconnect: Default::default(),
        terminal_size: Default::default(),
    });

    let ui = tokio::spawn(async move {
        let fingerprint = match requests.recv().await {
            Some(PromptRequest::HostKey { request, reply }) => {
                reply.send(true);
                request.fingerprint
            }
            other => panic!("unexpected prompt: {:?}", other),
        };
        (fingerprint, requests)
    });

    let cancel = CancellationToken::new();
    let first = connector.registry().create(direct("web")).unwrap();
    connector.connect_ssh(&first, &cancel).await.unwrap();
    let (fingerprint, mut requests) = ui.await.unwrap();
    assert_eq!(fingerprint, fingerprint_sha256(&host_key("web")));

    // Trusted now: the second session never reaches the UI
    let second = connector.registry().create(direct("web")).unwrap();
    connector.connect_ssh(&second, &cancel).await.unwrap();
    assert!(requests.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn serial_exhaustion_reports_disconnect_once() {
    let fixture = Fixture::new();
    let connector = fixture.connector();
    let mut events = connector.subscribe();
    let session = connector
        .registry()
        .create(SessionTarget::Serial(SerialParams::new("/dev/ttyUSB0", 115200)))
        .unwrap();
    connector
        .connect_serial(&session, &CancellationToken::new())
        .await
        .unwrap();

    fixture.serial.failing.store(true, Ordering::SeqCst);
    let publisher = fixture.serial.publishers.lock().last().cloned().unwrap();
    let bridge = connector.lifecycle_publisher(&session.id).unwrap();
    publisher.publish(DisconnectSource::Connection, "read error");
    bridge.publish(DisconnectSource::Bridge, "pipe closed");

    let first = next_disconnect(&mut events, Duration::from_secs(60)).await;
    assert_eq!(first.as_deref(), Some("read error"));
    assert_eq!(fixture.serial.opens.load(Ordering::SeqCst), 4);
    assert_eq!(session.state(), SessionState::Disconnected);

    assert_eq!(next_disconnect(&mut events, Duration::from_secs(60)).await, None);

    // Manual connect re-arms auto-reconnect
    fixture.serial.failing.store(false, Ordering::SeqCst);
    connector
        .connect_serial(&session, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(connector.supervisor().attempt_count(&session.id), 0);
    assert!(session.is_connected());
}

#[tokio::test]
async fn ssh_drop_is_not_retried() {
    let fixture = Fixture::new();
    let connector = fixture.connector();
    let mut events = connector.subscribe();
    let session = connector.registry().create(direct("web")).unwrap();
    connector
        .connect_ssh(&session, &CancellationToken::new())
        .await
        .unwrap();

    let publisher = fixture.ssh.publishers.lock().last().cloned().unwrap();
    publisher.publish(DisconnectSource::Transport, "keepalive timeout");

    let reason = next_disconnect(&mut events, Duration::from_secs(5)).await;
    assert_eq!(reason.as_deref(), Some("keepalive timeout"));
    assert_eq!(
        fixture
            .journal()
            .entries()
            .iter()
            .filter(|e| e.starts_with("connect"))
            .count(),
        1
    );
    assert!(fixture.journal().contains("close terminal web"));
}

#[tokio::test]
async fn orchestrator_split_connect_and_close() {
    let fixture = Fixture::new();
    let mut orch = PaneOrchestrator::new(fixture.connector(), LayoutSettings::default()).unwrap();
    let cancel = CancellationToken::new();

    let root = orch.create_root(Some(direct("db"))).await.unwrap();
    orch.connect(root, &cancel).await.unwrap();
    let right = orch
        .split_and_connect(root, Orientation::Vertical, direct("web"), &cancel)
        .await
        .unwrap();
    assert_eq!(orch.tree().focused(), Some(right));
    assert_eq!(orch.connector().registry().len(), 2);

    let web = orch.session_for(right).unwrap();
    let connection = web.connection().unwrap();
    orch.close(right).await.unwrap();

    assert!(!connection.is_alive());
    assert_eq!(orch.connector().registry().len(), 1);
    assert_eq!(orch.tree().root(), Some(root));
    assert_eq!(orch.tree().focused(), Some(root));
}

#[tokio::test]
async fn orchestrator_mirror_shares_connection() {
    let fixture = Fixture::new();
    let mut orch = PaneOrchestrator::new(fixture.connector(), LayoutSettings::default()).unwrap();
    let cancel = CancellationToken::new();

    let root = orch.create_root(Some(direct("web"))).await.unwrap();
    orch.connect(root, &cancel).await.unwrap();
    let mirror = orch.mirror(root, Orientation::Horizontal).unwrap();
    let session = orch.session_for(mirror).unwrap();

    orch.close(root).await.unwrap();
    assert!(session.is_connected());
    assert!(orch.tree().leaf(mirror).unwrap().is_primary_for_session);

    orch.close(mirror).await.unwrap();
    assert!(orch.connector().registry().is_empty());
    assert!(orch.tree().is_empty());
    assert!(matches!(
        orch.session_for(mirror),
        Err(OrchestratorError::Layout(_))
    ));
}
