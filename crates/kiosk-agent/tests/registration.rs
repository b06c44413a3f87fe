//! Registration state machine against the mock backend.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;

use kiosk_agent::{stop_channel, AgentError, AgentEvent, CredentialStore, RegistrationMachine, RegistrationState};
use kiosk_core::{DeviceCredentials, DeviceStatus};

use common::{events, MockBackend, API_KEY};

async fn machine(backend: &MockBackend, dir: &std::path::Path) -> (RegistrationMachine, CredentialStore, kiosk_agent::EventBus) {
    let store = CredentialStore::open(dir).await.unwrap();
    let bus = events();
    let machine = RegistrationMachine::new(
        backend.client(dir),
        store.clone(),
        bus.clone(),
        11,
        Duration::from_millis(50),
    );
    (machine, store, bus)
}

#[tokio::test]
async fn test_claim_persists_qr_issued() {
    let backend = MockBackend::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (machine, store, bus) = machine(&backend, dir.path()).await;
    let mut rx = bus.subscribe();

    backend.state.set_claim(
        201,
        json!({
            "AssignedGuid": "guid-9",
            "AccessToken": "tok",
            "QrCodeImage": "data:image/png;base64,AAAA",
            "Url": "https://portal.example.com/claim/ABC123"
        }),
    );

    let ticket = machine.request_claim().await.unwrap();
    assert_eq!(ticket.assigned_guid, "guid-9");
    assert_eq!(ticket.activation_code.as_deref(), Some("ABC123"));
    assert_eq!(ticket.qr_png_base64(), Some("AAAA"));

    let creds = store.get().unwrap();
    assert_eq!(creds.device_status, DeviceStatus::QrIssued);
    assert_eq!(creds.access_token, "tok");
    assert!(store.registration_path().exists());
    assert_eq!(machine.state().await, RegistrationState::QrIssued);

    let mut saw_ticket = false;
    while let Ok(event) = rx.try_recv() {
        if let AgentEvent::ClaimIssued(t) = event {
            assert_eq!(t.assigned_guid, "guid-9");
            saw_ticket = true;
        }
    }
    assert!(saw_ticket);
}

#[tokio::test]
async fn test_claim_failure_persists_nothing() {
    let backend = MockBackend::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (machine, store, _bus) = machine(&backend, dir.path()).await;

    backend.state.set_claim(500, json!({"error": "boom"}));
    assert!(machine.request_claim().await.is_err());
    assert!(store.get().is_none());
    assert!(!store.registration_path().exists());
    assert_eq!(machine.state().await, RegistrationState::Unregistered);
}

#[tokio::test]
async fn test_claimed_without_key_is_not_activated() {
    let backend = MockBackend::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (machine, store, _bus) = machine(&backend, dir.path()).await;
    store.set(DeviceCredentials::issued("guid-1", "tok")).await.unwrap();

    backend.state.set_status(
        200,
        json!({"DeviceStatus": "Claimed", "ApiKey": null, "BranchId": 2, "Branch": "Downtown"}),
    );

    let state = machine.poll_status().await.unwrap();
    assert_eq!(state, RegistrationState::Claimed);

    let creds = store.get().unwrap();
    assert_eq!(creds.device_status, DeviceStatus::Claimed);
    assert!(creds.api_key.is_none());
    assert!(!creds.is_activated());
    assert_eq!(creds.branch_id, Some(2));
}

#[tokio::test]
async fn test_activation_fetches_branch_once() {
    let backend = MockBackend::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (machine, store, bus) = machine(&backend, dir.path()).await;
    let mut rx = bus.subscribe();
    store.set(DeviceCredentials::issued("guid-1", "tok")).await.unwrap();

    backend
        .state
        .set_status(200, json!({"deviceStatus": "Activated", "apiKey": API_KEY}));
    backend.state.set_branch(
        200,
        json!({"success": {"id": 2, "name": "Downtown", "city": "Lahore", "phone": "123"}}),
    );

    assert_eq!(machine.poll_status().await.unwrap(), RegistrationState::Activated);

    let creds = store.get().unwrap();
    assert!(creds.is_activated());
    assert_eq!(creds.api_key(), Some(API_KEY));

    let branch = store.branch().await.unwrap();
    assert_eq!(branch.name.as_deref(), Some("Downtown"));
    assert_eq!(branch.extra.get("phone"), Some(&json!("123")));
    assert!(store.branch_path().exists());

    let mut activated = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, AgentEvent::Activated { .. }) {
            activated = true;
        }
    }
    assert!(activated);
}

#[tokio::test]
async fn test_branch_failure_does_not_block_activation() {
    let backend = MockBackend::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (machine, store, _bus) = machine(&backend, dir.path()).await;
    store.set(DeviceCredentials::issued("guid-1", "tok")).await.unwrap();

    backend
        .state
        .set_status(200, json!({"DeviceStatus": "Activated", "ApiKey": API_KEY}));
    backend.state.set_branch(500, json!({"error": "down"}));

    assert_eq!(machine.poll_status().await.unwrap(), RegistrationState::Activated);
    assert!(store.get().unwrap().is_activated());
    assert!(store.branch().await.is_none());

    // Retried on the next attempt
    backend.state.set_branch(200, json!({"id": 2, "name": "Downtown"}));
    let branch = machine.ensure_branch_info().await.unwrap().unwrap();
    assert_eq!(branch.id, Some(2));
}

#[tokio::test]
async fn test_resume_skips_claim() {
    let backend = MockBackend::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (machine, store, _bus) = machine(&backend, dir.path()).await;
    store.set(DeviceCredentials::issued("guid-1", "tok")).await.unwrap();

    backend
        .state
        .set_status(200, json!({"DeviceStatus": "Activated", "ApiKey": API_KEY}));
    backend.state.set_branch(200, json!({"id": 2}));

    let (_stop_tx, stop_rx) = stop_channel();
    let creds = tokio::time::timeout(Duration::from_secs(5), machine.run_until_activated(stop_rx))
        .await
        .unwrap()
        .unwrap();

    assert!(creds.is_activated());
    assert_eq!(backend.state.claim_hits.load(Ordering::SeqCst), 0);
    assert!(backend.state.status_hits.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_full_claim_flow() {
    let backend = MockBackend::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (machine, store, _bus) = machine(&backend, dir.path()).await;

    backend
        .state
        .set_claim(200, json!({"assignedGuid": "guid-2", "accessToken": "tok"}));
    backend
        .state
        .set_status(200, json!({"DeviceStatus": "Activated", "ApiKey": API_KEY}));
    backend.state.set_branch(200, json!({"id": 2}));

    let (_stop_tx, stop_rx) = stop_channel();
    let creds = tokio::time::timeout(Duration::from_secs(5), machine.run_until_activated(stop_rx))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(creds.assigned_guid, "guid-2");
    assert_eq!(backend.state.claim_hits.load(Ordering::SeqCst), 1);
    assert_eq!(store.get().unwrap(), creds);
}

#[tokio::test]
async fn test_cancel_stops_polling() {
    let backend = MockBackend::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (machine, store, _bus) = machine(&backend, dir.path()).await;
    store.set(DeviceCredentials::issued("guid-1", "tok")).await.unwrap();
    backend.state.set_status(200, json!({"DeviceStatus": "QR issued"}));

    let canceller = machine.canceller();
    let (_stop_tx, stop_rx) = stop_channel();
    let run = machine.run_until_activated(stop_rx);
    tokio::pin!(run);

    tokio::select! {
        _ = &mut run => panic!("should still be polling"),
        _ = tokio::time::sleep(Duration::from_millis(200)) => {}
    }
    canceller.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), run).await.unwrap();
    assert!(matches!(result, Err(AgentError::Cancelled)));
    assert_eq!(machine.state().await, RegistrationState::Cancelled);
    // Partial state is kept for the next launch
    assert_eq!(store.get().unwrap().device_status, DeviceStatus::QrIssued);
}

#[tokio::test]
async fn test_stop_signal_ends_run() {
    let backend = MockBackend::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (machine, store, _bus) = machine(&backend, dir.path()).await;
    store.set(DeviceCredentials::issued("guid-1", "tok")).await.unwrap();
    backend.state.set_status(200, json!({"DeviceStatus": "Claimed"}));

    let (stop_tx, stop_rx) = stop_channel();
    stop_tx.stop();

    let result = tokio::time::timeout(Duration::from_secs(2), machine.run_until_activated(stop_rx))
        .await
        .unwrap();
    assert!(matches!(result, Err(AgentError::ShuttingDown)));
}

#[tokio::test]
async fn test_cancel_outside_a_run_does_not_block_next_run() {
    let backend = MockBackend::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (machine, store, _bus) = machine(&backend, dir.path()).await;
    store.set(common::activated_credentials()).await.unwrap();
    backend.state.set_branch(200, json!({"id": 2}));

    let (_stop_tx, stop_rx) = stop_channel();
    machine.run_until_activated(stop_rx.clone()).await.unwrap();

    // Cancel while activated, then the device is deleted
    machine.canceller().cancel();
    store.delete().await.unwrap();

    backend
        .state
        .set_claim(200, json!({"assignedGuid": "guid-3", "accessToken": "tok"}));
    backend
        .state
        .set_status(200, json!({"DeviceStatus": "Activated", "ApiKey": API_KEY}));

    let creds = tokio::time::timeout(Duration::from_secs(5), machine.run_until_activated(stop_rx))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(creds.assigned_guid, "guid-3");
    assert_eq!(backend.state.claim_hits.load(Ordering::SeqCst), 1);
}
