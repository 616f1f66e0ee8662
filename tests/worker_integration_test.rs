//! Integration tests for the submission worker
//!
//! Drives full passes (render, sign, submit, record) against a scripted
//! transport. Tests that submit more than one document per tenant run on
//! paused time so flow-control waits resolve instantly.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use fiscal_registry::crypto::validate_signature;
use fiscal_registry::infra::{ComplianceNotification, RegistryStore};
use fiscal_registry::metrics::metric_names;
use fiscal_registry::worker::{spawn_worker, WorkerConfig, WorkerMessage};
use fiscal_registry::{
    ComplianceEventType, EntryId, InvoiceDirection, RegistryEntry, TenantId, TransmissionState,
};

use common::*;

async fn create_entries(h: &Harness, tenant_id: TenantId, count: usize) -> Vec<EntryId> {
    let mut ids = Vec::with_capacity(count);
    for n in 0..count {
        let invoice = h.add_invoice(tenant_id, &format!("F-{n:03}")).await;
        let entry = h
            .registry
            .create_entry(invoice, InvoiceDirection::Issued, tenant_id)
            .await
            .unwrap();
        ids.push(entry.id);
    }
    ids
}

async fn entry(h: &Harness, id: EntryId) -> RegistryEntry {
    h.registry.get_entry(id).await.unwrap()
}

/// Make an errored entry due now and reopen the tenant's flow window
async fn make_due(h: &Harness, id: EntryId) {
    let mut due = entry(h, id).await;
    due.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(1));
    h.store.overwrite_entry(due).await;
    h.open_flow_window(h.tenant_id).await;
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_tick_submits_queue_in_chain_order_with_flow_control() {
    let h = Harness::new(fast_backoff(5)).await;
    h.upload_certificate(h.tenant_id).await;
    let ids = create_entries(&h, h.tenant_id, 3).await;

    let report = h.worker().tick().await.unwrap();
    assert_eq!(report.tenants, 1);
    assert_eq!(report.sent, 3);
    assert_eq!(report.blocked, 0);

    let submissions = h.transport.submissions().await;
    assert_eq!(submissions.len(), 3);
    for pair in submissions.windows(2) {
        assert!(pair[1].at.duration_since(pair[0].at) >= Duration::from_secs(60));
    }

    for (n, id) in ids.iter().enumerate() {
        let sent = entry(&h, *id).await;
        assert_eq!(sent.transmission_state, TransmissionState::Sent);
        assert_eq!(
            sent.external_confirmation_code.as_deref(),
            Some(format!("CSV-{:04}", n + 1).as_str())
        );
        assert!(sent.sent_at.is_some());

        // Chain order: the n-th submission carries the n-th document
        let signed = sent.signed_document.clone().unwrap();
        assert_eq!(submissions[n].signed_xml, signed);
        assert!(signed.contains(&format!("F-{n:03}")));

        let validation = validate_signature(&signed, Utc::now()).unwrap();
        assert!(validation.valid, "{:?}", validation.warnings);

        let kinds: Vec<_> = h
            .registry
            .entry_events(*id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                ComplianceEventType::Created,
                ComplianceEventType::Signed,
                ComplianceEventType::Sent
            ]
        );
    }

    let config = h.config(h.tenant_id).await;
    assert!(config.last_submission_at.is_some());
    assert_eq!(h.metrics.get_counter(metric_names::ENTRIES_SENT).await, 3);

    let verification = h.registry.verify_tenant_chain(h.tenant_id).await.unwrap();
    assert!(verification.valid);
}

#[tokio::test]
async fn test_second_tick_inside_window_is_throttled() {
    let h = Harness::new(fast_backoff(5)).await;
    h.upload_certificate(h.tenant_id).await;
    create_entries(&h, h.tenant_id, 1).await;

    let worker = h.worker();
    assert_eq!(worker.tick().await.unwrap().sent, 1);

    create_entries(&h, h.tenant_id, 1).await;
    let report = worker.tick().await.unwrap();
    assert_eq!(report.throttled, 1);
    assert_eq!(report.processed(), 0);
    assert_eq!(h.transport.submissions().await.len(), 1);
}

#[tokio::test]
async fn test_batch_limit_leaves_rest_queued() {
    let h = Harness::new(fast_backoff(5)).await;
    h.upload_certificate(h.tenant_id).await;
    let mut config = h.config(h.tenant_id).await.with_max_records_per_batch(1);
    config.last_submission_at = None;
    h.store.upsert_config(&config).await.unwrap();
    let ids = create_entries(&h, h.tenant_id, 2).await;

    let report = h.worker().tick().await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(entry(&h, ids[0]).await.transmission_state, TransmissionState::Sent);
    assert_eq!(entry(&h, ids[1]).await.transmission_state, TransmissionState::Pending);
}

#[tokio::test]
async fn test_partial_acceptance_is_sent_with_warning() {
    let h = Harness::new(fast_backoff(5)).await;
    h.upload_certificate(h.tenant_id).await;
    let ids = create_entries(&h, h.tenant_id, 1).await;
    h.transport
        .push(Reply::AcceptWithWarning(
            "CSV-W".to_string(),
            remote_error("2004", "Counterparty name differs from census"),
        ))
        .await;

    let report = h.worker().tick().await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(report.warnings, 1);

    let sent = entry(&h, ids[0]).await;
    assert_eq!(sent.transmission_state, TransmissionState::Sent);
    assert_eq!(sent.external_confirmation_code.as_deref(), Some("CSV-W"));

    let events = h.registry.entry_events(ids[0]).await.unwrap();
    let sent_event = events.last().unwrap();
    assert_eq!(sent_event.event_type, ComplianceEventType::Sent);
    assert!(sent_event.payload["warning"]
        .as_str()
        .unwrap()
        .contains("2004"));
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_unreachable_service_schedules_retry() {
    let h = Harness::new(fast_backoff(5)).await;
    h.upload_certificate(h.tenant_id).await;
    let ids = create_entries(&h, h.tenant_id, 1).await;
    h.transport.push(Reply::Unreachable).await;

    let worker = h.worker();
    let report = worker.tick().await.unwrap();
    assert_eq!(report.retrying, 1);

    let failed = entry(&h, ids[0]).await;
    assert_eq!(failed.transmission_state, TransmissionState::Error);
    assert_eq!(failed.retry_count, 1);
    let retry_at = failed.next_retry_at.unwrap();
    assert!(retry_at > Utc::now() + chrono::Duration::seconds(50));
    assert!(failed.last_error.unwrap().contains("connection refused"));

    // Not due yet
    h.open_flow_window(h.tenant_id).await;
    assert_eq!(worker.tick().await.unwrap().processed(), 0);

    make_due(&h, ids[0]).await;
    let report = worker.tick().await.unwrap();
    assert_eq!(report.sent, 1);

    let sent = entry(&h, ids[0]).await;
    assert_eq!(sent.transmission_state, TransmissionState::Sent);
    assert!(sent.last_error.is_none());
    assert!(sent.next_retry_at.is_none());
}

#[tokio::test]
async fn test_rejection_is_final_and_notified() {
    let h = Harness::new(fast_backoff(5)).await;
    h.upload_certificate(h.tenant_id).await;
    let ids = create_entries(&h, h.tenant_id, 1).await;
    h.transport
        .push(Reply::Reject(remote_error("4102", "Invalid document number")))
        .await;

    let worker = h.worker();
    let report = worker.tick().await.unwrap();
    assert_eq!(report.rejected, 1);

    let rejected = entry(&h, ids[0]).await;
    assert_eq!(rejected.transmission_state, TransmissionState::Rejected);
    assert!(rejected.external_confirmation_code.is_none());
    assert_eq!(
        rejected.last_error.as_deref(),
        Some("[4102] Invalid document number")
    );

    let notifications = h.notifier.received().await;
    assert!(notifications
        .iter()
        .any(|n| matches!(n, ComplianceNotification::SubmissionRejected { .. })));

    h.open_flow_window(h.tenant_id).await;
    assert_eq!(worker.tick().await.unwrap().processed(), 0);
    assert_eq!(h.transport.submissions().await.len(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_stop_and_notify() {
    let h = Harness::new(fast_backoff(2)).await;
    h.upload_certificate(h.tenant_id).await;
    let ids = create_entries(&h, h.tenant_id, 1).await;
    h.transport
        .push(Reply::Fail(remote_error("3000", "Service busy")))
        .await;
    h.transport
        .push(Reply::Fail(remote_error("3000", "Service busy")))
        .await;

    let worker = h.worker();
    assert_eq!(worker.tick().await.unwrap().retrying, 1);

    make_due(&h, ids[0]).await;
    let report = worker.tick().await.unwrap();
    assert_eq!(report.failed, 1);

    let exhausted = entry(&h, ids[0]).await;
    assert_eq!(exhausted.transmission_state, TransmissionState::Error);
    assert_eq!(exhausted.retry_count, 2);
    assert!(exhausted.next_retry_at.is_none());

    let notifications = h.notifier.received().await;
    assert!(notifications.iter().any(|n| matches!(
        n,
        ComplianceNotification::SubmissionFailed { entry_id, .. } if *entry_id == ids[0]
    )));

    // Manual requeue brings it back
    h.registry.requeue(ids[0]).await.unwrap();
    h.open_flow_window(h.tenant_id).await;
    assert_eq!(worker.tick().await.unwrap().sent, 1);
}

#[tokio::test]
async fn test_missing_certificate_blocks_only_that_tenant() {
    let h = Harness::new(fast_backoff(5)).await;
    h.upload_certificate(h.tenant_id).await;
    let other = TenantId::new();
    h.add_tenant(other).await;

    let ours = create_entries(&h, h.tenant_id, 1).await;
    let theirs = create_entries(&h, other, 1).await;

    let report = h.worker().tick().await.unwrap();
    assert_eq!(report.tenants, 2);
    assert_eq!(report.sent, 1);
    assert_eq!(report.blocked, 1);

    assert_eq!(entry(&h, ours[0]).await.transmission_state, TransmissionState::Sent);
    assert_eq!(
        entry(&h, theirs[0]).await.transmission_state,
        TransmissionState::Pending
    );

    let notifications = h.notifier.received().await;
    assert!(notifications.iter().any(|n| matches!(
        n,
        ComplianceNotification::TenantBlocked { tenant_id, .. } if *tenant_id == other
    )));
    assert!(h
        .transport
        .submissions()
        .await
        .iter()
        .all(|s| s.tenant_id == h.tenant_id));
}

#[tokio::test]
async fn test_disabled_auto_submit_is_left_alone() {
    let h = Harness::new(fast_backoff(5)).await;
    h.upload_certificate(h.tenant_id).await;
    let mut config = h.config(h.tenant_id).await;
    config.auto_submit = false;
    h.store.upsert_config(&config).await.unwrap();
    create_entries(&h, h.tenant_id, 1).await;

    let report = h.worker().tick().await.unwrap();
    assert_eq!(report.tenants, 0);
    assert!(h.transport.submissions().await.is_empty());
}

#[tokio::test]
async fn test_failed_flow_stamp_releases_claim_for_retry() {
    let mut flaky = None;
    let h = Harness::with_store(fast_backoff(5), |store| {
        let wrapped = Arc::new(FlakyStore::new(store));
        flaky = Some(wrapped.clone());
        wrapped as Arc<dyn RegistryStore>
    })
    .await;
    let flaky = flaky.unwrap();
    h.upload_certificate(h.tenant_id).await;
    let ids = create_entries(&h, h.tenant_id, 1).await;
    flaky.fail_stamps(1);

    let worker = h.worker();
    let report = worker.tick().await.unwrap();
    assert_eq!(report.retrying, 1);
    assert!(h.transport.submissions().await.is_empty());

    let released = entry(&h, ids[0]).await;
    assert_eq!(released.transmission_state, TransmissionState::Error);
    assert_eq!(released.retry_count, 1);
    assert!(released.next_retry_at.is_some());
    assert!(released
        .last_error
        .unwrap()
        .starts_with("submission interrupted"));

    make_due(&h, ids[0]).await;
    assert_eq!(worker.tick().await.unwrap().sent, 1);
    assert_eq!(entry(&h, ids[0]).await.transmission_state, TransmissionState::Sent);
}

#[tokio::test]
async fn test_stale_sending_claim_is_released() {
    let h = Harness::new(fast_backoff(5)).await;
    let ids = create_entries(&h, h.tenant_id, 1).await;
    // A claim whose owner never came back
    h.registry.begin_submission(ids[0]).await.unwrap().unwrap();

    h.worker().tick().await.unwrap();
    assert_eq!(
        entry(&h, ids[0]).await.transmission_state,
        TransmissionState::Sending
    );

    let impatient = h.worker_with(WorkerConfig {
        claim_timeout: Duration::ZERO,
        ..WorkerConfig::default()
    });
    impatient.tick().await.unwrap();

    let released = entry(&h, ids[0]).await;
    assert_eq!(released.transmission_state, TransmissionState::Error);
    assert_eq!(released.retry_count, 1);
    assert!(released.next_retry_at.is_some());
    assert!(released
        .last_error
        .unwrap()
        .contains("never recorded an outcome"));
    assert_eq!(
        h.metrics
            .get_counter(metric_names::CLAIMS_RELEASED)
            .await,
        1
    );

    let events = h.registry.entry_events(ids[0]).await.unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.event_type, ComplianceEventType::Error);
    assert_eq!(last.payload["kind"], "stale_claim");
}

// ============================================================================
// Seal credential
// ============================================================================

async fn enable_seal(h: &Harness) {
    let mut config = h.config(h.tenant_id).await;
    config.use_seal_credential = true;
    h.store.upsert_config(&config).await.unwrap();
}

#[tokio::test]
async fn test_seal_mode_presents_seal_identity() {
    let h = Harness::new(fast_backoff(5)).await;
    h.upload_certificate(h.tenant_id).await;
    h.upload_seal_certificate(h.tenant_id).await;
    enable_seal(&h).await;
    create_entries(&h, h.tenant_id, 1).await;

    let report = h.worker().tick().await.unwrap();
    assert_eq!(report.sent, 1);

    let submissions = h.transport.submissions().await;
    assert_eq!(submissions[0].identity_subject, format!("CN={SEAL_CN}"));

    // The document itself is still signed with the signing certificate
    let check = validate_signature(&submissions[0].signed_xml, Utc::now()).unwrap();
    assert_eq!(check.certificate.unwrap().subject, format!("CN={SIGNER_CN}"));
}

#[tokio::test]
async fn test_default_mode_presents_signing_identity() {
    let h = Harness::new(fast_backoff(5)).await;
    h.upload_certificate(h.tenant_id).await;
    h.upload_seal_certificate(h.tenant_id).await;
    create_entries(&h, h.tenant_id, 1).await;

    h.worker().tick().await.unwrap();
    let submissions = h.transport.submissions().await;
    assert_eq!(submissions[0].identity_subject, format!("CN={SIGNER_CN}"));
}

#[tokio::test]
async fn test_seal_mode_without_seal_certificate_blocks_tenant() {
    let h = Harness::new(fast_backoff(5)).await;
    h.upload_certificate(h.tenant_id).await;
    enable_seal(&h).await;
    let ids = create_entries(&h, h.tenant_id, 1).await;

    let report = h.worker().tick().await.unwrap();
    assert_eq!(report.blocked, 1);
    assert!(h.transport.submissions().await.is_empty());
    assert_eq!(
        entry(&h, ids[0]).await.transmission_state,
        TransmissionState::Pending
    );

    let notifications = h.notifier.received().await;
    assert!(notifications.iter().any(|n| matches!(
        n,
        ComplianceNotification::TenantBlocked { reason, .. }
            if reason.contains("no seal certificate")
    )));
}

// ============================================================================
// Service loop
// ============================================================================

#[tokio::test]
async fn test_spawned_worker_drains_and_stops() {
    let h = Harness::new(fast_backoff(5)).await;
    h.upload_certificate(h.tenant_id).await;
    let ids = create_entries(&h, h.tenant_id, 1).await;

    let (handle, control) = spawn_worker(h.worker());
    control.send(WorkerMessage::TickNow).await.unwrap();

    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if entry(&h, ids[0]).await.transmission_state == TransmissionState::Sent {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "worker never submitted the entry");

    assert!(h.coordinator.graceful_shutdown(Duration::from_secs(5)).await);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
    assert_eq!(h.transport.submissions().await.len(), 1);
}
