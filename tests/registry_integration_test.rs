//! Integration tests for the registry lifecycle
//!
//! Covers entry creation and chaining, certificate custody and chain
//! verification against in-memory collaborators.

mod common;

use chrono::Utc;
use rust_decimal_macros::dec;
use secrecy::SecretString;

use fiscal_registry::crypto::{compute_hash, ChainBreak};
use fiscal_registry::infra::{ComplianceNotification, RegistryStore};
use fiscal_registry::{
    ComplianceEventType, InvoiceDirection, RegistryError, TenantId, TransmissionState,
};

use common::*;

// ============================================================================
// Entry creation
// ============================================================================

#[tokio::test]
async fn test_entries_chain_across_directions() {
    let h = Harness::new(fast_backoff(5)).await;
    let issued = h.add_invoice(h.tenant_id, "F-2024-001").await;
    let received = h
        .add_invoice_with(h.tenant_id, "PROV-77", InvoiceDirection::Received, dec!(50))
        .await;

    let first = h
        .registry
        .create_entry(issued, InvoiceDirection::Issued, h.tenant_id)
        .await
        .unwrap();
    let second = h
        .registry
        .create_entry(received, InvoiceDirection::Received, h.tenant_id)
        .await
        .unwrap();

    assert_eq!(first.sequence_number, 1);
    assert!(first.previous_hash.is_none());
    assert_eq!(second.sequence_number, 2);
    assert_eq!(second.previous_hash.as_deref(), Some(first.current_hash.as_str()));

    // Received invoices are issued by the provider
    assert_eq!(second.issuer_tax_id, "A87654321");
    assert_eq!(second.counterparty_tax_id, TENANT_TAX_ID);

    let expected = compute_hash(&second.chain_fields(), second.previous_hash.as_deref());
    assert_eq!(second.current_hash, expected);

    assert_eq!(h.config(h.tenant_id).await.last_sequence_number, 2);
    for entry in [&first, &second] {
        assert_eq!(entry.transmission_state, TransmissionState::Pending);
        let events = h.registry.entry_events(entry.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, ComplianceEventType::Created);
    }
}

#[tokio::test]
async fn test_qr_payload_embeds_hash_prefix() {
    let h = Harness::new(fast_backoff(5)).await;
    let invoice = h.add_invoice(h.tenant_id, "F-2024-001").await;
    let entry = h
        .registry
        .create_entry(invoice, InvoiceDirection::Issued, h.tenant_id)
        .await
        .unwrap();

    let expected = format!(
        "{TENANT_TAX_ID}|F-2024-001|15-03-2024|121.00|{}",
        &entry.current_hash[..8]
    );
    assert_eq!(entry.qr_payload, expected);
    assert!(entry.qr_target_url.contains("numserie=F-2024-001"));
    assert!(entry
        .qr_target_url
        .contains(&format!("huella={}", &entry.current_hash[..8])));
}

#[tokio::test]
async fn test_tenants_have_independent_sequences() {
    let h = Harness::new(fast_backoff(5)).await;
    let other = TenantId::new();
    h.add_tenant(other).await;

    for n in 0..3 {
        let invoice = h.add_invoice(h.tenant_id, &format!("A-{n}")).await;
        h.registry
            .create_entry(invoice, InvoiceDirection::Issued, h.tenant_id)
            .await
            .unwrap();
    }
    let invoice = h.add_invoice(other, "B-0").await;
    let entry = h
        .registry
        .create_entry(invoice, InvoiceDirection::Issued, other)
        .await
        .unwrap();

    assert_eq!(entry.sequence_number, 1);
    assert!(entry.previous_hash.is_none());
    assert_eq!(h.store.entry_count(h.tenant_id).await, 3);
    assert_eq!(h.store.entry_count(other).await, 1);
}

#[tokio::test]
async fn test_concurrent_creation_yields_gapless_chain() {
    let h = Harness::new(fast_backoff(5)).await;
    let mut invoices = Vec::new();
    for n in 0..10 {
        invoices.push(h.add_invoice(h.tenant_id, &format!("C-{n}")).await);
    }

    let mut tasks = tokio::task::JoinSet::new();
    for invoice in invoices {
        let registry = h.registry.clone();
        let tenant_id = h.tenant_id;
        tasks.spawn(async move {
            registry
                .create_entry(invoice, InvoiceDirection::Issued, tenant_id)
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }

    let entries = h.store.list_entries(h.tenant_id, 0, 100).await.unwrap();
    let sequences: Vec<u64> = entries.iter().map(|e| e.sequence_number).collect();
    assert_eq!(sequences, (1..=10).collect::<Vec<_>>());

    let report = h.registry.verify_tenant_chain(h.tenant_id).await.unwrap();
    assert!(report.valid);
    assert_eq!(report.entries_checked, 10);
}

// ============================================================================
// Certificate custody
// ============================================================================

#[tokio::test]
async fn test_certificate_upload_and_load() {
    let h = Harness::new(fast_backoff(5)).await;
    let info = h
        .custody
        .store_certificate(h.tenant_id, &test_bundle(365), passphrase())
        .await
        .unwrap();
    assert_eq!(info.subject, format!("CN={SIGNER_CN}"));
    assert!(info.currently_valid);

    let config = h.config(h.tenant_id).await;
    assert!(config.has_certificate());
    assert_eq!(config.certificate_valid_until, Some(info.not_after));

    // The stored bundle carries the ciphertext only
    let stored = serde_json::to_string(&config).unwrap();
    assert!(!stored.contains(CERT_PASSPHRASE));

    let material = h.custody.load_signing_material(&config).await.unwrap();
    assert_eq!(material.not_after().unwrap(), info.not_after);
}

#[tokio::test]
async fn test_seal_certificate_is_kept_apart_from_signing() {
    let h = Harness::new(fast_backoff(5)).await;
    h.upload_certificate(h.tenant_id).await;
    let seal = h
        .custody
        .store_seal_certificate(h.tenant_id, &test_bundle_named(SEAL_CN, 365), passphrase())
        .await
        .unwrap();
    assert_eq!(seal.subject, format!("CN={SEAL_CN}"));

    let mut config = h.config(h.tenant_id).await;
    let stored = config.seal_credential.clone().unwrap();
    assert_ne!(Some(&stored.certificate_locator), config.certificate_locator.as_ref());
    assert_eq!(stored.valid_until, seal.not_after);

    // Signing mode presents the signing certificate
    let identity = h.custody.load_transport_identity(&config).await.unwrap();
    assert_eq!(
        identity.certificate_info(Utc::now()).unwrap().subject,
        format!("CN={SIGNER_CN}")
    );

    config.use_seal_credential = true;
    h.store.upsert_config(&config).await.unwrap();
    let config = h.config(h.tenant_id).await;
    let identity = h.custody.load_transport_identity(&config).await.unwrap();
    assert_eq!(
        identity.certificate_info(Utc::now()).unwrap().subject,
        format!("CN={SEAL_CN}")
    );

    h.custody.remove_seal_certificate(h.tenant_id).await.unwrap();
    let config = h.config(h.tenant_id).await;
    assert!(config.seal_credential.is_none());
    assert!(!config.use_seal_credential);
    assert!(config.has_certificate());
}

#[tokio::test]
async fn test_seal_mode_without_seal_bundle_is_configuration_error() {
    let h = Harness::new(fast_backoff(5)).await;
    h.upload_certificate(h.tenant_id).await;
    let mut config = h.config(h.tenant_id).await;
    config.use_seal_credential = true;

    let err = h
        .custody
        .load_transport_identity(&config)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Configuration(ref m) if m.contains("no seal certificate")));
}

#[tokio::test]
async fn test_wrong_passphrase_leaves_config_untouched() {
    let h = Harness::new(fast_backoff(5)).await;
    let err = h
        .custody
        .store_certificate(
            h.tenant_id,
            &test_bundle(365),
            SecretString::from("not the passphrase".to_string()),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RegistryError::InvalidCertificate(_)));
    assert!(!h.config(h.tenant_id).await.has_certificate());
}

#[tokio::test]
async fn test_expired_certificate_is_refused() {
    let h = Harness::new(fast_backoff(5)).await;
    let err = h
        .custody
        .store_certificate(h.tenant_id, &test_bundle(-1), passphrase())
        .await
        .unwrap_err();

    assert!(matches!(err, RegistryError::InvalidCertificate(_)));
    assert!(!h.config(h.tenant_id).await.has_certificate());
}

#[tokio::test]
async fn test_expiration_check_reports_days_remaining() {
    let h = Harness::new(fast_backoff(5)).await;
    h.custody
        .store_certificate(h.tenant_id, &test_bundle(20), passphrase())
        .await
        .unwrap();

    let status = h
        .custody
        .check_expiration(h.tenant_id, Utc::now())
        .await
        .unwrap();
    assert!(!status.expired);
    assert!(status.expiring_soon);
    assert!((19..=20).contains(&status.days_remaining));
}

// ============================================================================
// Chain verification
// ============================================================================

#[tokio::test]
async fn test_tampered_amount_is_detected_and_reported() {
    let h = Harness::new(fast_backoff(5)).await;
    let mut entries = Vec::new();
    for n in 0..3 {
        let invoice = h.add_invoice(h.tenant_id, &format!("T-{n}")).await;
        entries.push(
            h.registry
                .create_entry(invoice, InvoiceDirection::Issued, h.tenant_id)
                .await
                .unwrap(),
        );
    }

    let mut tampered = entries[1].clone();
    tampered.total_amount = dec!(1.00);
    h.store.overwrite_entry(tampered).await;

    let report = h.registry.verify_tenant_chain(h.tenant_id).await.unwrap();
    assert!(!report.valid);
    assert_eq!(report.first_broken_at, Some(2));
    assert_eq!(report.reason, Some(ChainBreak::HashMismatch));

    let notifications = h.notifier.received().await;
    assert!(notifications.iter().any(|n| matches!(
        n,
        ComplianceNotification::ChainIntegrityViolation { tenant_id, .. } if *tenant_id == h.tenant_id
    )));
}

#[tokio::test]
async fn test_rewritten_hash_breaks_the_next_link() {
    let h = Harness::new(fast_backoff(5)).await;
    let mut entries = Vec::new();
    for n in 0..3 {
        let invoice = h.add_invoice(h.tenant_id, &format!("R-{n}")).await;
        entries.push(
            h.registry
                .create_entry(invoice, InvoiceDirection::Issued, h.tenant_id)
                .await
                .unwrap(),
        );
    }

    // Consistent rewrite of entry 2 alone still leaves entry 3 pointing at the old hash
    let mut rewritten = entries[1].clone();
    rewritten.total_amount = dec!(5.00);
    rewritten.current_hash = rewritten.recompute_hash();
    h.store.overwrite_entry(rewritten).await;

    let report = h.registry.verify_tenant_chain(h.tenant_id).await.unwrap();
    assert!(!report.valid);
    assert_eq!(report.first_broken_at, Some(3));
    assert_eq!(report.reason, Some(ChainBreak::BrokenLink));
}
