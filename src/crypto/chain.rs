//! Registry hash chain
//!
//! Every registry entry carries a SHA-256 digest over its normalized chain
//! fields and its predecessor's digest:
//!
//! ```text
//! preimage = TAXID(issuer) | TRIM(number) | YYYYMMDD(date) | TAXID(counterparty)
//!            | AMOUNT_2DP(total) | previous_hash-or-"GENESIS"
//! current_hash = UPPER_HEX(SHA256(preimage))
//! ```
//!
//! Altering any field of any entry, or removing an entry, changes every
//! digest after it. [`compute_hash`] is pure so the same function both creates
//! entries and re-verifies them.

use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::RegistryEntry;

/// Joins preimage components
pub const CHAIN_DELIMITER: char = '|';

/// Stands in for the previous hash of a tenant's first entry
pub const GENESIS_SENTINEL: &str = "GENESIS";

/// Fields covered by the chain hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainFields {
    pub issuer_tax_id: String,
    pub document_number: String,
    pub issue_date: NaiveDate,
    pub counterparty_tax_id: String,
    pub total_amount: Decimal,
}

// ============================================================================
// Normalization
// ============================================================================

/// Upper-case and drop separators (`B-12.345 678` → `B12345678`)
pub fn normalize_tax_id(tax_id: &str) -> String {
    tax_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Eight-digit `YYYYMMDD`
pub fn normalize_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Fixed two-decimal representation, half away from zero
pub fn normalize_amount(amount: Decimal) -> String {
    let mut rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    if rounded.is_zero() {
        rounded = Decimal::ZERO;
    }
    rounded.rescale(2);
    rounded.to_string()
}

pub fn normalize_document_number(number: &str) -> String {
    number.trim().to_string()
}

/// Build the exact string that gets hashed
pub fn chain_preimage(fields: &ChainFields, previous_hash: Option<&str>) -> String {
    let components = [
        normalize_tax_id(&fields.issuer_tax_id),
        normalize_document_number(&fields.document_number),
        normalize_date(fields.issue_date),
        normalize_tax_id(&fields.counterparty_tax_id),
        normalize_amount(fields.total_amount),
        previous_hash.unwrap_or(GENESIS_SENTINEL).to_string(),
    ];

    let mut preimage = String::with_capacity(components.iter().map(String::len).sum::<usize>() + 8);
    for (i, component) in components.iter().enumerate() {
        if i > 0 {
            preimage.push(CHAIN_DELIMITER);
        }
        preimage.push_str(component);
    }
    preimage
}

/// Compute an entry's chain hash (uppercase hex SHA-256)
pub fn compute_hash(fields: &ChainFields, previous_hash: Option<&str>) -> String {
    let digest = Sha256::digest(chain_preimage(fields, previous_hash).as_bytes());
    hex::encode_upper(digest)
}

// ============================================================================
// Chain validation
// ============================================================================

/// Anything that can be verified as a link of the chain
pub trait ChainLink {
    fn sequence_number(&self) -> u64;
    fn previous_hash(&self) -> Option<&str>;
    fn current_hash(&self) -> &str;
    fn chain_fields(&self) -> ChainFields;
}

impl ChainLink for RegistryEntry {
    fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    fn previous_hash(&self) -> Option<&str> {
        self.previous_hash.as_deref()
    }

    fn current_hash(&self) -> &str {
        &self.current_hash
    }

    fn chain_fields(&self) -> ChainFields {
        RegistryEntry::chain_fields(self)
    }
}

/// Why a chain failed verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainBreak {
    /// Sequence numbers are not strictly increasing
    OutOfOrder,
    /// Stored previous hash differs from the predecessor's stored hash
    /// (or a first entry carries one)
    BrokenLink,
    /// Stored hash differs from a fresh recomputation
    HashMismatch,
}

/// Result of verifying a run of entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub entries_checked: u64,
    /// Sequence number of the first offending entry
    pub first_broken_at: Option<u64>,
    pub reason: Option<ChainBreak>,
}

impl ChainVerification {
    fn broken(entries_checked: u64, sequence_number: u64, reason: ChainBreak) -> Self {
        Self {
            valid: false,
            entries_checked,
            first_broken_at: Some(sequence_number),
            reason: Some(reason),
        }
    }
}

/// Verify a complete chain ordered by sequence number.
///
/// The first entry must carry no previous hash. Any mismatch fails the whole
/// chain.
pub fn validate_chain<L: ChainLink>(entries: &[L]) -> bool {
    verify_chain_segment(entries, None).valid
}

/// Verify a chain and report where it first breaks
pub fn verify_chain<L: ChainLink>(entries: &[L]) -> ChainVerification {
    verify_chain_segment(entries, None)
}

/// Verify a run of entries whose first element must link to `anchor`.
///
/// `anchor` is `None` for a chain starting at the tenant's first entry. A
/// retained tail (after a retention purge) passes the first retained entry's
/// stored previous hash.
pub fn verify_chain_segment<L: ChainLink>(entries: &[L], anchor: Option<&str>) -> ChainVerification {
    let mut expected_previous: Option<&str> = anchor;
    let mut last_sequence: Option<u64> = None;
    let mut checked: u64 = 0;

    for entry in entries {
        checked += 1;
        let sequence = entry.sequence_number();

        if last_sequence.is_some_and(|last| sequence <= last) {
            return ChainVerification::broken(checked, sequence, ChainBreak::OutOfOrder);
        }

        if entry.previous_hash() != expected_previous {
            return ChainVerification::broken(checked, sequence, ChainBreak::BrokenLink);
        }

        let recomputed = compute_hash(&entry.chain_fields(), entry.previous_hash());
        if recomputed != entry.current_hash() {
            return ChainVerification::broken(checked, sequence, ChainBreak::HashMismatch);
        }

        expected_previous = Some(entry.current_hash());
        last_sequence = Some(sequence);
    }

    ChainVerification {
        valid: true,
        entries_checked: checked,
        first_broken_at: None,
        reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[derive(Debug, Clone)]
    struct Link {
        sequence_number: u64,
        fields: ChainFields,
        previous_hash: Option<String>,
        current_hash: String,
    }

    impl ChainLink for Link {
        fn sequence_number(&self) -> u64 {
            self.sequence_number
        }
        fn previous_hash(&self) -> Option<&str> {
            self.previous_hash.as_deref()
        }
        fn current_hash(&self) -> &str {
            &self.current_hash
        }
        fn chain_fields(&self) -> ChainFields {
            self.fields.clone()
        }
    }

    fn fields(number: &str, amount: Decimal) -> ChainFields {
        ChainFields {
            issuer_tax_id: "B12345678".to_string(),
            document_number: number.to_string(),
            issue_date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            counterparty_tax_id: "12345678Z".to_string(),
            total_amount: amount,
        }
    }

    fn build_chain(len: usize) -> Vec<Link> {
        let mut out: Vec<Link> = Vec::with_capacity(len);
        for i in 0..len {
            let previous_hash = out.last().map(|l| l.current_hash.clone());
            let f = fields(&format!("F-{}", i + 1), Decimal::from(100 + i as i64));
            let current_hash = compute_hash(&f, previous_hash.as_deref());
            out.push(Link {
                sequence_number: i as u64 + 1,
                fields: f,
                previous_hash,
                current_hash,
            });
        }
        out
    }

    #[test]
    fn test_normalization_rules() {
        assert_eq!(normalize_tax_id(" b-12.345 678/x "), "B12345678X");
        assert_eq!(
            normalize_date(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()),
            "20240105"
        );
        assert_eq!(normalize_amount(dec!(121)), "121.00");
        assert_eq!(normalize_amount(dec!(10.005)), "10.01");
        assert_eq!(normalize_amount(dec!(-3.1)), "-3.10");
        assert_eq!(normalize_amount(dec!(0.001)), "0.00");
    }

    #[test]
    fn test_preimage_uses_sentinel_for_first_entry() {
        let preimage = chain_preimage(&fields("F-1", dec!(121.5)), None);
        assert_eq!(preimage, "B12345678|F-1|20240315|12345678Z|121.50|GENESIS");
    }

    #[test]
    fn test_hash_is_uppercase_hex_sha256() {
        let hash = compute_hash(&fields("F-1", dec!(121.5)), None);
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn test_equivalent_inputs_hash_identically() {
        let a = fields("F-1", dec!(121.5));
        let mut b = a.clone();
        b.issuer_tax_id = "b-12345678".to_string();
        b.total_amount = dec!(121.500);
        b.document_number = "  F-1 ".to_string();
        assert_eq!(compute_hash(&a, None), compute_hash(&b, None));
    }

    #[test]
    fn test_each_field_changes_the_hash() {
        let base = fields("F-1", dec!(121.5));
        let original = compute_hash(&base, Some("ABC"));

        let mut changed = base.clone();
        changed.total_amount = dec!(121.51);
        assert_ne!(compute_hash(&changed, Some("ABC")), original);

        let mut changed = base.clone();
        changed.issue_date = NaiveDate::from_ymd_opt(2024, 3, 16).unwrap();
        assert_ne!(compute_hash(&changed, Some("ABC")), original);

        let mut changed = base.clone();
        changed.issuer_tax_id = "B12345679".to_string();
        assert_ne!(compute_hash(&changed, Some("ABC")), original);

        let mut changed = base.clone();
        changed.counterparty_tax_id = "X1234567L".to_string();
        assert_ne!(compute_hash(&changed, Some("ABC")), original);

        let mut changed = base.clone();
        changed.document_number = "F-2".to_string();
        assert_ne!(compute_hash(&changed, Some("ABC")), original);

        assert_ne!(compute_hash(&base, Some("ABD")), original);
        assert_ne!(compute_hash(&base, None), original);
    }

    #[test]
    fn test_valid_chain_verifies() {
        let chain = build_chain(5);
        assert!(validate_chain(&chain));
        let report = verify_chain(&chain);
        assert_eq!(report.entries_checked, 5);
        assert_eq!(report.first_broken_at, None);
    }

    #[test]
    fn test_empty_chain_is_valid() {
        assert!(validate_chain::<Link>(&[]));
    }

    #[test]
    fn test_first_entry_with_previous_hash_fails() {
        let mut chain = build_chain(1);
        chain[0].previous_hash = Some("00".to_string());
        let report = verify_chain(&chain);
        assert!(!report.valid);
        assert_eq!(report.reason, Some(ChainBreak::BrokenLink));
    }

    #[test]
    fn test_tampered_amount_is_detected() {
        let mut chain = build_chain(4);
        chain[2].fields.total_amount = dec!(9999);
        let report = verify_chain(&chain);
        assert!(!report.valid);
        assert_eq!(report.first_broken_at, Some(3));
        assert_eq!(report.reason, Some(ChainBreak::HashMismatch));
    }

    #[test]
    fn test_removed_entry_is_detected() {
        let mut chain = build_chain(4);
        chain.remove(1);
        let report = verify_chain(&chain);
        assert!(!report.valid);
        assert_eq!(report.first_broken_at, Some(3));
        assert_eq!(report.reason, Some(ChainBreak::BrokenLink));
    }

    #[test]
    fn test_reordered_entries_are_detected() {
        let mut chain = build_chain(3);
        chain.swap(1, 2);
        assert!(!validate_chain(&chain));
    }

    #[test]
    fn test_segment_verifies_against_anchor() {
        let chain = build_chain(5);
        let anchor = chain[1].current_hash.clone();
        assert!(verify_chain_segment(&chain[2..], Some(&anchor)).valid);
        assert!(!verify_chain_segment(&chain[2..], None).valid);
    }
}
