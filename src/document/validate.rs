//! Pre-flight structural check run before signing

use std::collections::BTreeSet;

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use super::DocumentError;

/// Elements every submission document must contain
pub const REQUIRED_ELEMENTS: &[&str] = &[
    "ComplianceSubmission",
    "Header",
    "Issuer",
    "RegistrationRecord",
    "DocumentId",
    "IssuerTaxId",
    "DocumentNumber",
    "IssueDate",
    "DocumentType",
    "RegimeCode",
    "TaxBreakdown",
    "TaxDetail",
    "TotalAmount",
    "Counterparty",
    "Chain",
    "SequenceNumber",
    "CurrentHash",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredElementsReport {
    pub valid: bool,
    /// In [`REQUIRED_ELEMENTS`] order
    pub missing_elements: Vec<String>,
}

/// Check presence of every required element by (local) name
pub fn validate_required_elements(xml: &str) -> Result<RequiredElementsReport, DocumentError> {
    let mut reader = Reader::from_str(xml);
    let mut seen: BTreeSet<String> = BTreeSet::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) | Ok(Event::Empty(start)) => {
                let name = start.local_name();
                seen.insert(String::from_utf8_lossy(name.as_ref()).into_owned());
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(DocumentError::Malformed(format!(
                    "at byte {}: {e}",
                    reader.buffer_position()
                )))
            }
        }
    }

    let missing_elements: Vec<String> = REQUIRED_ELEMENTS
        .iter()
        .filter(|name| !seen.contains(**name))
        .map(|name| name.to_string())
        .collect();

    Ok(RequiredElementsReport {
        valid: missing_elements.is_empty(),
        missing_elements,
    })
}
