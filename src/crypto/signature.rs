//! Enveloped XML digital signatures
//!
//! [`sign`] appends a `ds:Signature` block as the last child of the document
//! root. The reference digest is SHA-256 over the document's canonical form
//! (see [`crate::crypto::canonical`]) with the signature element removed;
//! `ds:SignedInfo` is canonicalized the same way and signed with the tenant's
//! private key (RSA PKCS#1 v1.5 or DER-encoded ECDSA, both over SHA-256).
//! The signer certificate is embedded in `ds:KeyInfo`.
//!
//! [`validate_signature`] re-derives everything from the signed document: it
//! recomputes the digest, verifies the signature value against the embedded
//! certificate's public key and checks the certificate validity window.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{Id, PKey, Private};
use openssl::sign::{Signer, Verifier};
use openssl::x509::{X509NameRef, X509};
use quick_xml::events::Event;
use quick_xml::Reader;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::canonical::{canonicalize, canonicalize_element, canonicalize_excluding, CanonicalError};

pub const XMLDSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const CANONICALIZATION_ALGORITHM: &str = "urn:fiscal-registry:xml-canonical:v1";
pub const ENVELOPED_TRANSFORM: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub const DIGEST_ALGORITHM: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const ECDSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256";

const SIGNATURE_ELEMENT: &str = "ds:Signature";
const SIGNED_INFO_ELEMENT: &str = "ds:SignedInfo";

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    /// Unparseable bundle, wrong passphrase, key/certificate mismatch or unsupported key
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("malformed document: {0}")]
    MalformedDocument(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),
}

impl From<CanonicalError> for SignatureError {
    fn from(e: CanonicalError) -> Self {
        SignatureError::MalformedDocument(e.0)
    }
}

// ============================================================================
// Signing material
// ============================================================================

/// Decrypted certificate and private key of one tenant
pub struct SigningMaterial {
    certificate: X509,
    private_key: PKey<Private>,
    chain: Vec<X509>,
}

impl std::fmt::Debug for SigningMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningMaterial")
            .field("subject", &name_to_string(self.certificate.subject_name()))
            .finish_non_exhaustive()
    }
}

impl SigningMaterial {
    /// Load a PKCS#12 (DER) bundle, or a PEM bundle carrying a certificate and
    /// a (possibly encrypted) private key
    pub fn from_bundle(bundle: &[u8], passphrase: &SecretString) -> Result<Self, SignatureError> {
        if looks_like_pem(bundle) {
            Self::from_pem(bundle, passphrase)
        } else {
            Self::from_pkcs12(bundle, passphrase)
        }
    }

    pub fn from_pkcs12(der: &[u8], passphrase: &SecretString) -> Result<Self, SignatureError> {
        let parsed = Pkcs12::from_der(der)
            .and_then(|p12| p12.parse2(passphrase.expose_secret()))
            .map_err(|e| {
                SignatureError::InvalidCertificate(format!("cannot open PKCS#12 bundle: {e}"))
            })?;

        let private_key = parsed.pkey.ok_or_else(|| {
            SignatureError::InvalidCertificate("bundle has no private key".to_string())
        })?;
        let certificate = parsed.cert.ok_or_else(|| {
            SignatureError::InvalidCertificate("bundle has no certificate".to_string())
        })?;
        let chain = parsed
            .ca
            .map(|stack| stack.into_iter().collect())
            .unwrap_or_default();

        Self::assemble(certificate, private_key, chain)
    }

    pub fn from_pem(pem: &[u8], passphrase: &SecretString) -> Result<Self, SignatureError> {
        let mut certificates = X509::stack_from_pem(pem).map_err(|e| {
            SignatureError::InvalidCertificate(format!("cannot read PEM certificate: {e}"))
        })?;
        if certificates.is_empty() {
            return Err(SignatureError::InvalidCertificate(
                "PEM bundle has no certificate".to_string(),
            ));
        }
        let certificate = certificates.remove(0);
        let private_key =
            PKey::private_key_from_pem_passphrase(pem, passphrase.expose_secret().as_bytes())
                .map_err(|e| {
                    SignatureError::InvalidCertificate(format!("cannot read PEM private key: {e}"))
                })?;

        Self::assemble(certificate, private_key, certificates)
    }

    fn assemble(
        certificate: X509,
        private_key: PKey<Private>,
        chain: Vec<X509>,
    ) -> Result<Self, SignatureError> {
        let public_key = certificate
            .public_key()
            .map_err(|e| SignatureError::InvalidCertificate(e.to_string()))?;
        if !public_key.public_eq(&private_key) {
            return Err(SignatureError::InvalidCertificate(
                "private key does not match certificate".to_string(),
            ));
        }
        signature_algorithm(&private_key)?;

        Ok(Self {
            certificate,
            private_key,
            chain,
        })
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub fn certificate_info(&self, now: DateTime<Utc>) -> Result<CertificateInfo, SignatureError> {
        CertificateInfo::from_x509(&self.certificate, now)
    }

    pub fn not_after(&self) -> Result<DateTime<Utc>, SignatureError> {
        asn1_to_datetime(self.certificate.not_after())
    }

    /// Re-export as a PKCS#12 bundle, e.g. to build a TLS client identity
    pub fn to_pkcs12(&self, password: &str) -> Result<Vec<u8>, SignatureError> {
        let mut builder = Pkcs12::builder();
        builder
            .name("registry-client")
            .pkey(&self.private_key)
            .cert(&self.certificate);
        if !self.chain.is_empty() {
            let mut stack = openssl::stack::Stack::new()
                .map_err(|e| SignatureError::SigningFailed(e.to_string()))?;
            for ca in &self.chain {
                stack
                    .push(ca.clone())
                    .map_err(|e| SignatureError::SigningFailed(e.to_string()))?;
            }
            builder.ca(stack);
        }
        builder
            .build2(password)
            .and_then(|p12| p12.to_der())
            .map_err(|e| SignatureError::SigningFailed(e.to_string()))
    }
}

fn looks_like_pem(bundle: &[u8]) -> bool {
    let start = bundle
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bundle.len());
    bundle[start..].starts_with(b"-----BEGIN")
}

fn signature_algorithm(key: &PKey<Private>) -> Result<&'static str, SignatureError> {
    match key.id() {
        Id::RSA => Ok(RSA_SHA256),
        Id::EC => Ok(ECDSA_SHA256),
        other => Err(SignatureError::InvalidCertificate(format!(
            "unsupported key type {other:?}"
        ))),
    }
}

// ============================================================================
// Certificate info
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Whether `now` lies inside the validity window
    pub currently_valid: bool,
}

impl CertificateInfo {
    pub fn from_x509(cert: &X509, now: DateTime<Utc>) -> Result<Self, SignatureError> {
        let not_before = asn1_to_datetime(cert.not_before())?;
        let not_after = asn1_to_datetime(cert.not_after())?;
        let serial_number = cert
            .serial_number()
            .to_bn()
            .and_then(|bn| bn.to_hex_str().map(|s| s.to_string()))
            .map_err(|e| SignatureError::InvalidCertificate(e.to_string()))?;

        Ok(Self {
            subject: name_to_string(cert.subject_name()),
            issuer: name_to_string(cert.issuer_name()),
            serial_number,
            not_before,
            not_after,
            currently_valid: not_before <= now && now <= not_after,
        })
    }
}

fn name_to_string(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("?");
            let value = entry
                .data()
                .as_utf8()
                .map(|s| s.to_string())
                .unwrap_or_default();
            format!("{key}={value}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// ASN.1 time to UTC (second precision)
pub fn asn1_to_datetime(time: &Asn1TimeRef) -> Result<DateTime<Utc>, SignatureError> {
    let epoch = Asn1Time::from_unix(0).map_err(|e| SignatureError::InvalidCertificate(e.to_string()))?;
    let diff = epoch
        .diff(time)
        .map_err(|e| SignatureError::InvalidCertificate(e.to_string()))?;
    let seconds = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::<Utc>::from_timestamp(seconds, 0).ok_or_else(|| {
        SignatureError::InvalidCertificate(format!("certificate time out of range: {time}"))
    })
}

// ============================================================================
// Signing
// ============================================================================

/// Sign `xml` with an enveloped signature
pub fn sign(xml: &str, material: &SigningMaterial) -> Result<String, SignatureError> {
    let canonical = canonicalize(xml)?;
    let insert_at = root_close_offset(xml)?;

    let digest = STANDARD.encode(Sha256::digest(canonical.as_bytes()));
    let algorithm = signature_algorithm(&material.private_key)?;
    let signed_info = build_signed_info(algorithm, &digest);
    let signed_info_canonical = canonicalize(&signed_info)?;

    let mut signer = Signer::new(MessageDigest::sha256(), &material.private_key)
        .map_err(|e| SignatureError::SigningFailed(e.to_string()))?;
    signer
        .update(signed_info_canonical.as_bytes())
        .map_err(|e| SignatureError::SigningFailed(e.to_string()))?;
    let signature_value = signer
        .sign_to_vec()
        .map_err(|e| SignatureError::SigningFailed(e.to_string()))?;

    let certificate_der = material
        .certificate
        .to_der()
        .map_err(|e| SignatureError::SigningFailed(e.to_string()))?;

    let block = format!(
        "<ds:Signature xmlns:ds=\"{XMLDSIG_NS}\">{signed_info}\
         <ds:SignatureValue>{}</ds:SignatureValue>\
         <ds:KeyInfo><ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>\
         </ds:Signature>",
        STANDARD.encode(signature_value),
        STANDARD.encode(certificate_der),
    );

    let mut signed = String::with_capacity(xml.len() + block.len());
    signed.push_str(&xml[..insert_at]);
    signed.push_str(&block);
    signed.push_str(&xml[insert_at..]);
    Ok(signed)
}

fn build_signed_info(signature_algorithm: &str, digest: &str) -> String {
    format!(
        "<ds:SignedInfo xmlns:ds=\"{XMLDSIG_NS}\">\
         <ds:CanonicalizationMethod Algorithm=\"{CANONICALIZATION_ALGORITHM}\"/>\
         <ds:SignatureMethod Algorithm=\"{signature_algorithm}\"/>\
         <ds:Reference URI=\"\">\
         <ds:Transforms><ds:Transform Algorithm=\"{ENVELOPED_TRANSFORM}\"/></ds:Transforms>\
         <ds:DigestMethod Algorithm=\"{DIGEST_ALGORITHM}\"/>\
         <ds:DigestValue>{digest}</ds:DigestValue>\
         </ds:Reference>\
         </ds:SignedInfo>"
    )
}

/// Byte offset of the root element's closing tag
fn root_close_offset(xml: &str) -> Result<usize, SignatureError> {
    let mut reader = Reader::from_str(xml);
    let mut depth: usize = 0;

    loop {
        let before = reader.buffer_position() as usize;
        let event = reader
            .read_event()
            .map_err(|e| SignatureError::MalformedDocument(e.to_string()))?;
        match event {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Ok(before);
                }
            }
            Event::Empty(_) if depth == 0 => {
                return Err(SignatureError::MalformedDocument(
                    "root element is empty".to_string(),
                ));
            }
            Event::Eof => {
                return Err(SignatureError::MalformedDocument(
                    "no root element".to_string(),
                ))
            }
            _ => {}
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Outcome of [`validate_signature`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureValidation {
    /// Structure complete, cryptographically verified and certificate in its window
    pub valid: bool,
    /// Every required signature element is present
    pub structurally_complete: bool,
    /// Digest and signature value both verified against the embedded certificate
    pub cryptographically_verified: bool,
    pub certificate: Option<CertificateInfo>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Default)]
struct SignatureParts {
    digest_value: Option<String>,
    signature_value: Option<String>,
    certificate: Option<String>,
    signature_method: Option<String>,
}

/// Validate an enveloped signature produced by [`sign`]
pub fn validate_signature(
    signed_xml: &str,
    now: DateTime<Utc>,
) -> Result<SignatureValidation, SignatureError> {
    let parts = extract_signature_parts(signed_xml)?;
    let mut warnings = Vec::new();

    let (Some(digest_value), Some(signature_value), Some(certificate_b64)) = (
        parts.digest_value.as_deref(),
        parts.signature_value.as_deref(),
        parts.certificate.as_deref(),
    ) else {
        warnings.push("signature elements missing".to_string());
        return Ok(SignatureValidation {
            valid: false,
            structurally_complete: false,
            cryptographically_verified: false,
            certificate: None,
            warnings,
        });
    };

    let certificate = STANDARD
        .decode(strip_whitespace(certificate_b64))
        .ok()
        .and_then(|der| X509::from_der(&der).ok());
    let Some(certificate) = certificate else {
        warnings.push("embedded certificate cannot be parsed".to_string());
        return Ok(SignatureValidation {
            valid: false,
            structurally_complete: true,
            cryptographically_verified: false,
            certificate: None,
            warnings,
        });
    };

    let info = CertificateInfo::from_x509(&certificate, now)?;
    if now > info.not_after {
        warnings.push(format!("certificate expired at {}", info.not_after));
    } else if now < info.not_before {
        warnings.push(format!("certificate not valid before {}", info.not_before));
    }

    let canonical = canonicalize_excluding(signed_xml, Some(SIGNATURE_ELEMENT))?;
    let recomputed = STANDARD.encode(Sha256::digest(canonical.as_bytes()));
    let digest_ok = recomputed == strip_whitespace(digest_value);
    if !digest_ok {
        warnings.push("digest mismatch: document changed after signing".to_string());
    }

    let signature_ok = verify_signed_info(signed_xml, &certificate, signature_value)?;
    if !signature_ok {
        warnings.push("signature value does not verify with the embedded certificate".to_string());
    }

    let algorithm_ok = matches!(
        parts.signature_method.as_deref(),
        Some(RSA_SHA256) | Some(ECDSA_SHA256)
    );
    if !algorithm_ok {
        warnings.push(format!(
            "unsupported signature method {:?}",
            parts.signature_method
        ));
    }

    let cryptographically_verified = digest_ok && signature_ok && algorithm_ok;
    Ok(SignatureValidation {
        valid: cryptographically_verified && info.currently_valid,
        structurally_complete: true,
        cryptographically_verified,
        certificate: Some(info),
        warnings,
    })
}

fn verify_signed_info(
    signed_xml: &str,
    certificate: &X509,
    signature_value: &str,
) -> Result<bool, SignatureError> {
    let Some(signed_info) = canonicalize_element(signed_xml, SIGNED_INFO_ELEMENT)? else {
        return Ok(false);
    };
    let Ok(signature) = STANDARD.decode(strip_whitespace(signature_value)) else {
        return Ok(false);
    };
    let public_key = certificate
        .public_key()
        .map_err(|e| SignatureError::InvalidCertificate(e.to_string()))?;

    let mut verifier = Verifier::new(MessageDigest::sha256(), &public_key)
        .map_err(|e| SignatureError::InvalidCertificate(e.to_string()))?;
    verifier
        .update(signed_info.as_bytes())
        .map_err(|e| SignatureError::SigningFailed(e.to_string()))?;
    // Malformed DER signatures surface as errors; treat them as a failed check
    Ok(verifier.verify(&signature).unwrap_or(false))
}

fn extract_signature_parts(xml: &str) -> Result<SignatureParts, SignatureError> {
    let mut reader = Reader::from_str(xml);
    let mut parts = SignatureParts::default();
    let mut current: Option<&'static str> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| SignatureError::MalformedDocument(e.to_string()))?;
        match event {
            Event::Start(start) | Event::Empty(start) => {
                let name = start.name();
                current = match name.as_ref() {
                    b"ds:DigestValue" => Some("digest"),
                    b"ds:SignatureValue" => Some("signature"),
                    b"ds:X509Certificate" => Some("certificate"),
                    _ => None,
                };
                if name.as_ref() == b"ds:SignatureMethod" {
                    if let Ok(Some(attr)) = start.try_get_attribute("Algorithm") {
                        parts.signature_method = attr.unescape_value().ok().map(|v| v.into_owned());
                    }
                }
            }
            Event::Text(text) => {
                if let Some(slot) = current {
                    let value = text
                        .unescape()
                        .map_err(|e| SignatureError::MalformedDocument(e.to_string()))?
                        .into_owned();
                    let target = match slot {
                        "digest" => &mut parts.digest_value,
                        "signature" => &mut parts.signature_value,
                        _ => &mut parts.certificate,
                    };
                    if target.is_none() {
                        *target = Some(value);
                    }
                }
            }
            Event::End(_) => current = None,
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(parts)
}

fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Subject common name, when present
pub fn common_name(cert: &X509) -> Option<String> {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::bn::BigNum;
    use openssl::ec::{EcGroup, EcKey};
    use openssl::rsa::Rsa;
    use openssl::symm::Cipher;
    use openssl::x509::{X509Builder, X509NameBuilder};

    const DOC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ComplianceSubmission><Header><IssuerTaxId>B12345678</IssuerTaxId></Header><TotalAmount>121.00</TotalAmount></ComplianceSubmission>"#;

    fn self_signed(key: &PKey<Private>, not_before: i64, not_after: i64) -> X509 {
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "Registry Test Signer").unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(4242).unwrap().to_asn1_integer().unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(key).unwrap();
        builder
            .set_not_before(&Asn1Time::from_unix(not_before).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::from_unix(not_after).unwrap())
            .unwrap();
        builder.sign(key, MessageDigest::sha256()).unwrap();
        builder.build()
    }

    fn rsa_key() -> PKey<Private> {
        PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
    }

    fn ec_key() -> PKey<Private> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
    }

    fn pkcs12_bundle(key: &PKey<Private>, cert: &X509, pass: &str) -> Vec<u8> {
        Pkcs12::builder()
            .name("test")
            .pkey(key)
            .cert(cert)
            .build2(pass)
            .unwrap()
            .to_der()
            .unwrap()
    }

    fn valid_window() -> (i64, i64) {
        let now = Utc::now().timestamp();
        (now - 86_400, now + 365 * 86_400)
    }

    fn material(key: PKey<Private>) -> SigningMaterial {
        let (nb, na) = valid_window();
        let cert = self_signed(&key, nb, na);
        let bundle = pkcs12_bundle(&key, &cert, "secret");
        SigningMaterial::from_bundle(&bundle, &SecretString::from("secret".to_string())).unwrap()
    }

    #[test]
    fn test_sign_and_verify_rsa() {
        let material = material(rsa_key());
        let signed = sign(DOC, &material).unwrap();

        assert!(signed.contains("<ds:Signature"));
        assert!(signed.trim_end().ends_with("</ds:Signature></ComplianceSubmission>"));

        let report = validate_signature(&signed, Utc::now()).unwrap();
        assert!(report.structurally_complete);
        assert!(report.cryptographically_verified, "{:?}", report.warnings);
        assert!(report.valid);
        assert_eq!(
            report.certificate.unwrap().subject,
            "CN=Registry Test Signer"
        );
    }

    #[test]
    fn test_sign_and_verify_ec() {
        let material = material(ec_key());
        let signed = sign(DOC, &material).unwrap();
        assert!(signed.contains(ECDSA_SHA256));
        assert!(validate_signature(&signed, Utc::now()).unwrap().valid);
    }

    #[test]
    fn test_tampered_document_fails_verification() {
        let material = material(ec_key());
        let signed = sign(DOC, &material).unwrap();
        let tampered = signed.replace("121.00", "1.00");

        let report = validate_signature(&tampered, Utc::now()).unwrap();
        assert!(report.structurally_complete);
        assert!(!report.cryptographically_verified);
        assert!(!report.valid);
    }

    #[test]
    fn test_content_in_nested_signature_is_digested() {
        let material = material(rsa_key());
        let signed = sign(DOC, &material).unwrap();
        let smuggled = signed.replace(
            "</Header>",
            r#"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><Note>paid</Note></ds:Signature></Header>"#,
        );
        assert_ne!(smuggled, signed);

        let report = validate_signature(&smuggled, Utc::now()).unwrap();
        assert!(!report.cryptographically_verified);
        assert!(report.warnings.iter().any(|w| w.starts_with("digest mismatch")));
    }

    #[test]
    fn test_tampered_signed_info_fails_verification() {
        let material = material(ec_key());
        let signed = sign(DOC, &material).unwrap();
        let tampered = signed.replace(DIGEST_ALGORITHM, "http://example.invalid/digest");
        assert!(!validate_signature(&tampered, Utc::now()).unwrap().cryptographically_verified);
    }

    #[test]
    fn test_unsigned_document_is_not_structurally_complete() {
        let report = validate_signature(DOC, Utc::now()).unwrap();
        assert!(!report.structurally_complete);
        assert!(!report.valid);
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn test_wrong_passphrase_is_invalid_certificate() {
        let key = rsa_key();
        let (nb, na) = valid_window();
        let cert = self_signed(&key, nb, na);
        let bundle = pkcs12_bundle(&key, &cert, "right");
        let err = SigningMaterial::from_bundle(&bundle, &SecretString::from("wrong".to_string()))
            .unwrap_err();
        assert!(matches!(err, SignatureError::InvalidCertificate(_)));
    }

    #[test]
    fn test_garbage_bundle_is_invalid_certificate() {
        let err =
            SigningMaterial::from_bundle(b"not a bundle", &SecretString::from(String::new()))
                .unwrap_err();
        assert!(matches!(err, SignatureError::InvalidCertificate(_)));
    }

    #[test]
    fn test_pem_bundle_with_encrypted_key() {
        let key = ec_key();
        let (nb, na) = valid_window();
        let cert = self_signed(&key, nb, na);
        let mut pem = cert.to_pem().unwrap();
        pem.extend(
            key.private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), b"pem-pass")
                .unwrap(),
        );

        let material =
            SigningMaterial::from_bundle(&pem, &SecretString::from("pem-pass".to_string()))
                .unwrap();
        let signed = sign(DOC, &material).unwrap();
        assert!(validate_signature(&signed, Utc::now()).unwrap().valid);
    }

    #[test]
    fn test_malformed_xml_is_rejected_before_signing() {
        let material = material(ec_key());
        let err = sign("<Root><Open></Root>", &material).unwrap_err();
        assert!(matches!(err, SignatureError::MalformedDocument(_)));
    }

    #[test]
    fn test_expired_certificate_is_reported() {
        let key = ec_key();
        let now = Utc::now().timestamp();
        let cert = self_signed(&key, now - 10 * 86_400, now - 86_400);
        let bundle = pkcs12_bundle(&key, &cert, "x");
        let material =
            SigningMaterial::from_bundle(&bundle, &SecretString::from("x".to_string())).unwrap();

        let signed = sign(DOC, &material).unwrap();
        let report = validate_signature(&signed, Utc::now()).unwrap();
        assert!(report.cryptographically_verified);
        assert!(!report.valid);
        assert!(report.warnings.iter().any(|w| w.contains("expired")));
    }

    #[test]
    fn test_pkcs12_reexport_round_trips() {
        let material = material(ec_key());
        let der = material.to_pkcs12("transport").unwrap();
        let again =
            SigningMaterial::from_pkcs12(&der, &SecretString::from("transport".to_string()))
                .unwrap();
        assert_eq!(
            common_name(again.certificate()).as_deref(),
            Some("Registry Test Signer")
        );
    }
}
