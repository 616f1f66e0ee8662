//! HTTPS transport with certificate-bound client identity

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use openssl::hash::MessageDigest;
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Identity, Url};
use tokio::sync::RwLock;
use zeroize::Zeroizing;

use crate::crypto::{normalize_tax_id, SigningMaterial};
use crate::domain::TenantComplianceConfig;

use super::circuit_breaker::EndpointBreakers;
use super::{
    classify_query, classify_submission, is_rejection_status, ConnectivityReport,
    DocumentIdentity, QueryResponse, SubmissionResponse, SubmissionTransport, TransportConfig,
    TransportError,
};

const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";

/// reqwest-based transport.
///
/// One HTTP client is kept per client certificate, so connection pools are
/// reused across submissions of the same tenant.
pub struct HttpTransport {
    config: TransportConfig,
    breakers: EndpointBreakers,
    clients: RwLock<HashMap<String, Client>>,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Self {
        let breakers = EndpointBreakers::new(config.circuit_breaker.clone());
        Self {
            config,
            breakers,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Circuit state per endpoint, for operational tooling
    pub async fn breaker_status(&self) -> serde_json::Value {
        self.breakers.status().await
    }

    async fn client_for(&self, identity: &SigningMaterial) -> Result<Client, TransportError> {
        let fingerprint = identity
            .certificate()
            .digest(MessageDigest::sha256())
            .map(|d| hex::encode(&*d))
            .map_err(|e| TransportError::Identity(e.to_string()))?;

        if let Some(client) = self.clients.read().await.get(&fingerprint) {
            return Ok(client.clone());
        }

        // The PKCS#12 export only lives long enough to hand it to the TLS stack.
        let password: Zeroizing<String> = Zeroizing::new(
            rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(32)
                .map(char::from)
                .collect(),
        );
        let der = Zeroizing::new(
            identity
                .to_pkcs12(&password)
                .map_err(|e| TransportError::Identity(e.to_string()))?,
        );
        let tls_identity = Identity::from_pkcs12_der(&der, &password)
            .map_err(|e| TransportError::Identity(e.to_string()))?;

        let client = Client::builder()
            .identity(tls_identity)
            .timeout(self.config.timeout)
            .connect_timeout(self.config.timeout)
            .build()
            .map_err(|e| TransportError::Configuration(e.to_string()))?;

        self.clients
            .write()
            .await
            .insert(fingerprint, client.clone());
        Ok(client)
    }

    /// POST `body`; any status other than success or an explicit rejection
    /// status is an error.
    async fn post(client: &Client, endpoint: &Url, body: String) -> Result<(u16, String), TransportError> {
        let response = client
            .post(endpoint.clone())
            .header(CONTENT_TYPE, XML_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let text = response.text().await.map_err(map_reqwest_error)?;

        if status.is_success() || is_rejection_status(status.as_u16()) {
            Ok((status.as_u16(), text))
        } else {
            Err(TransportError::Http {
                status: status.as_u16(),
                body: text,
            })
        }
    }

    async fn guarded_post(
        &self,
        client: &Client,
        endpoint: &Url,
        body: String,
    ) -> Result<(u16, String), TransportError> {
        self.breakers
            .get(endpoint.as_str())
            .await
            .guard(self.config.timeout, Self::post(client, endpoint, body))
            .await
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Connection(format!("timed out: {e}"))
    } else {
        TransportError::Connection(e.to_string())
    }
}

/// Status query request body
pub(crate) fn query_document(document: &DocumentIdentity) -> String {
    use quick_xml::escape::escape;

    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<ComplianceQuery xmlns="{ns}">"#,
            "<IssuerTaxId>{tax_id}</IssuerTaxId>",
            "<DocumentNumber>{number}</DocumentNumber>",
            "<IssueDate>{date}</IssueDate>",
            "</ComplianceQuery>"
        ),
        ns = crate::document::SUBMISSION_NAMESPACE,
        tax_id = escape(normalize_tax_id(&document.issuer_tax_id).as_str()),
        number = escape(document.document_number.trim()),
        date = document.issue_date.format("%d-%m-%Y"),
    )
}

#[async_trait]
impl SubmissionTransport for HttpTransport {
    async fn submit(
        &self,
        signed_xml: &str,
        config: &TenantComplianceConfig,
        identity: &SigningMaterial,
    ) -> Result<SubmissionResponse, TransportError> {
        let endpoint = self.config.endpoints.resolve(config).clone();
        let client = self.client_for(identity).await?;

        let started = Instant::now();
        let (status, body) = self
            .guarded_post(&client, &endpoint, signed_xml.to_string())
            .await?;

        tracing::debug!(
            tenant_id = %config.tenant_id,
            endpoint = %endpoint,
            http_status = status,
            latency_ms = started.elapsed().as_millis() as u64,
            response_bytes = body.len(),
            "Submission response received"
        );

        classify_submission(status, &body)
    }

    async fn query(
        &self,
        document: &DocumentIdentity,
        config: &TenantComplianceConfig,
        identity: &SigningMaterial,
    ) -> Result<QueryResponse, TransportError> {
        let endpoint = self.config.endpoints.resolve(config).clone();
        let client = self.client_for(identity).await?;

        let (_, body) = self
            .guarded_post(&client, &endpoint, query_document(document))
            .await?;
        classify_query(&body)
    }

    async fn test_connectivity(
        &self,
        config: &TenantComplianceConfig,
        identity: &SigningMaterial,
    ) -> Result<ConnectivityReport, TransportError> {
        let endpoint = self.config.endpoints.resolve(config).clone();
        let client = self.client_for(identity).await?;

        let started = Instant::now();
        let result = tokio::time::timeout(self.config.timeout, client.get(endpoint.clone()).send()).await;
        let latency = started.elapsed();

        // Any HTTP answer below 500 proves TLS and client identity work.
        let report = match result {
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                ConnectivityReport {
                    success: status < 500,
                    endpoint: endpoint.to_string(),
                    latency,
                    http_status: Some(status),
                    error: None,
                }
            }
            Ok(Err(e)) => ConnectivityReport {
                success: false,
                endpoint: endpoint.to_string(),
                latency,
                http_status: None,
                error: Some(e.to_string()),
            },
            Err(_) => ConnectivityReport {
                success: false,
                endpoint: endpoint.to_string(),
                latency,
                http_status: None,
                error: Some(format!("timed out after {:?}", self.config.timeout)),
            },
        };
        Ok(report)
    }
}
