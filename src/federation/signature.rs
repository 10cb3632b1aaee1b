//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/
//!
//! Outbound requests sign `(request-target) date host digest`. Inbound
//! requests must sign at least that set; the verifying key is looked up in
//! the local store only, so verification never causes outbound traffic.

use std::fmt;
use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1v15::Signature as Pkcs1v15Signature;
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::data::Database;
use crate::error::AppError;

/// Headers every signature must cover, in the order we sign them.
pub const SIGNED_HEADERS: [&str; 4] = ["(request-target)", "date", "host", "digest"];

/// Why an inbound signature was rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("malformed signature header: {0}")]
    Malformed(String),

    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("signature does not cover {0}")]
    UnsignedHeader(&'static str),

    #[error("unknown key id: {0}")]
    UnknownKey(String),

    #[error("digest does not match body")]
    DigestMismatch,

    #[error("date header too old or in future")]
    StaleDate,

    #[error("signature verification failed")]
    Mismatch,
}

impl From<SignatureError> for AppError {
    fn from(err: SignatureError) -> Self {
        AppError::Unauthorized(err.to_string())
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Opaque handle to a local actor's private key.
///
/// Built straight from storage and only ever passed by reference to the
/// signer. Its `Debug` output never includes key material.
#[derive(Clone)]
pub struct SigningKey {
    key_id: String,
    signer: rsa::pkcs1v15::SigningKey<Sha256>,
}

impl SigningKey {
    /// Parse a PKCS#8 PEM private key
    pub fn from_pkcs8_pem(key_id: impl Into<String>, pem: &str) -> Result<Self, AppError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid private key: {}", e)))?;

        Ok(Self {
            key_id: key_id.into(),
            signer: rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key),
        })
    }

    /// Public key id this key signs as (`{actor}#main-key`)
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    fn sign(&self, data: &[u8]) -> String {
        let mut rng = rand::thread_rng();
        let signature = self.signer.sign_with_rng(&mut rng, data);
        BASE64.encode(signature.to_bytes())
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Freshly generated keypair, PEM encoded
pub struct GeneratedKeyPair {
    /// PKCS#8, only ever written to local credentials
    pub private_key_pem: String,
    /// SPKI, published in the actor document
    pub public_key_pem: String,
}

/// Generate an RSA keypair of `bits` size
pub fn generate_keypair(bits: usize) -> Result<GeneratedKeyPair, AppError> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to generate RSA key: {}", e)))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode private key: {}", e)))?
        .to_string();
    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode public key: {}", e)))?;

    Ok(GeneratedKeyPair {
        private_key_pem,
        public_key_pem,
    })
}

// =============================================================================
// Signing
// =============================================================================

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value
    pub digest: String,
    /// Host header value, with the port when it is not the default
    pub host: String,
}

/// `Host` header value for a URL
pub fn host_header_value(url: &url::Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Sign an HTTP request
///
/// Computes the body digest, builds the signing string over
/// `(request-target) date host digest` and signs it.
///
/// # Example
/// ```ignore
/// let headers = sign_request("POST", "https://remote.example/inbox", &body, &key)?;
/// ```
pub fn sign_request(
    method: &str,
    url: &str,
    body: &[u8],
    key: &SigningKey,
) -> Result<SignatureHeaders, AppError> {
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = host_header_value(&parsed_url)
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;

    let path_and_query = match parsed_url.query() {
        Some(q) => format!("{}?{}", parsed_url.path(), q),
        None => parsed_url.path().to_string(),
    };

    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = generate_digest(body);
    let request_target = format!("{} {}", method.to_lowercase(), path_and_query);

    let signing_string = [
        format!("(request-target): {}", request_target),
        format!("date: {}", date),
        format!("host: {}", host),
        format!("digest: {}", digest),
    ]
    .join("\n");

    let signature = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key.key_id(),
        SIGNED_HEADERS.join(" "),
        key.sign(signing_string.as_bytes())
    );

    Ok(SignatureHeaders {
        signature,
        date,
        digest,
        host,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("SHA-256={}", BASE64.encode(hash))
}

// =============================================================================
// Verification
// =============================================================================

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, SignatureError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim().trim_matches('"');

            match key.trim() {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    let missing = |field: &str| SignatureError::Malformed(format!("missing {}", field));

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| missing("keyId"))?,
        // Mastodon omits it on occasion; rsa-sha256 is the only thing we verify.
        algorithm: algorithm.unwrap_or_else(|| "rsa-sha256".to_string()),
        headers: headers.ok_or_else(|| missing("headers"))?,
        signature: signature.ok_or_else(|| missing("signature"))?,
    })
}

fn header_str<'a>(
    headers: &'a http::HeaderMap,
    name: &'static str,
) -> Result<&'a str, SignatureError> {
    headers
        .get(name)
        .ok_or(SignatureError::MissingHeader(name))?
        .to_str()
        .map_err(|_| SignatureError::Malformed(format!("non-ascii {} header", name)))
}

/// Read and parse the Signature header of a request
pub fn parse_request_signature(
    headers: &http::HeaderMap,
) -> Result<ParsedSignature, SignatureError> {
    parse_signature_header(header_str(headers, "signature")?)
}

/// Verify a parsed signature against a public key
///
/// Checks, in order: algorithm, covered headers, body digest, date freshness,
/// and finally the RSA signature over the reconstructed signing string.
pub fn verify_parsed_signature(
    parsed: &ParsedSignature,
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: &[u8],
    public_key_pem: &str,
    max_age_secs: i64,
) -> Result<(), SignatureError> {
    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(SignatureError::UnsupportedAlgorithm(parsed.algorithm.clone()));
    }

    for required in SIGNED_HEADERS {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(SignatureError::UnsignedHeader(required));
        }
    }

    if header_str(headers, "digest")? != generate_digest(body) {
        return Err(SignatureError::DigestMismatch);
    }

    let date = DateTime::parse_from_rfc2822(header_str(headers, "date")?)
        .map_err(|_| SignatureError::Malformed("invalid date format".to_string()))?;
    if (Utc::now().timestamp() - date.timestamp()).abs() > max_age_secs {
        return Err(SignatureError::StaleDate);
    }

    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            "host" => header_str(headers, "host")?.to_string(),
            "date" => header_str(headers, "date")?.to_string(),
            "digest" => header_str(headers, "digest")?.to_string(),
            "content-type" => header_str(headers, "content-type")?.to_string(),
            other => {
                return Err(SignatureError::Malformed(format!(
                    "unsupported header in signature: {}",
                    other
                )));
            }
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }
    let signing_string = signing_parts.join("\n");

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| SignatureError::Malformed("invalid signature encoding".to_string()))?;
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| SignatureError::Malformed("invalid signature format".to_string()))?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|_| SignatureError::Mismatch)?;
    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public_key);

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| SignatureError::Mismatch)
}

/// Verify an HTTP request signature against a known public key
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: &[u8],
    public_key_pem: &str,
    max_age_secs: i64,
) -> Result<(), SignatureError> {
    let parsed = parse_request_signature(headers)?;
    verify_parsed_signature(
        &parsed,
        method,
        path,
        headers,
        body,
        public_key_pem,
        max_age_secs,
    )
}

/// The authenticated sender of an inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSigner {
    pub key_id: String,
    /// Identifier of the actor owning the key
    pub actor_id: String,
}

/// Authenticates inbound deliveries against keys already in the store
pub struct SignatureVerifier {
    db: Arc<Database>,
    max_age_secs: i64,
}

impl SignatureVerifier {
    pub fn new(db: Arc<Database>, max_age_secs: i64) -> Self {
        Self { db, max_age_secs }
    }

    /// Verify a request before its body is parsed
    ///
    /// # Errors
    /// `Unauthorized` for a malformed header, an unknown key id or a
    /// cryptographic mismatch.
    pub async fn verify(
        &self,
        method: &str,
        path: &str,
        headers: &http::HeaderMap,
        body: &[u8],
    ) -> Result<VerifiedSigner, AppError> {
        let parsed = parse_request_signature(headers)?;

        let key = self
            .db
            .get_public_key(&parsed.key_id)
            .await?
            .ok_or_else(|| SignatureError::UnknownKey(parsed.key_id.clone()))?;

        if let Err(e) = verify_parsed_signature(
            &parsed,
            method,
            path,
            headers,
            body,
            &key.public_key_pem,
            self.max_age_secs,
        ) {
            tracing::info!(key_id = %parsed.key_id, error = %e, "Rejected inbound signature");
            return Err(e.into());
        }

        Ok(VerifiedSigner {
            key_id: key.key_id,
            actor_id: key.actor_id,
        })
    }
}
