//! # Webhook Signature Verification
//!
//! HMAC-SHA256 verification of GitHub deliveries. The digest is computed over
//! the raw body bytes exactly as received and compared in constant time.

use hmac::{Hmac, Mac};
use metrics::counter;
use sha2::Sha256;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the `sha256=<hex>` digest.
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Errors that can occur during webhook signature verification
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Missing required signature header: {header}")]
    MissingSignature { header: String },

    #[error("Invalid signature format: {header}")]
    InvalidSignatureFormat { header: String },

    #[error("Signature verification failed")]
    VerificationFailed,
}

/// Result type for webhook verification
pub type VerificationResult<T> = Result<T, VerificationError>;

/// How a delivery passed the signature check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureOutcome {
    /// The digest matched the configured secret.
    Verified,
    /// No secret is configured, so nothing was checked.
    Skipped,
}

impl SignatureOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureOutcome::Verified => "verified",
            SignatureOutcome::Skipped => "skipped",
        }
    }
}

/// Computes the `sha256=<hex>` header value GitHub would send for `body`.
pub fn sign_github_payload(body: &[u8], secret: &[u8]) -> VerificationResult<String> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| VerificationError::VerificationFailed)?;
    mac.update(body);
    Ok(format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Verifies a GitHub webhook signature using HMAC-SHA256
pub fn verify_github_signature(
    body: &[u8],
    signature_header: &str,
    secret: &[u8],
) -> VerificationResult<()> {
    debug!(
        body_size = body.len(),
        "Starting GitHub signature verification"
    );

    if signature_header.is_empty() {
        return Err(VerificationError::MissingSignature {
            header: SIGNATURE_HEADER.to_string(),
        });
    }

    let Some(provided_hex) = signature_header.strip_prefix(SIGNATURE_PREFIX) else {
        return Err(VerificationError::InvalidSignatureFormat {
            header: format!("{} must start with '{}'", SIGNATURE_HEADER, SIGNATURE_PREFIX),
        });
    };

    let provided_bytes =
        hex::decode(provided_hex).map_err(|_| VerificationError::InvalidSignatureFormat {
            header: format!("{} contains invalid hex", SIGNATURE_HEADER),
        })?;

    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| VerificationError::VerificationFailed)?;
    mac.update(body);
    let expected_bytes = mac.finalize().into_bytes();

    let expected_bytes: &[u8] = expected_bytes.as_ref();
    if subtle::ConstantTimeEq::ct_eq(expected_bytes, &provided_bytes[..]).into() {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

/// Applies the delivery signature policy.
///
/// With no secret configured the check is skipped. With a secret configured a
/// missing header is a failure, since the operator opted into verification.
pub fn check_delivery_signature(
    body: &[u8],
    signature_header: Option<&str>,
    secret: Option<&[u8]>,
) -> VerificationResult<SignatureOutcome> {
    let Some(secret) = secret else {
        counter!("webhook_signature_checks_total", "outcome" => "skipped").increment(1);
        info!(
            signature = SignatureOutcome::Skipped.as_str(),
            "Signature validation disabled; GITHUB_SIGNATURE_SECRET is not set"
        );
        return Ok(SignatureOutcome::Skipped);
    };

    let result = match signature_header {
        Some(header) => verify_github_signature(body, header, secret),
        None => Err(VerificationError::MissingSignature {
            header: SIGNATURE_HEADER.to_string(),
        }),
    };

    match result {
        Ok(()) => {
            counter!("webhook_signature_checks_total", "outcome" => "verified").increment(1);
            debug!(
                signature = SignatureOutcome::Verified.as_str(),
                "Signature verified"
            );
            Ok(SignatureOutcome::Verified)
        }
        Err(err) => {
            counter!("webhook_signature_checks_total", "outcome" => "rejected").increment(1);
            warn!(signature = "rejected", error = %err, "Signature verification failed");
            Err(err)
        }
    }
}
