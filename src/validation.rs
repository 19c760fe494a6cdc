//! Field presence and shape checks shared by the lifecycle services.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::errors::{ServiceError, ServiceResult};

static ORDER_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ORD-\d{8}-\d{5}$").expect("static regex"));
static REMITTANCE_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^REM-\d{8}-\d{5}$").expect("static regex"));

/// Content types accepted for payment and delivery proofs, with the extension stored.
const PROOF_CONTENT_TYPES: &[(&str, &str)] = &[
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/webp", "webp"),
    ("application/pdf", "pdf"),
];

pub fn is_valid_uuid(value: &str) -> bool {
    Uuid::parse_str(value.trim()).is_ok()
}

pub fn parse_uuid(field: &str, value: &str) -> ServiceResult<Uuid> {
    Uuid::parse_str(value.trim())
        .map_err(|_| ServiceError::validation(format!("{field} must be a valid UUID")))
}

pub fn is_valid_order_number(value: &str) -> bool {
    ORDER_NUMBER_RE.is_match(value)
}

pub fn is_valid_remittance_number(value: &str) -> bool {
    REMITTANCE_NUMBER_RE.is_match(value)
}

/// Returns the trimmed value, or a validation error naming `field` when blank.
pub fn require_non_empty<'a>(field: &str, value: &'a str) -> ServiceResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::validation(format!("{field} is required")));
    }
    Ok(trimmed)
}

/// Like [`require_non_empty`] for optional input.
pub fn require_present<'a>(field: &str, value: Option<&'a str>) -> ServiceResult<&'a str> {
    require_non_empty(field, value.unwrap_or_default())
}

pub fn require_positive(field: &str, value: Decimal) -> ServiceResult<Decimal> {
    if value <= Decimal::ZERO {
        return Err(ServiceError::validation(format!(
            "{field} must be greater than zero"
        )));
    }
    Ok(value)
}

pub fn require_non_negative(field: &str, value: Decimal) -> ServiceResult<Decimal> {
    if value < Decimal::ZERO {
        return Err(ServiceError::validation(format!("{field} must not be negative")));
    }
    Ok(value)
}

pub fn require_positive_quantity(field: &str, value: i32) -> ServiceResult<i32> {
    if value <= 0 {
        return Err(ServiceError::validation(format!(
            "{field} must be greater than zero"
        )));
    }
    Ok(value)
}

/// An uploaded proof document (payment receipt or delivery evidence).
#[derive(Debug, Clone)]
pub struct ProofFile {
    pub content_type: String,
    pub bytes: Bytes,
}

impl ProofFile {
    pub fn new(content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Checks a proof file and returns the extension it will be stored under.
pub fn validate_proof_file(file: &ProofFile, max_size_bytes: usize) -> ServiceResult<&'static str> {
    if file.is_empty() {
        return Err(ServiceError::validation("proof file is empty"));
    }
    if file.len() > max_size_bytes {
        return Err(ServiceError::validation(format!(
            "proof file is {} bytes; the limit is {} bytes",
            file.len(),
            max_size_bytes
        )));
    }
    let content_type = file.content_type.trim().to_ascii_lowercase();
    PROOF_CONTENT_TYPES
        .iter()
        .find(|(ct, _)| *ct == content_type)
        .map(|(_, ext)| *ext)
        .ok_or_else(|| {
            ServiceError::validation(format!(
                "unsupported proof content type '{}'; expected one of: {}",
                file.content_type,
                PROOF_CONTENT_TYPES
                    .iter()
                    .map(|(ct, _)| *ct)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
}

/// Storage path for a proof: `{bucket}/{owner}/{entity}/{timestamp}.{ext}`.
pub fn proof_path(bucket: &str, owner: Uuid, entity: Uuid, at: DateTime<Utc>, ext: &str) -> String {
    format!(
        "{}/{}/{}/{}.{}",
        bucket.trim_end_matches('/'),
        owner,
        entity,
        at.timestamp_millis(),
        ext
    )
}
