//! Kind-specific payload validation

use crate::types::DocumentKind;
use crate::{Error, Result};

/// Payload validation collaborator, consulted on create
pub trait PayloadValidator: Send + Sync {
    /// Reject a payload that cannot be submitted as `kind`
    fn validate(&self, kind: DocumentKind, payload: &serde_json::Value) -> Result<()>;
}

/// Structural checks shared by every kind: the payload is a non-empty JSON
/// object carrying the fields the kind cannot be sent without.
#[derive(Debug, Clone, Default)]
pub struct BasicValidator;

impl BasicValidator {
    fn required_fields(kind: DocumentKind) -> &'static [&'static str] {
        match kind {
            DocumentKind::Invoice => &["customer", "lines"],
            DocumentKind::Voucher => &["customer", "lines"],
            DocumentKind::Despatch => &["receiver", "lines"],
        }
    }
}

impl PayloadValidator for BasicValidator {
    fn validate(&self, kind: DocumentKind, payload: &serde_json::Value) -> Result<()> {
        let object = payload
            .as_object()
            .ok_or_else(|| Error::Validation(format!("{} payload must be a JSON object", kind)))?;

        for field in Self::required_fields(kind) {
            match object.get(*field) {
                None | Some(serde_json::Value::Null) => {
                    return Err(Error::Validation(format!("{} payload is missing `{}`", kind, field)));
                }
                _ => {}
            }
        }

        if let Some(lines) = object.get("lines") {
            if lines.as_array().map_or(true, |lines| lines.is_empty()) {
                return Err(Error::Validation(format!("{} needs at least one line", kind)));
            }
        }

        Ok(())
    }
}

/// Accepts everything
#[derive(Debug, Clone, Default)]
pub struct AcceptAll;

impl PayloadValidator for AcceptAll {
    fn validate(&self, _kind: DocumentKind, _payload: &serde_json::Value) -> Result<()> {
        Ok(())
    }
}
