//! Failure classification for provider call logs
//!
//! Advisory only: nothing in the order flow branches on a diagnosis.

use crate::models::ErrorDiagnosis;

const CORS_HINTS: &[&str] = &["cors", "access-control", "cross-origin"];
const AUTH_HINTS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "authentication",
    "api key",
    "apikey",
    "access key",
    "apiaccesskey",
    "invalid key",
    "credential",
];
const PARAM_HINTS: &[&str] = &[
    "parameter",
    "required",
    "missing",
    "invalid field",
    "invalid service",
    "invalid imei",
    "not valid",
];
const SERVER_HINTS: &[&str] = &[
    "timed out",
    "timeout",
    "internal server",
    "service unavailable",
    "bad gateway",
    "connection failed",
];

fn mentions(message: &str, hints: &[&str]) -> bool {
    hints.iter().any(|hint| message.contains(hint))
}

/// Classify a failed provider call from its HTTP status (if any) and error text
pub fn diagnose(http_status: Option<u16>, error_message: &str) -> ErrorDiagnosis {
    let message = error_message.to_lowercase();
    let mut diagnosis = ErrorDiagnosis {
        is_cors: mentions(&message, CORS_HINTS),
        is_authentication: matches!(http_status, Some(401 | 403)) || mentions(&message, AUTH_HINTS),
        is_parameter_mismatch: matches!(http_status, Some(400 | 422))
            || mentions(&message, PARAM_HINTS),
        is_server_error: matches!(http_status, Some(s) if s >= 500)
            || mentions(&message, SERVER_HINTS),
        suggestions: Vec::new(),
    };

    if diagnosis.is_cors {
        diagnosis
            .suggestions
            .push("Call the provider from the server side; browsers block cross-origin requests".into());
    }
    if diagnosis.is_authentication {
        diagnosis
            .suggestions
            .push("Verify the provider username and API key".into());
    }
    if diagnosis.is_parameter_mismatch {
        diagnosis
            .suggestions
            .push("Check the service mapping and required order fields (IMEI, service id)".into());
    }
    if diagnosis.is_server_error {
        diagnosis
            .suggestions
            .push("Provider is failing or slow; retry later or contact the provider".into());
    }
    if diagnosis.suggestions.is_empty() {
        diagnosis
            .suggestions
            .push("Inspect the detailed log for the raw provider response".into());
    }

    diagnosis
}
