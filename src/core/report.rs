//! Encoding and decoding of the structured outcome a remote job embeds in
//! its step log.
//!
//! The transport only preserves step messages (anything else the job prints
//! is dropped) and truncates a single message at 4096 bytes. The outcome is
//! therefore carried in a dedicated step named `result`, as
//! `ECHOPORT_RESULT:` followed by a compact JSON object holding identifiers
//! and scalar metrics only. The full manifest stays in the archive.

use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

use crate::remote::Step;

/// Step name that carries the machine-readable outcome.
pub const RESULT_STEP_NAME: &str = "result";

/// Tag prefixing the JSON payload inside the result step's message.
pub const RESULT_TAG: &str = "ECHOPORT_RESULT";

/// Size ceiling the transport applies to a single step message.
pub const MESSAGE_CEILING: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("no '{RESULT_STEP_NAME}' step in the job's step log")]
    MissingResultStep,
    #[error("result step message does not carry an {RESULT_TAG} payload")]
    TagMismatch,
    #[error("malformed result JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("result payload field '{0}' is missing or has the wrong type")]
    BadField(&'static str),
}

#[derive(Debug, thiserror::Error)]
#[error("encoded result payload is {size} bytes, over the {MESSAGE_CEILING}-byte step message ceiling")]
pub struct PayloadTooLarge {
    pub size: usize,
}

/// Outcome a backup job reports through its result step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupReport {
    Completed {
        bucket: String,
        key: String,
        size_bytes: u64,
        checksum_sha256: String,
        file_count: u64,
    },
    Failed {
        error: String,
    },
}

/// Outcome a restore job reports through its result step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreReport {
    Completed { files_restored: u64 },
    Failed { error: String },
}

// Strict field sets required once `success` is true. Extra JSON fields are
// ignored; missing or mistyped ones reject the whole payload.
#[derive(Deserialize)]
struct BackupPayload {
    bucket: String,
    key: String,
    size_bytes: u64,
    checksum_sha256: String,
    file_count: u64,
}

#[derive(Deserialize)]
struct RestorePayload {
    files_restored: u64,
}

/// Render a backup report as the exact step message the remote job emits.
pub fn encode_backup(report: &BackupReport) -> Result<String, PayloadTooLarge> {
    let value = match report {
        BackupReport::Completed {
            bucket,
            key,
            size_bytes,
            checksum_sha256,
            file_count,
        } => serde_json::json!({
            "success": true,
            "bucket": bucket,
            "key": key,
            "size_bytes": size_bytes,
            "checksum_sha256": checksum_sha256,
            "file_count": file_count,
        }),
        BackupReport::Failed { error } => serde_json::json!({
            "success": false,
            "error": error,
        }),
    };
    encode_payload(&value)
}

pub fn encode_restore(report: &RestoreReport) -> Result<String, PayloadTooLarge> {
    let value = match report {
        RestoreReport::Completed { files_restored } => serde_json::json!({
            "success": true,
            "files_restored": files_restored,
        }),
        RestoreReport::Failed { error } => serde_json::json!({
            "success": false,
            "error": error,
        }),
    };
    encode_payload(&value)
}

fn encode_payload(value: &serde_json::Value) -> Result<String, PayloadTooLarge> {
    let message = format!("{RESULT_TAG}:{value}");
    if message.len() > MESSAGE_CEILING {
        return Err(PayloadTooLarge {
            size: message.len(),
        });
    }
    Ok(message)
}

pub fn decode_backup_report(steps: &[Step]) -> Result<BackupReport, DecodeError> {
    let value = extract_payload(steps)?;
    if !require_bool(&value, "success")? {
        return Ok(BackupReport::Failed {
            error: failure_error(&value),
        });
    }
    let payload: BackupPayload = serde_json::from_value(value)?;
    Ok(BackupReport::Completed {
        bucket: payload.bucket,
        key: payload.key,
        size_bytes: payload.size_bytes,
        checksum_sha256: payload.checksum_sha256,
        file_count: payload.file_count,
    })
}

pub fn decode_restore_report(steps: &[Step]) -> Result<RestoreReport, DecodeError> {
    let value = extract_payload(steps)?;
    if !require_bool(&value, "success")? {
        return Ok(RestoreReport::Failed {
            error: failure_error(&value),
        });
    }
    let payload: RestorePayload = serde_json::from_value(value)?;
    Ok(RestoreReport::Completed {
        files_restored: payload.files_restored,
    })
}

/// Locate the result step and parse its tagged JSON payload.
///
/// Only the step named `result` is consulted; a tag appearing in any other
/// step's message is ignored. The regex tolerates text around the payload
/// but never repairs the payload itself.
fn extract_payload(steps: &[Step]) -> Result<serde_json::Value, DecodeError> {
    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    let re = TAG_RE.get_or_init(|| {
        Regex::new(&format!(r"{RESULT_TAG}:(\{{.*\}})")).expect("hard-coded pattern")
    });

    let step = steps
        .iter()
        .find(|s| s.name == RESULT_STEP_NAME)
        .ok_or(DecodeError::MissingResultStep)?;

    let captures = re.captures(&step.message).ok_or(DecodeError::TagMismatch)?;
    let raw = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
    Ok(serde_json::from_str(raw)?)
}

fn require_bool(value: &serde_json::Value, field: &'static str) -> Result<bool, DecodeError> {
    value
        .get(field)
        .and_then(serde_json::Value::as_bool)
        .ok_or(DecodeError::BadField(field))
}

fn failure_error(value: &serde_json::Value) -> String {
    value
        .get("error")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("remote job reported failure without detail")
        .to_string()
}
