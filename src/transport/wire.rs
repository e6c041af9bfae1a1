//! JSON wire format for batches travelling between watch and phone.
//!
//! ```text
//! { "sessionKey": "2024-07-02 12:00:00.000",
//!   "readings": [ { "time": 0.0, "accelerationX": ..., "yaw": ... }, ... ],
//!   "messageId": "8c1f..." }            // only on guaranteed delivery
//! ```
//!
//! Decoding is the boundary where malformed input is rejected: a message
//! that fails here never reaches the store.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{is_safe_session_key, Batch, Reading};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    session_key: String,
    readings: Vec<Reading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message_id: Option<Uuid>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireMessageRef<'a> {
    session_key: &'a str,
    readings: &'a [Reading],
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<Uuid>,
}

pub fn encode(batch: &Batch) -> Result<String> {
    let message = WireMessageRef {
        session_key: &batch.session_key,
        readings: &batch.readings,
        message_id: batch.message_id,
    };
    serde_json::to_string(&message).context("failed to encode batch")
}

pub fn decode(payload: &[u8]) -> Result<Batch> {
    let message: WireMessage =
        serde_json::from_slice(payload).context("malformed batch message")?;

    if !is_safe_session_key(&message.session_key) {
        bail!("invalid session key {:?}", message.session_key);
    }
    if message.readings.is_empty() {
        bail!("batch for session {} carries no readings", message.session_key);
    }
    for (index, reading) in message.readings.iter().enumerate() {
        reading
            .validate()
            .with_context(|| format!("reading {index} of session {}", message.session_key))?;
    }

    Ok(Batch {
        session_key: message.session_key,
        readings: message.readings,
        message_id: message.message_id,
    })
}
