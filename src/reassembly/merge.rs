use std::{collections::HashSet, str::FromStr};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::models::Reading;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergePolicy {
    /// Plain append: redeliveries duplicate readings and late batches land
    /// out of time order.
    Append,
    /// Readings are identified by (session key, time offset). Known offsets
    /// are skipped and the session is kept sorted by offset.
    Idempotent,
}

impl FromStr for MergePolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "append" => Ok(MergePolicy::Append),
            "idempotent" | "dedup" | "deduplicate" => Ok(MergePolicy::Idempotent),
            other => Err(anyhow!("unknown merge policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    /// The batch opened a new session.
    pub created: bool,
    pub accepted: usize,
    pub skipped: usize,
    /// The batch landed before existing readings and the session was re-sorted.
    pub reordered: bool,
    pub session_len: usize,
}

/// Merges `incoming` into `existing`. `None` in the result means the
/// session is unchanged.
pub fn merge_readings(
    existing: Option<&[Reading]>,
    incoming: Vec<Reading>,
    policy: MergePolicy,
) -> (Option<Vec<Reading>>, MergeOutcome) {
    let current = existing.unwrap_or_default();
    let mut outcome = MergeOutcome {
        created: existing.is_none(),
        ..MergeOutcome::default()
    };

    let incoming = match policy {
        MergePolicy::Append => incoming,
        MergePolicy::Idempotent => {
            let mut seen: HashSet<u64> = current.iter().map(|r| offset_identity(r.time)).collect();
            let before = incoming.len();
            let fresh: Vec<Reading> = incoming
                .into_iter()
                .filter(|r| seen.insert(offset_identity(r.time)))
                .collect();
            outcome.skipped = before - fresh.len();
            fresh
        }
    };

    outcome.accepted = incoming.len();
    if incoming.is_empty() && existing.is_some() {
        outcome.session_len = current.len();
        return (None, outcome);
    }

    let mut next = Vec::with_capacity(current.len() + incoming.len());
    next.extend_from_slice(current);
    next.extend(incoming);

    if policy == MergePolicy::Idempotent && !is_time_ordered(&next) {
        next.sort_by(|a, b| a.time.total_cmp(&b.time));
        outcome.reordered = true;
    }

    outcome.session_len = next.len();
    (Some(next), outcome)
}

fn offset_identity(time: f64) -> u64 {
    // -0.0 and 0.0 are the same offset.
    if time == 0.0 {
        0.0f64.to_bits()
    } else {
        time.to_bits()
    }
}

fn is_time_ordered(readings: &[Reading]) -> bool {
    readings.windows(2).all(|pair| pair[0].time <= pair[1].time)
}
