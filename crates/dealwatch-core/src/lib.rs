//! Core domain model and operator-input parsing for dealwatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "dealwatch-core";

/// Latest known price/discount snapshot for one product.
///
/// The store keeps at most one of these per `id`; every fetch cycle overwrites
/// the previous row (last write wins, no history).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountRecord {
    pub id: i64,
    pub name: String,
    pub price: f64,
    /// Percentage points off list price.
    pub discount: f64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdListError {
    #[error("empty product id list")]
    Empty,
    #[error("invalid product id {input:?}")]
    Invalid { input: String },
    #[error("product ids must be positive, got {value}")]
    NonPositive { value: i64 },
}

/// Parse the operator-supplied comma-separated product id list ("1, 2,3").
///
/// Ids must be positive integers; blank segments are tolerated, an entirely
/// blank input is not.
pub fn parse_id_list(input: &str) -> Result<Vec<i64>, IdListError> {
    let mut ids = Vec::new();
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let value: i64 = part
            .parse()
            .map_err(|_| IdListError::Invalid { input: part.to_string() })?;
        if value <= 0 {
            return Err(IdListError::NonPositive { value });
        }
        ids.push(value);
    }
    if ids.is_empty() {
        return Err(IdListError::Empty);
    }
    Ok(ids)
}

/// Serialize a batch as newline-delimited JSON, one record per line.
///
/// Pass-through serialization with no schema versioning; this is the download
/// artifact offered to the operator.
pub fn to_jsonl(records: &[DiscountRecord]) -> Result<String, serde_json::Error> {
    let mut lines = Vec::with_capacity(records.len());
    for record in records {
        lines.push(serde_json::to_string(record)?);
    }
    Ok(lines.join("\n"))
}
