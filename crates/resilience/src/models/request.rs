use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Inclusive calendar range a request covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    /// A range covering a single day.
    pub fn day(date: NaiveDate) -> Self {
        Self { from: date, to: date }
    }

    /// Whether the range reaches past `today`.
    pub fn is_forward_looking(&self, today: NaiveDate) -> bool {
        self.to > today
    }

    /// The same range with its upper bound capped at `today`.
    pub fn capped_at(&self, today: NaiveDate) -> Self {
        Self {
            from: self.from.min(today),
            to: self.to.min(today),
        }
    }
}

/// Parameters of one logical request, as issued by a pipeline phase.
///
/// `date_bucket` is the trading day the request is about; it is part of
/// the cache key. `range` is the span of data requested, when the request
/// is range-shaped (historical bars, chains over an expiry window).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchParams {
    pub params: BTreeMap<String, String>,
    pub date_bucket: NaiveDate,
    pub range: Option<DateRange>,
}

impl FetchParams {
    pub fn new(date_bucket: NaiveDate) -> Self {
        Self {
            params: BTreeMap::new(),
            date_bucket,
            range: None,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_range(mut self, range: DateRange) -> Self {
        self.range = Some(range);
        self
    }
}

/// A request bound to one provider's endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderRequest {
    pub endpoint: String,
    pub params: BTreeMap<String, String>,
    pub date_bucket: NaiveDate,
    pub range: Option<DateRange>,
}

impl ProviderRequest {
    pub fn new(endpoint: impl Into<String>, fetch: &FetchParams) -> Self {
        Self {
            endpoint: endpoint.into(),
            params: fetch.params.clone(),
            date_bucket: fetch.date_bucket,
            range: fetch.range,
        }
    }

    /// Stable digest of the query parameters and requested range.
    ///
    /// Parameters are hashed in key order (`BTreeMap`), so two requests with
    /// the same parameters always land on the same cache file.
    pub fn param_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, value) in &self.params {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"&");
        }
        hasher.update(b"|");
        if let Some(range) = &self.range {
            hasher.update(range.from.format("%Y-%m-%d").to_string().as_bytes());
            hasher.update(b"..");
            hasher.update(range.to.format("%Y-%m-%d").to_string().as_bytes());
        }
        let digest = hasher.finalize();
        hex::encode(&digest[..16])
    }
}
