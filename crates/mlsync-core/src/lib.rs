//! Core domain model for MLS listing sync: listings, partitions, sync state and match results.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mlsync-core";

/// Reserved partition for records no known building could claim.
pub const UNMATCHED_PARTITION: &str = "unmatched";

/// An `InProgress` sync state older than this is treated as abandoned.
pub const STALE_LOCK_WINDOW_SECS: i64 = 10 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ListingStatus {
    Active,
    ActiveUnderContract,
    Pending,
    Closed,
    Withdrawn,
    Hold,
    Expired,
    Canceled,
    Unknown,
}

impl ListingStatus {
    /// Parses the upstream `StandardStatus` vocabulary, tolerating spacing and case drift.
    pub fn from_upstream(raw: &str) -> Self {
        let folded = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match folded.as_str() {
            "active" => Self::Active,
            "activeundercontract" => Self::ActiveUnderContract,
            "pending" => Self::Pending,
            "closed" | "sold" => Self::Closed,
            "withdrawn" => Self::Withdrawn,
            "hold" | "onhold" => Self::Hold,
            "expired" => Self::Expired,
            "canceled" | "cancelled" => Self::Canceled,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::ActiveUnderContract => "ActiveUnderContract",
            Self::Pending => "Pending",
            Self::Closed => "Closed",
            Self::Withdrawn => "Withdrawn",
            Self::Hold => "Hold",
            Self::Expired => "Expired",
            Self::Canceled => "Canceled",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListingType {
    Sale,
    Lease,
}

/// Provenance of a record. When the same id is seen from both origins,
/// `AutoSync` is authoritative over `BulkImport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    BulkImport,
    AutoSync,
}

impl Origin {
    /// Higher rank wins during global dedup.
    pub fn authority_rank(&self) -> u8 {
        match self {
            Self::BulkImport => 0,
            Self::AutoSync => 1,
        }
    }
}

/// One normalized upstream property record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingRecord {
    pub id: String,
    pub partition_key: Option<String>,
    pub address: String,
    pub unit_label: String,
    pub status: ListingStatus,
    pub listing_type: ListingType,
    pub list_price: f64,
    pub close_price: Option<f64>,
    pub living_area: f64,
    pub bedroom_count: u32,
    pub bathroom_count: f64,
    pub list_date: Option<NaiveDate>,
    pub close_date: Option<NaiveDate>,
    pub modified_at: DateTime<Utc>,
    pub origin: Origin,
    pub imported_at: DateTime<Utc>,
    #[serde(default)]
    pub building_name: Option<String>,
    #[serde(default)]
    pub price_per_sqft: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_remarks: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directions: Option<String>,
}

impl ListingRecord {
    /// Price used for per-area metrics: the close price once sold, otherwise the asking price.
    pub fn effective_price(&self) -> f64 {
        match (self.status, self.close_price) {
            (ListingStatus::Closed, Some(close)) if close > 0.0 => close,
            _ => self.list_price,
        }
    }

    pub fn refresh_price_per_sqft(&mut self) {
        self.price_per_sqft = price_per_area(self.effective_price(), self.living_area);
    }
}

/// A known building; one partition per building key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Building {
    pub key: String,
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchMethod {
    NameMatch,
    AddressMatch,
    StreetNumberFallback,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub partition_key: Option<String>,
    pub confidence: f64,
    pub method: MatchMethod,
}

impl MatchResult {
    pub fn none() -> Self {
        Self {
            partition_key: None,
            confidence: 0.0,
            method: MatchMethod::None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.partition_key.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Full bootstrap of currently visible records.
    Initial,
    /// Only records changed after the stored watermark.
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Idle,
    InProgress,
    Success,
    Error,
}

/// Singleton sync bookkeeping persisted between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub watermark: String,
    pub status: SyncStatus,
    pub last_run_at: DateTime<Utc>,
    #[serde(default)]
    pub counts_by_status: BTreeMap<String, usize>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub last_mode: Option<SyncMode>,
    #[serde(default)]
    pub run_id: Option<Uuid>,
}

impl SyncState {
    pub fn idle(now: DateTime<Utc>) -> Self {
        Self {
            watermark: String::new(),
            status: SyncStatus::Idle,
            last_run_at: now,
            counts_by_status: BTreeMap::new(),
            error_message: None,
            last_mode: None,
            run_id: None,
        }
    }

    pub fn has_watermark(&self) -> bool {
        !self.watermark.trim().is_empty()
    }

    /// True when a run is marked in progress and has not yet gone stale.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SyncStatus::InProgress
            && (now - self.last_run_at).num_seconds() < STALE_LOCK_WINDOW_SECS
    }
}

/// Strips an alphabetic source-system prefix (`ACT1234` -> `1234`).
///
/// Ids without a non-alphabetic remainder are returned trimmed but otherwise unchanged.
pub fn normalize_id(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = trimmed.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    if stripped.is_empty() {
        trimmed.to_string()
    } else {
        stripped.to_string()
    }
}

/// Title-cases text the upstream sends in all caps; mixed-case text passes through.
pub fn title_case_if_shouting(text: &str) -> String {
    let has_alpha = text.chars().any(|c| c.is_alphabetic());
    let has_lower = text.chars().any(|c| c.is_lowercase());
    if !has_alpha || has_lower {
        return text.to_string();
    }
    text.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    let mut s = String::new();
                    s.extend(first.to_uppercase());
                    s.push_str(&chars.as_str().to_lowercase());
                    s
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Rounded price per unit area; `None` when either side is missing or non-positive.
pub fn price_per_area(price: f64, area: f64) -> Option<f64> {
    if !price.is_finite() || !area.is_finite() || price <= 0.0 || area <= 0.0 {
        return None;
    }
    Some(((price / area) * 100.0).round() / 100.0)
}

pub fn is_valid_partition_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn normalize_id_collapses_alphabetic_prefixes() {
        for prefix in ["ACT", "actris", "X", "MLS"] {
            let raw = format!("{prefix}7654321");
            assert_eq!(normalize_id(&raw), "7654321");
        }
        assert_eq!(normalize_id("7654321"), normalize_id("ACT7654321"));
        assert_eq!(normalize_id("  ACT42 "), "42");
        assert_eq!(normalize_id("LEGACY"), "LEGACY");
    }

    #[test]
    fn title_case_only_touches_all_caps_text() {
        assert_eq!(title_case_if_shouting("222 WEST AVE"), "222 West Ave");
        assert_eq!(title_case_if_shouting("The Modern Austin"), "The Modern Austin");
        assert_eq!(title_case_if_shouting("1205"), "1205");
    }

    #[test]
    fn price_per_area_guards_zero_area() {
        assert_eq!(price_per_area(500_000.0, 1_000.0), Some(500.0));
        assert_eq!(price_per_area(500_000.0, 0.0), None);
        assert_eq!(price_per_area(0.0, 900.0), None);
        assert_eq!(price_per_area(100.0, 3.0), Some(33.33));
    }

    #[test]
    fn status_parsing_tolerates_upstream_spelling() {
        assert_eq!(
            ListingStatus::from_upstream("Active Under Contract"),
            ListingStatus::ActiveUnderContract
        );
        assert_eq!(ListingStatus::from_upstream("Cancelled"), ListingStatus::Canceled);
        assert_eq!(ListingStatus::from_upstream("ComingSoon"), ListingStatus::Unknown);
    }

    #[test]
    fn lock_goes_stale_after_window() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        let mut state = SyncState::idle(t);
        state.status = SyncStatus::InProgress;
        assert!(state.is_locked_at(t + Duration::minutes(5)));
        assert!(!state.is_locked_at(t + Duration::minutes(11)));
    }

    #[test]
    fn listing_record_serializes_camel_case() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        let record = ListingRecord {
            id: "1".into(),
            partition_key: None,
            address: "222 West Ave".into(),
            unit_label: "1205".into(),
            status: ListingStatus::Active,
            listing_type: ListingType::Sale,
            list_price: 500_000.0,
            close_price: None,
            living_area: 1_000.0,
            bedroom_count: 1,
            bathroom_count: 1.0,
            list_date: None,
            close_date: None,
            modified_at: t,
            origin: Origin::AutoSync,
            imported_at: t,
            building_name: None,
            price_per_sqft: None,
            public_remarks: None,
            directions: None,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("partitionKey").is_some());
        assert!(value.get("publicRemarks").is_none());
        assert_eq!(value["origin"], "AutoSync");
    }
}
