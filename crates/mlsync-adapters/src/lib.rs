//! Upstream MLS replication client and manual bulk-import bundles.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use mlsync_core::{
    normalize_id, title_case_if_shouting, ListingRecord, ListingStatus, ListingType, Origin, SyncMode,
};
use mlsync_storage::{FetchError, JsonTransport, RateLimitConfig, RateLimitedHttpClient};
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "mlsync-adapters";

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("fetching {category} page {page} ({url}): {source}")]
    Page {
        category: String,
        page: usize,
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("unexpected envelope on {category} page {page}: {source}")]
    Envelope {
        category: String,
        page: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("incremental sync requested without a watermark")]
    MissingWatermark,
    #[error("watermark {0:?} is not an RFC 3339 timestamp")]
    InvalidWatermark(String),
    #[error("invalid upstream url {url}: {message}")]
    InvalidUrl { url: String, message: String },
}

impl ReplicationError {
    pub fn is_safety_cap(&self) -> bool {
        matches!(self, Self::Page { source, .. } if source.is_safety_cap())
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One upstream property category queried per cycle. The listing type of every
/// record is derived from the category it was fetched under.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CategoryQuery {
    pub property_type: String,
    pub listing_type: ListingType,
}

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub base_url: String,
    pub originating_system: String,
    pub categories: Vec<CategoryQuery>,
    /// Client-side `MLSAreaMajor` equality filter.
    pub area_code: Option<String>,
    /// Client-side `PropertySubType` allow-list; empty keeps everything.
    pub property_subtypes: Vec<String>,
    /// Optional server-side `StandardStatus in (...)` filter.
    pub status_filter: Vec<String>,
    pub page_size: u32,
    pub limits: RateLimitConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.mlsgrid.com/v2/Property".to_string(),
            originating_system: "actris".to_string(),
            categories: vec![
                CategoryQuery {
                    property_type: "Residential".to_string(),
                    listing_type: ListingType::Sale,
                },
                CategoryQuery {
                    property_type: "ResidentialLease".to_string(),
                    listing_type: ListingType::Lease,
                },
            ],
            area_code: Some("DT".to_string()),
            property_subtypes: vec!["Condominium".to_string(), "Townhouse".to_string()],
            status_filter: Vec::new(),
            page_size: 1000,
            limits: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchCycleOutput {
    pub records: Vec<ListingRecord>,
    /// Max change timestamp seen across every category; `None` when nothing carried one.
    pub new_watermark: Option<String>,
    pub pages: usize,
    pub requests: u32,
    pub raw_count: usize,
    pub filtered_out: usize,
    pub skipped: usize,
}

#[derive(Debug, Deserialize)]
struct UpstreamEnvelope {
    #[serde(default)]
    value: Vec<JsonValue>,
    #[serde(default, rename = "@odata.nextLink", alias = "nextLink")]
    next_link: Option<String>,
}

/// Typed view of one upstream item; every field is optional, numeric fields
/// accept either numbers or numeric strings and text fields accept bare numbers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UpstreamListing {
    #[serde(deserialize_with = "lenient_string")]
    pub listing_key: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub listing_id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub standard_status: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub property_type: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub property_sub_type: Option<String>,
    #[serde(rename = "MLSAreaMajor", deserialize_with = "lenient_string")]
    pub mls_area_major: Option<String>,
    #[serde(deserialize_with = "lenient_bool")]
    pub mlg_can_view: Option<bool>,
    #[serde(deserialize_with = "lenient_string")]
    pub unparsed_address: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub street_number: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub street_name: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub street_suffix: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub unit_number: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub building_name: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub subdivision_name: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    pub list_price: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    pub close_price: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    pub living_area: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    pub bedrooms_total: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    pub bathrooms_total_decimal: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    pub bathrooms_total_integer: Option<f64>,
    #[serde(deserialize_with = "lenient_date")]
    pub listing_contract_date: Option<NaiveDate>,
    #[serde(deserialize_with = "lenient_date")]
    pub close_date: Option<NaiveDate>,
    #[serde(deserialize_with = "lenient_string")]
    pub modification_timestamp: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub public_remarks: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub directions: Option<String>,
}

impl UpstreamListing {
    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.modification_timestamp
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn raw_id(&self) -> Option<&str> {
        self.listing_id
            .as_deref()
            .or(self.listing_key.as_deref())
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    fn address(&self) -> String {
        if let Some(address) = text_or_none(self.unparsed_address.as_deref()) {
            return address;
        }
        [&self.street_number, &self.street_name, &self.street_suffix]
            .iter()
            .filter_map(|part| text_or_none(part.as_deref()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn text_or_none(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => s.trim().replace([',', '$'], "").parse().ok(),
        _ => None,
    })
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::String(s)) => Some(s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        Some(JsonValue::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::Bool(b)) => Some(b),
        Some(JsonValue::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_date<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<NaiveDate>, D::Error> {
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::String(raw)) => raw
            .trim()
            .get(..10)
            .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()),
        _ => None,
    })
}

fn parse_watermark(raw: &str) -> Result<DateTime<Utc>, ReplicationError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ReplicationError::InvalidWatermark(raw.to_string()))
}

pub fn format_watermark(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn odata_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Converts one typed upstream item into a normalized record. Returns `None` when
/// the item carries no usable id.
pub fn normalize_listing(
    item: &UpstreamListing,
    listing_type: ListingType,
    imported_at: DateTime<Utc>,
) -> Option<ListingRecord> {
    let raw_id = item.raw_id()?;
    let building_name = text_or_none(item.building_name.as_deref())
        .or_else(|| text_or_none(item.subdivision_name.as_deref()))
        .map(|name| title_case_if_shouting(&name));
    let bathroom_count = item
        .bathrooms_total_decimal
        .or(item.bathrooms_total_integer)
        .unwrap_or(0.0);

    let mut record = ListingRecord {
        id: normalize_id(raw_id),
        partition_key: None,
        address: title_case_if_shouting(&item.address()),
        unit_label: text_or_none(item.unit_number.as_deref()).unwrap_or_default(),
        status: item
            .standard_status
            .as_deref()
            .map(ListingStatus::from_upstream)
            .unwrap_or(ListingStatus::Unknown),
        listing_type,
        list_price: item.list_price.unwrap_or(0.0),
        close_price: item.close_price.filter(|p| *p > 0.0),
        living_area: item.living_area.unwrap_or(0.0),
        bedroom_count: item.bedrooms_total.map(|b| b.max(0.0).round() as u32).unwrap_or(0),
        bathroom_count,
        list_date: item.listing_contract_date,
        close_date: item.close_date,
        modified_at: item.modified_at().unwrap_or(imported_at),
        origin: Origin::AutoSync,
        imported_at,
        building_name,
        price_per_sqft: None,
        public_remarks: text_or_none(item.public_remarks.as_deref()),
        directions: text_or_none(item.directions.as_deref()),
    };
    record.refresh_price_per_sqft();
    Some(record)
}

/// Paginated, rate-limited fetch cycles against the upstream property feed.
pub struct ReplicationClient {
    transport: Arc<dyn JsonTransport>,
    config: ReplicationConfig,
}

impl ReplicationClient {
    pub fn new(transport: Arc<dyn JsonTransport>, config: ReplicationConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Server-side filter, restricted to the upstream's filterable fields.
    pub fn build_filter(
        &self,
        category: &CategoryQuery,
        mode: SyncMode,
        watermark: Option<&str>,
    ) -> Result<String, ReplicationError> {
        let mut clauses = vec![
            format!(
                "OriginatingSystemName eq {}",
                odata_quote(&self.config.originating_system)
            ),
            format!("PropertyType eq {}", odata_quote(&category.property_type)),
        ];
        if !self.config.status_filter.is_empty() {
            let statuses = self
                .config
                .status_filter
                .iter()
                .map(|s| odata_quote(s))
                .collect::<Vec<_>>()
                .join(",");
            clauses.push(format!("StandardStatus in ({statuses})"));
        }
        match mode {
            SyncMode::Initial => clauses.push("MlgCanView eq true".to_string()),
            SyncMode::Incremental => {
                let raw = watermark
                    .filter(|w| !w.trim().is_empty())
                    .ok_or(ReplicationError::MissingWatermark)?;
                let since = parse_watermark(raw)?;
                clauses.push(format!("ModificationTimestamp gt {}", format_watermark(since)));
            }
        }
        Ok(clauses.join(" and "))
    }

    pub fn build_query_url(&self, filter: &str) -> Result<String, ReplicationError> {
        let page_size = self.config.page_size.max(1).to_string();
        reqwest::Url::parse_with_params(
            &self.config.base_url,
            &[("$filter", filter), ("$top", page_size.as_str())],
        )
        .map(|url| url.to_string())
        .map_err(|err| ReplicationError::InvalidUrl {
            url: self.config.base_url.clone(),
            message: err.to_string(),
        })
    }

    fn passes_post_filters(&self, item: &UpstreamListing) -> bool {
        if let Some(area) = &self.config.area_code {
            let matches_area = item
                .mls_area_major
                .as_deref()
                .is_some_and(|a| a.trim().eq_ignore_ascii_case(area.trim()));
            if !matches_area {
                return false;
            }
        }
        if !self.config.property_subtypes.is_empty() {
            let Some(subtype) = item.property_sub_type.as_deref() else {
                return false;
            };
            let subtype = subtype.trim();
            if !self
                .config
                .property_subtypes
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(subtype))
            {
                return false;
            }
        }
        true
    }

    /// Runs one full cycle across every configured category. Any failing page aborts
    /// the whole cycle, so a watermark is only ever returned for a complete cycle.
    pub async fn fetch_cycle(
        &self,
        mode: SyncMode,
        watermark: Option<&str>,
    ) -> Result<FetchCycleOutput, ReplicationError> {
        let since = match mode {
            SyncMode::Initial => None,
            SyncMode::Incremental => Some(parse_watermark(
                watermark.ok_or(ReplicationError::MissingWatermark)?,
            )?),
        };
        let imported_at = Utc::now();
        let mut http = RateLimitedHttpClient::new(self.transport.clone(), self.config.limits);

        let mut output = FetchCycleOutput {
            records: Vec::new(),
            new_watermark: None,
            pages: 0,
            requests: 0,
            raw_count: 0,
            filtered_out: 0,
            skipped: 0,
        };
        let mut max_seen: Option<DateTime<Utc>> = None;

        for category in &self.config.categories {
            let filter = self.build_filter(category, mode, watermark)?;
            let mut next_url = Some(self.build_query_url(&filter)?);
            let mut page = 0usize;

            while let Some(url) = next_url.take() {
                if output.pages > 0 {
                    http.pause_between_pages().await;
                }
                page += 1;
                output.pages += 1;

                let body = http
                    .request(&url)
                    .await
                    .map_err(|source| ReplicationError::Page {
                        category: category.property_type.clone(),
                        page,
                        url: url.clone(),
                        source,
                    })?;
                let envelope: UpstreamEnvelope =
                    serde_json::from_value(body).map_err(|source| ReplicationError::Envelope {
                        category: category.property_type.clone(),
                        page,
                        source,
                    })?;

                let page_items = envelope.value.len();
                output.raw_count += page_items;
                for raw in envelope.value {
                    let item: UpstreamListing = match serde_json::from_value(raw) {
                        Ok(item) => item,
                        Err(err) => {
                            warn!(category = %category.property_type, page, error = %err, "skipping unreadable upstream item");
                            output.skipped += 1;
                            continue;
                        }
                    };
                    // Only timestamps past the watermark may advance it.
                    if let Some(modified) = item.modified_at() {
                        if since.map_or(true, |since| modified > since) {
                            max_seen = Some(max_seen.map_or(modified, |m| m.max(modified)));
                        }
                    }
                    if !self.passes_post_filters(&item) {
                        output.filtered_out += 1;
                        continue;
                    }
                    if let (Some(since), Some(modified)) = (since, item.modified_at()) {
                        if modified <= since {
                            output.filtered_out += 1;
                            continue;
                        }
                    }
                    match normalize_listing(&item, category.listing_type, imported_at) {
                        Some(record) => output.records.push(record),
                        None => {
                            warn!(category = %category.property_type, page, "skipping upstream item without an id");
                            output.skipped += 1;
                        }
                    }
                }

                debug!(
                    category = %category.property_type,
                    page,
                    items = page_items,
                    has_next = envelope.next_link.is_some(),
                    "page fetched"
                );
                next_url = envelope.next_link.filter(|link| !link.trim().is_empty());
            }
        }

        output.requests = http.request_count();
        output.new_watermark = max_seen.map(format_watermark);
        info!(
            ?mode,
            pages = output.pages,
            raw = output.raw_count,
            kept = output.records.len(),
            filtered_out = output.filtered_out,
            skipped = output.skipped,
            new_watermark = output.new_watermark.as_deref().unwrap_or(""),
            "fetch cycle complete"
        );
        Ok(output)
    }
}

/// A manually assembled batch of listings (the bulk-upload path), already mapped
/// to canonical columns.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkImportBundle {
    pub import_id: String,
    #[serde(default)]
    pub imported_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
    pub records: Vec<BulkImportRow>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkImportRow {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub unit_label: Option<String>,
    #[serde(default)]
    pub building_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub listing_type: Option<ListingType>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub list_price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub close_price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub living_area: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub bedroom_count: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub bathroom_count: Option<f64>,
    #[serde(default, deserialize_with = "lenient_date")]
    pub list_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient_date")]
    pub close_date: Option<NaiveDate>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

pub fn load_bulk_import_bundle(path: impl AsRef<Path>) -> Result<BulkImportBundle, AdapterError> {
    Ok(read_json_file(path)?)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Maps bundle rows to `BulkImport` records. A row without an id rejects the bundle.
pub fn bulk_bundle_to_records(
    bundle: &BulkImportBundle,
    now: DateTime<Utc>,
) -> Result<Vec<ListingRecord>, AdapterError> {
    let imported_at = bundle.imported_at.unwrap_or(now);
    bundle
        .records
        .iter()
        .enumerate()
        .map(|(idx, row)| {
            if row.id.trim().is_empty() {
                return Err(AdapterError::Message(format!(
                    "bundle {} row {idx} has no id",
                    bundle.import_id
                )));
            }
            let mut record = ListingRecord {
                id: normalize_id(&row.id),
                partition_key: None,
                address: title_case_if_shouting(row.address.trim()),
                unit_label: text_or_none(row.unit_label.as_deref()).unwrap_or_default(),
                status: row
                    .status
                    .as_deref()
                    .map(ListingStatus::from_upstream)
                    .unwrap_or(ListingStatus::Unknown),
                listing_type: row.listing_type.unwrap_or(ListingType::Sale),
                list_price: row.list_price.unwrap_or(0.0),
                close_price: row.close_price.filter(|p| *p > 0.0),
                living_area: row.living_area.unwrap_or(0.0),
                bedroom_count: row.bedroom_count.map(|b| b.max(0.0).round() as u32).unwrap_or(0),
                bathroom_count: row.bathroom_count.unwrap_or(0.0),
                list_date: row.list_date,
                close_date: row.close_date,
                modified_at: row.modified_at.unwrap_or(imported_at),
                origin: Origin::BulkImport,
                imported_at,
                building_name: text_or_none(row.building_name.as_deref()),
                price_per_sqft: None,
                public_remarks: None,
                directions: None,
            };
            record.refresh_price_per_sqft();
            Ok(record)
        })
        .collect()
}
