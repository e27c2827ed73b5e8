//! Core domain model for MLS feed synchronization.

use std::fmt;

use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mls-core";

/// Hard server-side ceiling on records a single `$filter` query will serve.
pub const API_RECORD_CAP: usize = 100_000;

/// The three resource streams the feed exposes, in coordinator order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceName {
    Idx,
    Vow,
    Media,
}

impl ResourceName {
    pub const ALL: [ResourceName; 3] = [ResourceName::Idx, ResourceName::Vow, ResourceName::Media];

    /// Lowercase identifier, also the `sync_log.resourcetype` value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceName::Idx => "idx",
            ResourceName::Vow => "vow",
            ResourceName::Media => "media",
        }
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination table shape: column order is the contract between the
/// normalizer and the upserter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    pub conflict_columns: &'static [&'static str],
}

impl TableSpec {
    /// Columns rewritten on conflict, i.e. everything outside the key.
    pub fn update_columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns
            .iter()
            .copied()
            .filter(|column| !self.conflict_columns.contains(column))
    }
}

pub static PROPERTY: TableSpec = TableSpec {
    name: "property",
    columns: &[
        "listingkey",
        "modificationtimestamp",
        "originalentrytimestamp",
        "standardstatus",
        "mlsstatus",
        "transactiontype",
        "propertytype",
        "propertysubtype",
        "listprice",
        "closeprice",
        "unparsedaddress",
        "city",
        "stateorprovince",
        "postalcode",
        "bedroomstotal",
        "bathroomstotalinteger",
        "buildingareatotal",
        "listofficename",
        "publicremarks",
        "internetentirelistingdisplayyn",
        "appliances",
    ],
    conflict_columns: &["listingkey"],
};

pub static MEDIA: TableSpec = TableSpec {
    name: "media",
    columns: &[
        "resourcerecordkey",
        "mediakey",
        "mediamodificationtimestamp",
        "mediaurl",
        "mediatype",
        "mediacategory",
        "mediastatus",
        "imagesizedescription",
        "displayorder",
        "shortdescription",
        "preferredphotoyn",
    ],
    conflict_columns: &["resourcerecordkey", "mediakey"],
};

/// Static description of one resource stream.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    pub name: ResourceName,
    pub endpoint: String,
    pub credential: String,
    /// Attribute used in window predicates and checkpointing.
    pub timestamp_field: &'static str,
    /// Records older than this are out of scope for any run.
    pub floor_date: DateTime<Utc>,
    pub table: &'static TableSpec,
    /// Known stream size, where the board publishes one.
    pub estimated_cardinality: Option<u64>,
}

impl ResourceDescriptor {
    /// Ordered timestamp attributes to try when stamping a record; the feed
    /// is not consistent about which one a given record carries.
    pub fn timestamp_fields(&self) -> &'static [&'static str] {
        match self.name {
            ResourceName::Media => &["MediaModificationTimestamp", "ModificationTimestamp"],
            _ => &["ModificationTimestamp", "OriginalEntryTimestamp"],
        }
    }

    /// True when the whole stream is known to exceed the per-filter cap, so
    /// an unpartitioned fetch can never finish.
    pub fn high_volume(&self) -> bool {
        self.estimated_cardinality
            .map(|cardinality| cardinality as usize > API_RECORD_CAP)
            .unwrap_or(false)
    }

    /// Walk step for this stream: a week for media and for any stream above
    /// a million records, a month otherwise.
    pub fn window_width(&self) -> Duration {
        let very_large = matches!(self.estimated_cardinality, Some(c) if c > 1_000_000);
        if self.name == ResourceName::Media || very_large {
            Duration::days(7)
        } else {
            Duration::days(30)
        }
    }
}

/// Half-open interval `[start, end)` over a resource's timestamp field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Daily sub-windows, the first drill-down level for a saturated window.
    pub fn split_daily(&self) -> Vec<Window> {
        self.split_by(Duration::days(1))
    }

    /// Hourly sub-windows, the final drill-down level.
    pub fn split_hourly(&self) -> Vec<Window> {
        self.split_by(Duration::hours(1))
    }

    fn split_by(&self, step: Duration) -> Vec<Window> {
        let mut windows = Vec::new();
        let mut start = self.start;
        while start < self.end {
            let end = (start + step).min(self.end);
            windows.push(Window { start, end });
            start = end;
        }
        windows
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            format_timestamp(self.start),
            format_timestamp(self.end)
        )
    }
}

/// Typed column value; every variant wraps an `Option` so NULLs keep their
/// column type when bound.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(Option<String>),
    Integer(Option<i64>),
    Real(Option<f64>),
    Boolean(Option<bool>),
    Timestamp(Option<DateTime<Utc>>),
    TextArray(Option<Vec<String>>),
}

/// Joined conflict-key tuple; the element of the per-run dedup set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn new(parts: &[&str]) -> Self {
        Self(parts.join("|"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One upstream record mapped to a table row; `values` is parallel to the
/// table's column list.
#[derive(Debug, Clone)]
pub struct NormalizedRecord {
    pub key: RecordKey,
    pub values: Vec<FieldValue>,
}

/// What one slice (all pages of one filter) produced.
#[derive(Debug, Clone, Default)]
pub struct SliceOutcome {
    pub fetched: usize,
    pub unique: usize,
    pub upserted: u64,
    pub oldest_ts: Option<DateTime<Utc>>,
    pub latest_ts: Option<DateTime<Utc>>,
    pub hit_limit: bool,
}

/// Render a timestamp the way the feed expects it inside `$filter`
/// predicates: RFC 3339 with milliseconds, `Z` suffix, never quoted.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse the assorted timestamp spellings the feed emits: full RFC 3339,
/// fractional seconds of any width, or a bare date-time with no offset.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(raw: &str) -> DateTime<Utc> {
        parse_timestamp(raw).expect("test timestamp")
    }

    #[test]
    fn window_is_half_open() {
        let window = Window::new(ts("2025-01-01T00:00:00Z"), ts("2025-01-08T00:00:00Z")).unwrap();
        assert!(window.contains(ts("2025-01-01T00:00:00Z")));
        assert!(window.contains(ts("2025-01-07T23:59:59Z")));
        assert!(!window.contains(ts("2025-01-08T00:00:00Z")));
    }

    #[test]
    fn degenerate_window_is_rejected() {
        let at = ts("2025-01-01T00:00:00Z");
        assert!(Window::new(at, at).is_none());
        assert!(Window::new(at, at - Duration::hours(1)).is_none());
    }

    #[test]
    fn daily_split_clamps_the_tail() {
        let window = Window::new(ts("2025-01-01T00:00:00Z"), ts("2025-01-03T12:00:00Z")).unwrap();
        let days = window.split_daily();
        assert_eq!(days.len(), 3);
        assert_eq!(days[0].start, window.start);
        assert_eq!(days[1].start, days[0].end);
        assert_eq!(days[2].end, window.end);
    }

    #[test]
    fn hourly_split_of_a_day_yields_24() {
        let window = Window::new(ts("2025-01-01T00:00:00Z"), ts("2025-01-02T00:00:00Z")).unwrap();
        assert_eq!(window.split_hourly().len(), 24);
    }

    #[test]
    fn parse_tolerates_feed_formats() {
        assert_eq!(
            parse_timestamp("2025-01-01T00:05:00Z"),
            parse_timestamp("2025-01-01T00:05:00")
        );
        assert!(parse_timestamp("2025-01-01T00:05:00.1234567Z").is_some());
        assert!(parse_timestamp("not a timestamp").is_none());
    }

    #[test]
    fn filter_timestamps_carry_millis() {
        let rendered = format_timestamp(ts("2025-01-01T00:05:00Z"));
        assert_eq!(rendered, "2025-01-01T00:05:00.000Z");
    }

    #[test]
    fn update_columns_exclude_the_key() {
        let updates: Vec<_> = MEDIA.update_columns().collect();
        assert!(!updates.contains(&"resourcerecordkey"));
        assert!(!updates.contains(&"mediakey"));
        assert!(updates.contains(&"mediaurl"));
        assert_eq!(updates.len(), MEDIA.columns.len() - 2);
    }

    #[test]
    fn composite_keys_join_their_parts() {
        let key = RecordKey::new(&["W123", "M9"]);
        assert_eq!(key.as_str(), "W123|M9");
        assert_ne!(key, RecordKey::new(&["W123", "M10"]));
    }
}
