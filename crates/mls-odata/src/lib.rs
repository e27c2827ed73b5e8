//! OData feed client + raw-record normalization for the MLS streams.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mls_core::{
    parse_timestamp, FieldValue, NormalizedRecord, RecordKey, ResourceDescriptor, ResourceName,
};
use reqwest::{header, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "mls-odata";

/// Body marker the upstream returns when a `$filter` matches more records
/// than it is willing to serve.
pub const CAP_EXCEEDED_MARKER: &str = "total exceeds 100000";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    Status { status: u16, url: String, body: String },
    #[error("invalid response payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("filter saturated the server record cap")]
    CapExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// One page of an OData response.
#[derive(Debug, Clone, Deserialize)]
pub struct ODataPage {
    #[serde(default)]
    pub value: Vec<Value>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
    #[serde(rename = "@odata.count")]
    pub total_count: Option<i64>,
}

/// Paging parameters for one `$filter` request.
#[derive(Debug, Clone)]
pub struct PageQuery {
    pub filter: String,
    pub top: usize,
    pub skip: usize,
    pub orderby: Option<String>,
}

impl PageQuery {
    /// Full request URL. The filter goes into the query string verbatim:
    /// the upstream rejects percent-encoded timestamp predicates.
    pub fn url_for(&self, endpoint: &str) -> String {
        let mut url = format!(
            "{endpoint}?$filter={}&$top={}&$skip={}",
            self.filter, self.top, self.skip
        );
        if let Some(orderby) = &self.orderby {
            url.push_str("&$orderby=");
            url.push_str(orderby);
        }
        url
    }
}

/// The seam the sync engine fetches through; implemented by [`FeedClient`]
/// and by scripted fakes in tests.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        descriptor: &ResourceDescriptor,
        query: &PageQuery,
    ) -> Result<ODataPage, FetchError>;
}

#[derive(Debug)]
pub struct FeedClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl FeedClient {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

#[async_trait]
impl PageFetcher for FeedClient {
    async fn fetch_page(
        &self,
        descriptor: &ResourceDescriptor,
        query: &PageQuery,
    ) -> Result<ODataPage, FetchError> {
        let url = query.url_for(&descriptor.endpoint);
        let mut last_transport: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let response = self
                .client
                .get(&url)
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", descriptor.credential),
                )
                .header(header::ACCEPT, "application/json")
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    // Reading the body can fail mid-stream just like the
                    // send; it gets the same retry treatment.
                    let body = match response.text().await {
                        Ok(body) => body,
                        Err(err) => {
                            if classify_reqwest_error(&err) == RetryDisposition::Retryable
                                && attempt < self.backoff.max_retries
                            {
                                warn!(
                                    resource = %descriptor.name,
                                    error = %err,
                                    attempt,
                                    "failed reading response body; backing off"
                                );
                                last_transport = Some(err);
                                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                                continue;
                            }
                            return Err(FetchError::Transport(err));
                        }
                    };

                    if body.contains(CAP_EXCEEDED_MARKER) {
                        debug!(resource = %descriptor.name, skip = query.skip, "filter saturated the record cap");
                        return Err(FetchError::CapExceeded);
                    }

                    if status.is_success() {
                        return Ok(serde_json::from_str(&body)?);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(
                            resource = %descriptor.name,
                            status = status.as_u16(),
                            attempt,
                            "transient upstream failure; backing off"
                        );
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::Status {
                        status: status.as_u16(),
                        url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(
                            resource = %descriptor.name,
                            error = %err,
                            attempt,
                            "transport failure; backing off"
                        );
                        last_transport = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Transport(err));
                }
            }
        }

        Err(FetchError::Transport(
            last_transport.expect("retry loop should capture a transport error"),
        ))
    }
}

/// Best timestamp the record carries, trying the descriptor's attribute
/// alternates in order.
pub fn record_timestamp(descriptor: &ResourceDescriptor, record: &Value) -> Option<DateTime<Utc>> {
    descriptor
        .timestamp_fields()
        .iter()
        .find_map(|field| timestamp_of(record.get(field)))
}

/// Map a raw upstream record onto its destination row. Returns `None` when
/// the record is missing any of its identity fields.
pub fn normalize_record(resource: ResourceName, record: &Value) -> Option<NormalizedRecord> {
    match resource {
        ResourceName::Idx | ResourceName::Vow => normalize_property(record),
        ResourceName::Media => normalize_media(record),
    }
}

fn normalize_property(record: &Value) -> Option<NormalizedRecord> {
    let listing_key = string_of(record.get("ListingKey"))?;
    let values = vec![
        FieldValue::Text(Some(listing_key.clone())),
        FieldValue::Timestamp(timestamp_of(record.get("ModificationTimestamp"))),
        FieldValue::Timestamp(timestamp_of(record.get("OriginalEntryTimestamp"))),
        FieldValue::Text(string_of(record.get("StandardStatus"))),
        FieldValue::Text(string_of(record.get("MlsStatus"))),
        FieldValue::Text(string_of(record.get("TransactionType"))),
        FieldValue::Text(string_of(record.get("PropertyType"))),
        FieldValue::Text(string_of(record.get("PropertySubType"))),
        FieldValue::Real(real_of(record.get("ListPrice"))),
        FieldValue::Real(real_of(record.get("ClosePrice"))),
        FieldValue::Text(string_of(record.get("UnparsedAddress"))),
        FieldValue::Text(string_of(record.get("City"))),
        FieldValue::Text(string_of(record.get("StateOrProvince"))),
        FieldValue::Text(string_of(record.get("PostalCode"))),
        FieldValue::Integer(integer_of(record.get("BedroomsTotal"))),
        FieldValue::Integer(integer_of(record.get("BathroomsTotalInteger"))),
        FieldValue::Real(real_of(record.get("BuildingAreaTotal"))),
        FieldValue::Text(string_of(record.get("ListOfficeName"))),
        FieldValue::Text(string_of(record.get("PublicRemarks"))),
        FieldValue::Boolean(boolean_of(record.get("InternetEntireListingDisplayYN"))),
        FieldValue::TextArray(text_array_of(record.get("Appliances"))),
    ];
    Some(NormalizedRecord {
        key: RecordKey::new(&[&listing_key]),
        values,
    })
}

fn normalize_media(record: &Value) -> Option<NormalizedRecord> {
    let resource_record_key = string_of(record.get("ResourceRecordKey"))?;
    let media_key = string_of(record.get("MediaKey"))?;
    let values = vec![
        FieldValue::Text(Some(resource_record_key.clone())),
        FieldValue::Text(Some(media_key.clone())),
        FieldValue::Timestamp(timestamp_of(record.get("MediaModificationTimestamp"))),
        FieldValue::Text(string_of(record.get("MediaURL"))),
        FieldValue::Text(string_of(record.get("MediaType"))),
        FieldValue::Text(string_of(record.get("MediaCategory"))),
        FieldValue::Text(string_of(record.get("MediaStatus"))),
        FieldValue::Text(string_of(record.get("ImageSizeDescription"))),
        FieldValue::Integer(integer_of(record.get("Order"))),
        FieldValue::Text(string_of(record.get("ShortDescription"))),
        FieldValue::Boolean(boolean_of(record.get("PreferredPhotoYN"))),
    ];
    Some(NormalizedRecord {
        key: RecordKey::new(&[&resource_record_key, &media_key]),
        values,
    })
}

fn string_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn integer_of(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn real_of(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn boolean_of(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim() {
            "Y" | "y" | "true" | "True" | "TRUE" | "1" => Some(true),
            "N" | "n" | "false" | "False" | "FALSE" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

// The feed declares some attributes as collections but serves scalars for
// single-valued records.
fn text_array_of(value: Option<&Value>) -> Option<Vec<String>> {
    match value? {
        Value::Array(items) => Some(items.iter().filter_map(|item| string_of(Some(item))).collect()),
        Value::String(s) if !s.is_empty() => Some(vec![s.clone()]),
        _ => None,
    }
}

fn timestamp_of(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => parse_timestamp(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mls_core::{MEDIA, PROPERTY};
    use serde_json::json;

    #[test]
    fn page_url_keeps_the_filter_raw() {
        let query = PageQuery {
            filter: "ModificationTimestamp ge 2025-01-01T00:00:00.000Z and ModificationTimestamp lt 2025-01-08T00:00:00.000Z".to_string(),
            top: 5000,
            skip: 10000,
            orderby: None,
        };
        let url = query.url_for("https://feed.test/odata/Property");
        assert!(url.contains("$filter=ModificationTimestamp ge 2025-01-01T00:00:00.000Z"));
        assert!(url.contains("&$top=5000&$skip=10000"));
        assert!(!url.contains('%'));
        assert!(!url.contains("$orderby"));
    }

    #[test]
    fn orderby_is_appended_when_present() {
        let query = PageQuery {
            filter: "ModificationTimestamp gt 2025-01-01T00:00:00.000Z".to_string(),
            top: 100,
            skip: 0,
            orderby: Some("ModificationTimestamp asc".to_string()),
        };
        let url = query.url_for("https://feed.test/odata/Property");
        assert!(url.ends_with("&$orderby=ModificationTimestamp asc"));
    }

    #[test]
    fn status_classification_matches_retry_policy() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn backoff_doubles_from_half_a_second() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(8));
    }

    #[test]
    fn page_parses_odata_annotations() {
        let page: ODataPage = serde_json::from_str(
            r#"{"@odata.count": 42, "value": [{"ListingKey": "W1"}], "@odata.nextLink": "https://feed.test/next"}"#,
        )
        .unwrap();
        assert_eq!(page.value.len(), 1);
        assert_eq!(page.total_count, Some(42));
        assert!(page.next_link.is_some());
    }

    #[test]
    fn property_row_matches_the_table_shape() {
        let record = json!({
            "ListingKey": "W5555",
            "ModificationTimestamp": "2025-03-01T10:00:00Z",
            "ListPrice": "899000",
            "BedroomsTotal": "3",
            "InternetEntireListingDisplayYN": "Y",
            "Appliances": "Dishwasher",
        });
        let normalized = normalize_record(ResourceName::Idx, &record).unwrap();
        assert_eq!(normalized.values.len(), PROPERTY.columns.len());
        assert_eq!(normalized.key.as_str(), "W5555");
        assert!(normalized
            .values
            .contains(&FieldValue::Real(Some(899000.0))));
        assert!(normalized.values.contains(&FieldValue::Integer(Some(3))));
        assert!(normalized.values.contains(&FieldValue::Boolean(Some(true))));
        assert!(normalized
            .values
            .contains(&FieldValue::TextArray(Some(vec!["Dishwasher".to_string()]))));
    }

    #[test]
    fn media_row_uses_the_composite_key() {
        let record = json!({
            "ResourceRecordKey": "W5555",
            "MediaKey": "W5555-12",
            "MediaModificationTimestamp": "2025-03-01T10:00:00Z",
            "MediaURL": "https://cdn.feed.test/W5555-12.jpg",
            "Order": 12,
        });
        let normalized = normalize_record(ResourceName::Media, &record).unwrap();
        assert_eq!(normalized.values.len(), MEDIA.columns.len());
        assert_eq!(normalized.key.as_str(), "W5555|W5555-12");
    }

    #[test]
    fn records_without_identity_are_rejected() {
        assert!(normalize_record(ResourceName::Idx, &json!({"City": "Toronto"})).is_none());
        assert!(
            normalize_record(ResourceName::Media, &json!({"ResourceRecordKey": "W1"})).is_none()
        );
    }

    #[test]
    fn coercions_tolerate_upstream_spellings() {
        assert_eq!(boolean_of(Some(&json!("N"))), Some(false));
        assert_eq!(boolean_of(Some(&json!(true))), Some(true));
        assert_eq!(boolean_of(Some(&json!("maybe"))), None);
        assert_eq!(integer_of(Some(&json!(2.0))), Some(2));
        assert_eq!(real_of(Some(&json!(" 12.5 "))), Some(12.5));
        assert_eq!(string_of(Some(&json!(""))), None);
        assert_eq!(
            text_array_of(Some(&json!(["A", "B"]))),
            Some(vec!["A".to_string(), "B".to_string()])
        );
    }

    #[test]
    fn media_timestamp_falls_back_to_the_listing_field() {
        let descriptor = ResourceDescriptor {
            name: ResourceName::Media,
            endpoint: "https://feed.test/odata/Media".to_string(),
            credential: "token".to_string(),
            timestamp_field: "MediaModificationTimestamp",
            floor_date: parse_timestamp("2024-01-01T00:00:00Z").unwrap(),
            table: &MEDIA,
            estimated_cardinality: None,
        };
        let record = json!({"ModificationTimestamp": "2025-03-01T10:00:00Z"});
        assert_eq!(
            record_timestamp(&descriptor, &record),
            parse_timestamp("2025-03-01T10:00:00Z")
        );
    }
}
