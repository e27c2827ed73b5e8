//! Windowed sync engine: slice execution, adaptive backward window
//! scheduling, and per-resource orchestration against the paged OData feed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use mls_core::{
    format_timestamp, parse_timestamp, NormalizedRecord, RecordKey, ResourceDescriptor,
    ResourceName, SliceOutcome, TableSpec, Window, API_RECORD_CAP, MEDIA, PROPERTY,
};
use mls_odata::{normalize_record, record_timestamp, FeedClient, FetchError, PageFetcher, PageQuery};
use mls_storage::{create_pool, CheckpointStore, DbConfig, PgPool, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mls-sync";

const DEFAULT_IDX_URL: &str = "https://query.ampre.ca/odata/Property";
const DEFAULT_VOW_URL: &str = "https://query.ampre.ca/odata/Property";
const DEFAULT_MEDIA_URL: &str = "https://query.ampre.ca/odata/Media";
const DEFAULT_BATCH_SIZE: usize = 5_000;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

// Published board cardinalities; what matters is which side of the
// per-filter cap and of the one-million mark each stream falls on.
const VOW_ESTIMATED_CARDINALITY: u64 = 3_000_000;
const MEDIA_ESTIMATED_CARDINALITY: u64 = 20_000_000;

/// Consecutive empty windows after which the backward walk stops.
const EMPTY_WINDOW_LIMIT: u32 = 10;
/// Safety cap on windows processed in one walk.
const MAX_WINDOWS: u32 = 500;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("slice saturated the record cap where saturation was not expected")]
    UnexpectedSaturation,
    #[error("sync cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental,
}

/// Cooperative stop signal, set from a signal handler and checked by the
/// engine between pages and slices.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Destination for normalized batches; implemented for the Postgres pool
/// and by in-memory fakes in tests.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn upsert(
        &self,
        table: &TableSpec,
        records: &[NormalizedRecord],
    ) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgRecordSink {
    pool: PgPool,
}

impl PgRecordSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordSink for PgRecordSink {
    async fn upsert(
        &self,
        table: &TableSpec,
        records: &[NormalizedRecord],
    ) -> Result<u64, StoreError> {
        mls_storage::upsert_batch(&self.pool, table, records).await
    }
}

/// Per-resource high-water marks; implemented for the `sync_log` store and
/// by in-memory fakes in tests.
#[async_trait]
pub trait Checkpoints: Send + Sync {
    async fn get(&self, resource: ResourceName) -> Result<Option<DateTime<Utc>>, StoreError>;
    async fn set(
        &self,
        resource: ResourceName,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
impl Checkpoints for CheckpointStore {
    async fn get(&self, resource: ResourceName) -> Result<Option<DateTime<Utc>>, StoreError> {
        CheckpointStore::get(self, resource).await
    }

    async fn set(
        &self,
        resource: ResourceName,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        CheckpointStore::set(self, resource, timestamp).await
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub idx_token: String,
    pub vow_token: String,
    pub idx_base_url: String,
    pub vow_base_url: String,
    pub media_base_url: String,
    pub batch_size: usize,
    pub listing_floor_date: DateTime<Utc>,
    pub media_floor_date: DateTime<Utc>,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let idx_token = std::env::var("IDX_TOKEN").context("IDX_TOKEN is not set")?;
        let vow_token = std::env::var("VOW_TOKEN").context("VOW_TOKEN is not set")?;

        let media_floor_date = match std::env::var("MEDIA_SYNC_START_DATE") {
            Ok(raw) => parse_timestamp(&raw)
                .with_context(|| format!("MEDIA_SYNC_START_DATE is not a valid timestamp: {raw}"))?,
            Err(_) => Utc
                .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .single()
                .context("building the default media floor date")?,
        };

        Ok(Self {
            idx_token,
            vow_token,
            idx_base_url: std::env::var("IDX_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_IDX_URL.to_string()),
            vow_base_url: std::env::var("VOW_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_VOW_URL.to_string()),
            media_base_url: std::env::var("MEDIA_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_MEDIA_URL.to_string()),
            batch_size: std::env::var("BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BATCH_SIZE),
            listing_floor_date: Utc
                .with_ymd_and_hms(2010, 1, 1, 0, 0, 0)
                .single()
                .context("building the listing floor date")?,
            media_floor_date,
            http_timeout_secs: std::env::var("HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
        })
    }

    pub fn descriptor(&self, name: ResourceName) -> ResourceDescriptor {
        match name {
            ResourceName::Idx => ResourceDescriptor {
                name,
                endpoint: self.idx_base_url.clone(),
                credential: self.idx_token.clone(),
                timestamp_field: "ModificationTimestamp",
                floor_date: self.listing_floor_date,
                table: &PROPERTY,
                estimated_cardinality: None,
            },
            ResourceName::Vow => ResourceDescriptor {
                name,
                endpoint: self.vow_base_url.clone(),
                credential: self.vow_token.clone(),
                timestamp_field: "ModificationTimestamp",
                floor_date: self.listing_floor_date,
                table: &PROPERTY,
                estimated_cardinality: Some(VOW_ESTIMATED_CARDINALITY),
            },
            // Media rides the full-feed (VOW) credential; the board issues
            // no separate media token.
            ResourceName::Media => ResourceDescriptor {
                name,
                endpoint: self.media_base_url.clone(),
                credential: self.vow_token.clone(),
                timestamp_field: "MediaModificationTimestamp",
                floor_date: self.media_floor_date,
                table: &MEDIA,
                estimated_cardinality: Some(MEDIA_ESTIMATED_CARDINALITY),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceRunSummary {
    pub resource: ResourceName,
    pub fetched: usize,
    pub unique: usize,
    pub upserted: u64,
    pub latest_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct DeferredWindow {
    window: Window,
    partial_fetched: usize,
}

/// One resource's sync run. Owns the dedup set and the deferred-window list
/// for the duration of the run; both die with it.
pub struct ResourceRun<'a> {
    descriptor: &'a ResourceDescriptor,
    fetcher: &'a dyn PageFetcher,
    sink: &'a dyn RecordSink,
    cancel: CancelFlag,
    batch_size: usize,
    seen: HashSet<RecordKey>,
    fetched: usize,
    upserted: u64,
    latest_ts: Option<DateTime<Utc>>,
}

impl<'a> ResourceRun<'a> {
    pub fn new(
        descriptor: &'a ResourceDescriptor,
        fetcher: &'a dyn PageFetcher,
        sink: &'a dyn RecordSink,
        batch_size: usize,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            descriptor,
            fetcher,
            sink,
            cancel,
            batch_size,
            seen: HashSet::new(),
            fetched: 0,
            upserted: 0,
            latest_ts: None,
        }
    }

    pub async fn run(
        &mut self,
        mode: SyncMode,
        checkpoint: Option<DateTime<Utc>>,
    ) -> Result<ResourceRunSummary, SyncError> {
        match (mode, checkpoint) {
            (SyncMode::Incremental, Some(checkpoint)) => self.run_incremental(checkpoint).await?,
            _ => {
                if let Some(span) = Window::new(self.descriptor.floor_date, walk_origin()) {
                    self.walk(span).await?;
                } else {
                    warn!(
                        resource = %self.descriptor.name,
                        "floor date is in the future; nothing to sync"
                    );
                }
            }
        }
        Ok(self.summary())
    }

    /// Optimistic single-predicate attempt; on saturation, fall back to a
    /// partitioned walk over the interval the attempt could not serve.
    async fn run_incremental(&mut self, checkpoint: DateTime<Utc>) -> Result<(), SyncError> {
        let filter = format!(
            "{} gt {}",
            self.descriptor.timestamp_field,
            format_timestamp(checkpoint)
        );
        let slice = self.run_slice(&filter, false).await?;
        if !slice.hit_limit {
            return Ok(());
        }

        let end = slice.oldest_ts.unwrap_or_else(walk_origin);
        info!(
            resource = %self.descriptor.name,
            checkpoint = %format_timestamp(checkpoint),
            "incremental fetch saturated the cap; walking the uncovered interval"
        );
        if let Some(span) = Window::new(checkpoint, end) {
            self.walk(span).await?;
        }
        Ok(())
    }

    /// Backward date-partitioned walk over `span`, deferring any window
    /// that saturates the cap and drilling into the deferred set afterward.
    async fn walk(&mut self, span: Window) -> Result<(), SyncError> {
        let width = self.descriptor.window_width();
        let mut deferred: Vec<DeferredWindow> = Vec::new();
        let mut consecutive_empty = 0u32;
        let mut processed = 0u32;
        let mut end = span.end;

        while end > span.start {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let start = span.start.max(end - width);
            let window = Window { start, end };
            let slice = self.run_slice(&window_filter(self.descriptor, &window), false).await?;
            info!(
                resource = %self.descriptor.name,
                window = %window,
                fetched = slice.fetched,
                unique = slice.unique,
                hit_limit = slice.hit_limit,
                "window processed"
            );

            if slice.hit_limit {
                // Deferring keeps one hot window from starving the rest of
                // the walk; the drill-down returns to it.
                deferred.push(DeferredWindow {
                    window,
                    partial_fetched: slice.fetched,
                });
            }

            if slice.fetched == 0 {
                consecutive_empty += 1;
                if consecutive_empty >= EMPTY_WINDOW_LIMIT {
                    debug!(
                        resource = %self.descriptor.name,
                        "stopping walk after {consecutive_empty} consecutive empty windows"
                    );
                    break;
                }
            } else {
                consecutive_empty = 0;
            }

            processed += 1;
            if processed >= MAX_WINDOWS {
                warn!(
                    resource = %self.descriptor.name,
                    "window safety cap reached; stopping walk"
                );
                break;
            }

            if start <= span.start {
                break;
            }
            end = start;
        }

        self.drill_down(deferred).await
    }

    /// Re-run deferred windows at daily, then hourly granularity. An hour
    /// that still saturates is accepted as partial and logged.
    async fn drill_down(&mut self, deferred: Vec<DeferredWindow>) -> Result<(), SyncError> {
        for item in deferred {
            debug!(
                resource = %self.descriptor.name,
                window = %item.window,
                partial_fetched = item.partial_fetched,
                "drilling into deferred window"
            );
            for day in item.window.split_daily() {
                if self.cancel.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
                let slice = self.run_slice(&window_filter(self.descriptor, &day), false).await?;
                if !slice.hit_limit {
                    continue;
                }
                for hour in day.split_hourly() {
                    if self.cancel.is_cancelled() {
                        return Err(SyncError::Cancelled);
                    }
                    let slice = self.run_slice(&window_filter(self.descriptor, &hour), false).await?;
                    if slice.hit_limit {
                        error!(
                            resource = %self.descriptor.name,
                            window = %hour,
                            fetched = slice.fetched,
                            "hour still saturates the record cap; accepting partial extraction"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Fetch every page of one filter, dedup by identity, and upsert page
    /// by page. Ends on a short page, the record cap, or the upstream's
    /// explicit cap signal.
    pub async fn run_slice(
        &mut self,
        filter: &str,
        fail_on_cap: bool,
    ) -> Result<SliceOutcome, SyncError> {
        let mut outcome = SliceOutcome::default();
        let mut skip = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if skip >= API_RECORD_CAP {
                outcome.hit_limit = true;
                break;
            }

            let query = PageQuery {
                filter: filter.to_string(),
                top: self.batch_size,
                skip,
                orderby: None,
            };
            let page = match self.fetcher.fetch_page(self.descriptor, &query).await {
                Ok(page) => page,
                Err(FetchError::CapExceeded) => {
                    outcome.hit_limit = true;
                    if fail_on_cap {
                        return Err(SyncError::UnexpectedSaturation);
                    }
                    break;
                }
                Err(err) => return Err(err.into()),
            };

            let received = page.value.len();
            outcome.fetched += received;
            self.fetched += received;

            let mut batch = Vec::with_capacity(received);
            for record in &page.value {
                if let Some(ts) = record_timestamp(self.descriptor, record) {
                    outcome.oldest_ts = Some(outcome.oldest_ts.map_or(ts, |cur| cur.min(ts)));
                    outcome.latest_ts = Some(outcome.latest_ts.map_or(ts, |cur| cur.max(ts)));
                }
                let Some(normalized) = normalize_record(self.descriptor.name, record) else {
                    debug!(
                        resource = %self.descriptor.name,
                        "record is missing its identity fields; skipping"
                    );
                    continue;
                };
                if !self.seen.insert(normalized.key.clone()) {
                    continue;
                }
                outcome.unique += 1;
                batch.push(normalized);
            }

            if !batch.is_empty() {
                let affected = self.sink.upsert(self.descriptor.table, &batch).await?;
                outcome.upserted += affected;
                self.upserted += affected;
            }

            if received < self.batch_size {
                break;
            }
            skip += received;
        }

        if let Some(ts) = outcome.latest_ts {
            self.latest_ts = Some(self.latest_ts.map_or(ts, |cur| cur.max(ts)));
        }
        debug!(
            resource = %self.descriptor.name,
            filter,
            fetched = outcome.fetched,
            unique = outcome.unique,
            upserted = outcome.upserted,
            hit_limit = outcome.hit_limit,
            "slice complete"
        );
        Ok(outcome)
    }

    fn summary(&self) -> ResourceRunSummary {
        ResourceRunSummary {
            resource: self.descriptor.name,
            fetched: self.fetched,
            unique: self.seen.len(),
            upserted: self.upserted,
            latest_ts: self.latest_ts,
        }
    }
}

fn window_filter(descriptor: &ResourceDescriptor, window: &Window) -> String {
    format!(
        "{field} ge {} and {field} lt {}",
        format_timestamp(window.start),
        format_timestamp(window.end),
        field = descriptor.timestamp_field
    )
}

/// The walk starts a day in the future so clock skew between the board and
/// this host cannot shave off fresh records.
fn walk_origin() -> DateTime<Utc> {
    Utc::now() + Duration::days(1)
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub resources: Vec<ResourceName>,
    pub mode: SyncMode,
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resources: Vec<ResourceRunSummary>,
    pub failures: usize,
    pub cancelled: bool,
}

/// Sequences resource runs (IDX, then VOW, then MEDIA), persists
/// checkpoints after each success, and applies the failure policy.
pub struct SyncCoordinator<'a> {
    config: &'a SyncConfig,
    fetcher: &'a dyn PageFetcher,
    sink: &'a dyn RecordSink,
    checkpoints: &'a dyn Checkpoints,
}

impl<'a> SyncCoordinator<'a> {
    pub fn new(
        config: &'a SyncConfig,
        fetcher: &'a dyn PageFetcher,
        sink: &'a dyn RecordSink,
        checkpoints: &'a dyn Checkpoints,
    ) -> Self {
        Self {
            config,
            fetcher,
            sink,
            checkpoints,
        }
    }

    pub async fn run(
        &self,
        options: &RunOptions,
        cancel: &CancelFlag,
    ) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut resources = Vec::new();
        let mut failures = 0usize;
        let mut cancelled = false;

        for name in ResourceName::ALL {
            if !options.resources.contains(&name) {
                continue;
            }
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            match self.run_resource(run_id, name, options, cancel).await {
                Ok(summary) => {
                    // The data itself is already persisted; a lost
                    // checkpoint only means the next run reprocesses an
                    // interval of idempotent upserts.
                    if let Err(err) = self.checkpoints.set(name, summary.latest_ts).await {
                        warn!(
                            resource = %name,
                            error = %err,
                            "checkpoint write failed; the next run will re-cover the interval"
                        );
                    }
                    resources.push(summary);
                }
                Err(SyncError::Cancelled) => {
                    info!(resource = %name, "run cancelled; checkpoint left untouched");
                    cancelled = true;
                    break;
                }
                Err(err) => {
                    error!(run_id = %run_id, resource = %name, error = %err, "resource run failed");
                    failures += 1;
                    if options.fail_fast {
                        return Err(err);
                    }
                }
            }
        }

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            resources,
            failures,
            cancelled,
        })
    }

    async fn run_resource(
        &self,
        run_id: Uuid,
        name: ResourceName,
        options: &RunOptions,
        cancel: &CancelFlag,
    ) -> Result<ResourceRunSummary, SyncError> {
        let descriptor = self.config.descriptor(name);
        let checkpoint = match options.mode {
            SyncMode::Incremental => self.checkpoints.get(name).await?,
            SyncMode::Full => None,
        };

        info!(
            run_id = %run_id,
            resource = %name,
            mode = ?options.mode,
            checkpoint = ?checkpoint.map(format_timestamp),
            "starting resource run"
        );

        let mut run = ResourceRun::new(
            &descriptor,
            self.fetcher,
            self.sink,
            self.config.batch_size,
            cancel.clone(),
        );
        let summary = run.run(options.mode, checkpoint).await?;

        info!(
            run_id = %run_id,
            resource = %name,
            fetched = summary.fetched,
            unique = summary.unique,
            upserted = summary.upserted,
            "resource run complete"
        );
        Ok(summary)
    }
}

/// Build every collaborator from the environment and run one sync.
pub async fn run_sync_from_env(
    options: &RunOptions,
    cancel: &CancelFlag,
) -> anyhow::Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let db_config = DbConfig::from_env()?;
    let pool = create_pool(&db_config).await?;

    let fetcher = FeedClient::new(std::time::Duration::from_secs(config.http_timeout_secs))?;
    let sink = PgRecordSink::new(pool.clone());
    let checkpoints = CheckpointStore::new(pool);

    let coordinator = SyncCoordinator::new(&config, &fetcher, &sink, &checkpoints);
    let summary = coordinator.run(options, cancel).await?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SyncConfig {
        SyncConfig {
            idx_token: "idx-token".to_string(),
            vow_token: "vow-token".to_string(),
            idx_base_url: DEFAULT_IDX_URL.to_string(),
            vow_base_url: DEFAULT_VOW_URL.to_string(),
            media_base_url: DEFAULT_MEDIA_URL.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            listing_floor_date: Utc.with_ymd_and_hms(2010, 1, 1, 0, 0, 0).single().unwrap(),
            media_floor_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap(),
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }

    #[test]
    fn idx_walks_in_month_windows() {
        let descriptor = config().descriptor(ResourceName::Idx);
        assert_eq!(descriptor.window_width(), Duration::days(30));
        assert!(!descriptor.high_volume());
    }

    #[test]
    fn known_large_streams_walk_in_week_windows() {
        let config = config();
        assert_eq!(
            config.descriptor(ResourceName::Vow).window_width(),
            Duration::days(7)
        );
        assert_eq!(
            config.descriptor(ResourceName::Media).window_width(),
            Duration::days(7)
        );
        assert!(config.descriptor(ResourceName::Vow).high_volume());
    }

    #[test]
    fn media_rides_the_vow_credential() {
        let descriptor = config().descriptor(ResourceName::Media);
        assert_eq!(descriptor.credential, "vow-token");
        assert_eq!(descriptor.timestamp_field, "MediaModificationTimestamp");
    }

    #[test]
    fn window_filters_are_half_open_predicates() {
        let descriptor = config().descriptor(ResourceName::Idx);
        let window = Window::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 8, 0, 0, 0).single().unwrap(),
        )
        .unwrap();
        assert_eq!(
            window_filter(&descriptor, &window),
            "ModificationTimestamp ge 2025-01-01T00:00:00.000Z \
             and ModificationTimestamp lt 2025-01-08T00:00:00.000Z"
        );
    }

    #[test]
    fn cancel_flag_propagates_to_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }
}
