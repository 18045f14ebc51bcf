use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::{PriceApiConfig, PriceApiMode};
use crate::domain::price::{floor_to_slot, UsageRow, SLOT_MINUTES};
use crate::domain::{Channel, PricePoint, PriceQuality};
use crate::schedule::{Schedule, ScheduleBook};
use crate::store;

/// Holds the merged half-hourly price forecast per channel.
///
/// The refresher task is the only writer; the control loop reads immutable
/// snapshots. The cache survives restarts through an on-disk JSON file
/// written atomically after each successful refresh.
pub struct PriceCache {
    cfg: PriceApiConfig,
    client: Option<reqwest::Client>,
    cache_path: PathBuf,
    inner: RwLock<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    points: BTreeMap<(Channel, DateTime<Utc>), PricePoint>,
    usage: VecDeque<UsageRow>,
    last_success: Option<DateTime<Utc>>,
    consecutive_errors: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    points: Vec<PricePoint>,
    #[serde(default)]
    usage: Vec<UsageRow>,
    written_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInterval {
    start: DateTime<Utc>,
    /// Minutes.
    duration: i64,
    channel_type: Channel,
    per_kwh: f64,
    quality: RawQuality,
    #[serde(default)]
    kwh: Option<f64>,
    #[serde(default)]
    cost: Option<f64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawQuality {
    Actual,
    Current,
    Forecast,
}

impl From<RawQuality> for PriceQuality {
    fn from(q: RawQuality) -> Self {
        match q {
            RawQuality::Actual => PriceQuality::Actual,
            RawQuality::Current => PriceQuality::Current,
            RawQuality::Forecast => PriceQuality::Forecast,
        }
    }
}

impl PriceCache {
    pub fn new(cfg: PriceApiConfig, cache_path: PathBuf) -> Result<Self> {
        let client = match cfg.mode {
            PriceApiMode::Live => {
                if cfg.base_url.is_none() {
                    bail!("price_api.base_url is required in Live mode");
                }
                let api_key = cfg
                    .api_key
                    .as_deref()
                    .context("price API key missing: set price_api.api_key or AMBER_API_KEY")?;
                let mut headers = HeaderMap::new();
                headers.insert(USER_AGENT, HeaderValue::from_static("powerctl/0.3"));
                let mut auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
                    .context("API key contains invalid header characters")?;
                auth.set_sensitive(true);
                headers.insert(AUTHORIZATION, auth);
                Some(
                    reqwest::Client::builder()
                        .timeout(StdDuration::from_secs(cfg.timeout_secs))
                        .default_headers(headers)
                        .build()?,
                )
            }
            PriceApiMode::Offline | PriceApiMode::Disabled => None,
        };
        Ok(Self {
            cfg,
            client,
            cache_path,
            inner: RwLock::new(CacheInner::default()),
        })
    }

    pub fn refresh_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.cfg.refresh_interval_mins * 60)
    }

    pub fn mode(&self) -> PriceApiMode {
        self.cfg.mode
    }

    /// Read the on-disk cache so a restart can plan before the first live
    /// refresh completes.
    pub async fn load_cache_file(&self) -> Result<()> {
        let bytes = match std::fs::read(&self.cache_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context("reading price cache file"),
        };
        let file: CacheFile = serde_json::from_slice(&bytes).context("parsing price cache file")?;
        let mut inner = self.inner.write().await;
        for point in file.points {
            merge_point(&mut inner.points, point);
        }
        inner.usage = file.usage.into();
        debug!(points = inner.points.len(), "loaded price cache file");
        Ok(())
    }

    /// Fetch the current forecast window from the price API and merge it in.
    /// Idempotent; safe to trigger on demand.
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<()> {
        let Some(client) = &self.client else {
            // Offline mode serves whatever the cache file held.
            return Ok(());
        };
        let base = self.cfg.base_url.as_deref().unwrap_or_default();
        let url = format!(
            "{}/prices/current?next={}&previous=16&resolution={}",
            base.trim_end_matches('/'),
            self.cfg.forecast_intervals,
            SLOT_MINUTES,
        );

        let result = async {
            let resp = client.get(&url).send().await.context("price GET failed")?;
            let status = resp.status();
            let body = resp.text().await.context("price read failed")?;
            if !status.is_success() {
                bail!("price API error: HTTP {status}");
            }
            let raw: Vec<RawInterval> =
                serde_json::from_str(&body).context("price JSON parse failed")?;
            Ok::<Vec<RawInterval>, anyhow::Error>(raw)
        }
        .await;

        match result {
            Ok(raw) => {
                let mut inner = self.inner.write().await;
                for interval in raw {
                    if let (Some(kwh), Some(cost)) = (interval.kwh, interval.cost) {
                        inner.usage.push_back(UsageRow {
                            start: interval.start,
                            channel: interval.channel_type,
                            energy_kwh: kwh,
                            cost_cents: cost,
                        });
                    }
                    merge_point(
                        &mut inner.points,
                        PricePoint {
                            start: floor_to_slot(interval.start),
                            duration_mins: interval.duration,
                            channel: interval.channel_type,
                            price: interval.per_kwh,
                            quality: interval.quality.into(),
                        },
                    );
                }
                let usage_floor = now - Duration::days(i64::from(self.cfg.usage_max_days));
                inner.usage.retain(|row| row.start >= usage_floor);
                // Drop slots older than the accounting lookback plus a margin.
                let floor = now - Duration::days(2);
                inner.points.retain(|(_, start), _| *start >= floor);
                inner.last_success = Some(now);
                inner.consecutive_errors = 0;

                let file = CacheFile {
                    points: inner.points.values().cloned().collect(),
                    usage: inner.usage.iter().cloned().collect(),
                    written_at: now,
                };
                drop(inner);
                let bytes = serde_json::to_vec_pretty(&file)?;
                store::write_atomic(&self.cache_path, &bytes)
                    .context("writing price cache file")?;
                debug!("price refresh complete");
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.write().await;
                inner.consecutive_errors = inner.consecutive_errors.saturating_add(1);
                warn!(
                    errors = inner.consecutive_errors,
                    "price refresh failed: {e:#}"
                );
                Err(e)
            }
        }
    }

    /// The price source is declared down after MaxConcurrentErrors
    /// consecutive refresh failures, or when it is disabled outright.
    pub async fn is_down(&self) -> bool {
        match self.cfg.mode {
            PriceApiMode::Disabled => true,
            _ => {
                let inner = self.inner.read().await;
                inner.consecutive_errors >= self.cfg.max_concurrent_errors
                    || (inner.points.is_empty() && inner.last_success.is_none())
            }
        }
    }

    pub async fn consecutive_errors(&self) -> u32 {
        self.inner.read().await.consecutive_errors
    }

    pub async fn price_at(&self, channel: Channel, instant: DateTime<Utc>) -> Option<PricePoint> {
        let slot = floor_to_slot(instant);
        let inner = self.inner.read().await;
        let point = inner.points.get(&(channel, slot)).cloned()?;
        Some(self.degrade(&inner, point, instant))
    }

    /// Ordered points for `channel` covering `[from, to)`. Slots with no
    /// data are absent; callers fall back per the fallback policy.
    pub async fn forecast(
        &self,
        channel: Channel,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<PricePoint> {
        let now = Utc::now();
        let inner = self.inner.read().await;
        inner
            .points
            .range((channel, floor_to_slot(from))..(channel, to))
            .map(|(_, p)| self.degrade(&inner, p.clone(), now))
            .collect()
    }

    pub async fn usage_rows(&self) -> Vec<UsageRow> {
        self.inner.read().await.usage.iter().cloned().collect()
    }

    /// Downgrade served quality to cached-stale once the data has outlived
    /// its TTL. Actuals are history and never degrade.
    fn degrade(&self, inner: &CacheInner, mut point: PricePoint, now: DateTime<Utc>) -> PricePoint {
        let ttl = Duration::minutes(self.cfg.stale_after_mins as i64);
        let stale = match inner.last_success {
            Some(at) => now - at > ttl,
            None => true,
        };
        if stale && point.quality > PriceQuality::CachedStale && point.quality < PriceQuality::Actual
        {
            point.quality = PriceQuality::CachedStale;
        }
        point
    }
}

/// Merge policy: a point may only replace one of equal or lower quality, so
/// an actual is never overwritten by a forecast and per-slot quality is
/// monotone across refreshes. Ties go to the newer write.
fn merge_point(points: &mut BTreeMap<(Channel, DateTime<Utc>), PricePoint>, point: PricePoint) {
    let key = (point.channel, point.start);
    match points.get(&key) {
        Some(existing) if existing.quality > point.quality => {}
        _ => {
            points.insert(key, point);
        }
    }
}

/// Synthesise a fallback forecast from a schedule when the price source is
/// down or the output runs in Schedule mode: the window price inside a
/// window, DefaultPrice elsewhere. Downstream planning is unchanged.
pub fn fallback_forecast(
    book: &ScheduleBook,
    schedule: Option<&Schedule>,
    channel: Channel,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Vec<PricePoint> {
    let mut points = Vec::new();
    let mut slot = floor_to_slot(from);
    while slot < to {
        let (price, quality) = match schedule {
            Some(s) => match book.in_window(s, slot) {
                (true, Some(price)) => (price, PriceQuality::FallbackSchedule),
                _ => (book.default_price(), PriceQuality::Default),
            },
            None => (book.default_price(), PriceQuality::Default),
        };
        points.push(PricePoint {
            start: slot,
            duration_mins: SLOT_MINUTES,
            channel,
            price,
            quality,
        });
        slot += Duration::minutes(SLOT_MINUTES);
    }
    points
}
