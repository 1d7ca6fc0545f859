//! Price-check pipeline: the competitor check cycle, the product runner, full
//! and scoped sweeps, the alert notifier, and the read views the trigger
//! surfaces share.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricewatch_adapters::{
    is_supported_listing_url, MarketplacePriceFetcher, OfflinePriceFetcher, PriceFetcher,
    TimedFetcher,
};
use pricewatch_core::{
    percent_change, suggest_reprice, Alert, AlertFrequency, AlertPreferences, CheckResult,
    FetchOutcome, FetchStatus, PriceHistoryRecord, Product, RepriceSuggestion, User,
    DEFAULT_THRESHOLD_PERCENT,
};
use pricewatch_storage::{
    HistoryQuery, HttpClientConfig, HttpFetcher, MemoryRecordStore, RecordStore, StoreError,
};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod notify;
mod schedule;
mod watchlist;

pub use notify::{
    mailer_for, render_digest_html, render_price_alert_html, AlertNotifier, DigestFailure,
    DigestOutcome, DigestSweepSummary, LogMailer, MailMessage, Mailer, MailerError, OutboxMailer,
    TEST_EMAIL_SUBJECT,
};
pub use schedule::{run_job, JobKind, JobReport, ScheduledJob, Scheduler};
pub use watchlist::{
    import_watchlist, load_watchlist, ImportSummary, Watchlist, WatchlistCompetitor,
    WatchlistProduct, WatchlistUser,
};

pub const CRATE_NAME: &str = "pricewatch-sync";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Most alerts returned by one inbox listing.
pub const ALERT_INBOX_LIMIT: usize = 200;

pub const DEFAULT_HISTORY_DAYS: i64 = 30;
pub const MAX_HISTORY_DAYS: i64 = 180;

/// System-wide fallbacks for users who leave a preference unset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertDefaults {
    pub threshold_percent: f64,
    pub frequency: AlertFrequency,
}

impl Default for AlertDefaults {
    fn default() -> Self {
        Self {
            threshold_percent: DEFAULT_THRESHOLD_PERCENT,
            frequency: AlertFrequency::Immediate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MailTransport {
    #[default]
    Disabled,
    Log,
    Outbox,
}

impl FromStr for MailTransport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "disabled" | "none" | "off" => Ok(Self::Disabled),
            "log" => Ok(Self::Log),
            "outbox" => Ok(Self::Outbox),
            other => Err(format!("unknown mail transport `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub store_path: PathBuf,
    pub scheduler_enabled: bool,
    pub sweep_cron: String,
    pub digest_cron: String,
    pub history_expiry_cron: String,
    pub health_check_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub offline: bool,
    pub inter_check_delay_min_ms: u64,
    pub inter_check_delay_max_ms: u64,
    pub alert_defaults: AlertDefaults,
    pub mail_transport: MailTransport,
    pub mail_outbox_dir: PathBuf,
    pub from_email: String,
    pub web_port: u16,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Missing or unparseable values fall back to
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| -> String {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let number = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let flag = |key: &str| -> bool {
            lookup(key)
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false)
        };

        let threshold_percent = lookup("ALERT_THRESHOLD_DEFAULT")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|t| t.is_finite() && *t >= 0.0)
            .unwrap_or(DEFAULT_THRESHOLD_PERCENT);
        let frequency = lookup("ALERT_FREQUENCY_DEFAULT")
            .and_then(|v| v.parse::<AlertFrequency>().ok())
            .unwrap_or_default();

        Self {
            store_path: PathBuf::from(text("PRICEWATCH_STORE_PATH", "./data/pricewatch.json")),
            scheduler_enabled: flag("PRICEWATCH_SCHEDULER_ENABLED"),
            sweep_cron: text("SWEEP_CRON", "0 0 2 * * *"),
            digest_cron: text("DIGEST_CRON", "0 0 8 * * *"),
            history_expiry_cron: text("HISTORY_EXPIRY_CRON", "0 0 * * * *"),
            health_check_cron: text("HEALTH_CHECK_CRON", "0 0 */6 * * *"),
            user_agent: text("PRICEWATCH_USER_AGENT", DEFAULT_USER_AGENT),
            http_timeout_secs: number("PRICEWATCH_HTTP_TIMEOUT_SECS", 45),
            fetch_timeout_secs: number("PRICEWATCH_FETCH_TIMEOUT_SECS", 60),
            offline: flag("PRICEWATCH_OFFLINE"),
            inter_check_delay_min_ms: number("INTER_CHECK_DELAY_MIN_MS", 1500),
            inter_check_delay_max_ms: number("INTER_CHECK_DELAY_MAX_MS", 3000),
            alert_defaults: AlertDefaults {
                threshold_percent,
                frequency,
            },
            mail_transport: lookup("MAIL_TRANSPORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            mail_outbox_dir: PathBuf::from(text("MAIL_OUTBOX_DIR", "./outbox")),
            from_email: text("FROM_EMAIL", "noreply@example.com"),
            web_port: lookup("PRICEWATCH_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn pacer(&self) -> RandomDelayPacer {
        RandomDelayPacer::new(
            Duration::from_millis(self.inter_check_delay_min_ms),
            Duration::from_millis(self.inter_check_delay_max_ms),
        )
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("user {0} not found")]
    UserNotFound(Uuid),
    #[error("product {product_id} not found for user {user_id}")]
    ProductNotFound { user_id: Uuid, product_id: Uuid },
    #[error("alert {alert_id} not found for user {user_id}")]
    AlertNotFound { user_id: Uuid, alert_id: Uuid },
    #[error("a check for product {0} is already running")]
    CheckInProgress(Uuid),
    #[error("unsupported listing url `{0}`")]
    UnsupportedUrl(String),
    #[error("invalid alert preferences: {0}")]
    InvalidPreferences(String),
    #[error(transparent)]
    Mail(#[from] MailerError),
}

/// Throttle applied between consecutive competitor checks of one product.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomDelayPacer {
    min: Duration,
    max: Duration,
}

impl RandomDelayPacer {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn bounds(&self) -> (Duration, Duration) {
        (self.min, self.max)
    }

    pub fn next_delay(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        if min >= max {
            return self.min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

impl Default for RandomDelayPacer {
    fn default() -> Self {
        Self::new(Duration::from_millis(1500), Duration::from_millis(3000))
    }
}

#[async_trait]
impl Pacer for RandomDelayPacer {
    async fn pause(&self) {
        let delay = self.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "pausing between competitor checks");
        tokio::time::sleep(delay).await;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelay;

#[async_trait]
impl Pacer for NoDelay {
    async fn pause(&self) {}
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Admits at most one runner per product across the process.
#[derive(Debug, Clone, Default)]
pub struct ProductGuard {
    running: Arc<Mutex<HashSet<Uuid>>>,
}

impl ProductGuard {
    pub fn try_acquire(&self, product_id: Uuid) -> Option<ProductLease> {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if !running.insert(product_id) {
            return None;
        }
        Some(ProductLease {
            running: Arc::clone(&self.running),
            product_id,
        })
    }

    pub fn is_running(&self, product_id: Uuid) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&product_id)
    }
}

/// Releases the product when dropped.
#[derive(Debug)]
pub struct ProductLease {
    running: Arc<Mutex<HashSet<Uuid>>>,
    product_id: Uuid,
}

impl Drop for ProductLease {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.product_id);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductFailure {
    pub product_id: Uuid,
    pub user_id: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductCheckReport {
    pub product_id: Uuid,
    pub results: Vec<CheckResult>,
    pub alerts_triggered: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserCheckSummary {
    pub products_checked: usize,
    pub products_skipped: usize,
    pub competitors_checked: usize,
    pub alerts_triggered: usize,
    pub failures: Vec<ProductFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub products_total: usize,
    pub products_checked: usize,
    pub products_skipped: usize,
    pub products_failed: Vec<ProductFailure>,
    pub competitors_checked: usize,
    pub alerts_triggered: usize,
}

impl SweepSummary {
    pub fn is_partial(&self) -> bool {
        !self.products_failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub users: usize,
    pub checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub url: String,
    pub status: FetchStatus,
    pub price: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardCompetitor {
    pub id: Uuid,
    pub name: Option<String>,
    pub url: String,
    pub current_price: Option<f64>,
    pub last_checked: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardProduct {
    pub id: Uuid,
    pub name: String,
    pub category: Option<String>,
    pub my_current_price: Option<f64>,
    pub competitors: Vec<DashboardCompetitor>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dashboard {
    pub user_id: Uuid,
    pub products: Vec<DashboardProduct>,
    pub alerts_unread: usize,
}

impl From<&Product> for DashboardProduct {
    fn from(product: &Product) -> Self {
        Self {
            id: product.id,
            name: product.name.clone(),
            category: product.category.clone(),
            my_current_price: product.my_current_price,
            competitors: product
                .competitors
                .iter()
                .map(|c| DashboardCompetitor {
                    id: c.id,
                    name: c.name.clone(),
                    url: c.url.clone(),
                    current_price: c.current_price,
                    last_checked: c.last_checked,
                    is_active: c.is_active,
                })
                .collect(),
        }
    }
}

/// History window in days: 30 when unset, clamped to 1..=180.
pub fn clamp_history_days(days: Option<i64>) -> i64 {
    days.unwrap_or(DEFAULT_HISTORY_DAYS).clamp(1, MAX_HISTORY_DAYS)
}

/// Threshold must be finite and non-negative when set.
pub fn validate_preferences(preferences: &AlertPreferences) -> Result<(), SyncError> {
    match preferences.threshold_percent {
        Some(t) if !t.is_finite() || t < 0.0 => Err(SyncError::InvalidPreferences(format!(
            "threshold_percent must be a non-negative number, got {t}"
        ))),
        _ => Ok(()),
    }
}

/// A fetch reports a usable price only on success.
fn observed_price(outcome: &FetchOutcome) -> Option<f64> {
    outcome
        .price
        .filter(|p| outcome.is_success() && p.is_finite())
}

enum LeasedRun {
    Busy,
    Missing,
    Done(Vec<CheckResult>),
}

/// Runs price checks for products and users, and answers the read-only
/// queries the trigger surfaces expose.
pub struct PriceMonitor {
    store: Arc<dyn RecordStore>,
    fetcher: Arc<dyn PriceFetcher>,
    notifier: AlertNotifier,
    pacer: Arc<dyn Pacer>,
    clock: Arc<dyn Clock>,
    guard: ProductGuard,
}

impl PriceMonitor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        fetcher: Arc<dyn PriceFetcher>,
        notifier: AlertNotifier,
    ) -> Self {
        Self {
            store,
            fetcher,
            notifier,
            pacer: Arc::new(RandomDelayPacer::default()),
            clock: Arc::new(SystemClock),
            guard: ProductGuard::default(),
        }
    }

    pub fn with_pacer(mut self, pacer: Arc<dyn Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_guard(mut self, guard: ProductGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn notifier(&self) -> &AlertNotifier {
        &self.notifier
    }

    pub fn guard(&self) -> &ProductGuard {
        &self.guard
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn threshold_for(&self, user: &User) -> f64 {
        user.alert_preferences
            .effective_threshold(self.notifier.defaults().threshold_percent)
    }

    fn count_alerts(&self, user: &User, results: &[CheckResult]) -> usize {
        let threshold = self.threshold_for(user);
        results.iter().filter(|r| r.crosses_threshold(threshold)).count()
    }

    /// Fetch one competitor, record the attempt, update the owned competitor,
    /// and raise an alert when the move crosses the user's threshold.
    ///
    /// Returns `None` only when `competitor_id` is not part of `product`.
    /// History and alert write failures are logged and do not stop the cycle.
    pub async fn check_competitor(
        &self,
        user: &User,
        product: &mut Product,
        competitor_id: Uuid,
    ) -> Option<CheckResult> {
        let competitor = product.competitor(competitor_id)?.clone();
        let outcome = self.fetcher.fetch_price(&competitor.url).await;
        let checked_at = self.clock.now();

        let old_price = competitor.current_price;
        let new_price = observed_price(&outcome);
        let result = CheckResult {
            competitor_id,
            status: outcome.status,
            old_price,
            new_price,
            percent_change: percent_change(old_price, new_price),
        };

        let record = PriceHistoryRecord::from_check(product.id, &result, checked_at);
        if let Err(err) = self
            .store
            .insert_price_history(std::slice::from_ref(&record))
            .await
        {
            warn!(
                product_id = %product.id,
                %competitor_id,
                error = %err,
                "failed to record price history"
            );
        }

        product.record_check(competitor_id, new_price, checked_at);

        if result.crosses_threshold(self.threshold_for(user)) {
            if let Err(err) = self
                .notifier
                .notify_price_change(user, product, &competitor, &result, checked_at)
                .await
            {
                warn!(
                    product_id = %product.id,
                    %competitor_id,
                    error = %err,
                    "failed to record price alert"
                );
            }
        }

        debug!(
            product_id = %product.id,
            %competitor_id,
            status = %result.status,
            old_price = ?result.old_price,
            new_price = ?result.new_price,
            percent_change = result.percent_change,
            error = ?outcome.error,
            "competitor checked"
        );
        Some(result)
    }

    /// Check every active competitor of `product` in list order, pausing
    /// between checks, then save the product once.
    pub async fn run_product_check(
        &self,
        product: &mut Product,
        user: &User,
    ) -> Result<Vec<CheckResult>, SyncError> {
        let competitor_ids = product.active_competitor_ids();
        let mut results = Vec::with_capacity(competitor_ids.len());
        for (idx, competitor_id) in competitor_ids.into_iter().enumerate() {
            if idx > 0 {
                self.pacer.pause().await;
            }
            if let Some(result) = self.check_competitor(user, product, competitor_id).await {
                results.push(result);
            }
        }

        product.touch(self.clock.now());
        self.store.save_product(product).await?;
        info!(product_id = %product.id, competitors = results.len(), "product check finished");
        Ok(results)
    }

    async fn run_leased(&self, product_id: Uuid, user: &User) -> Result<LeasedRun, SyncError> {
        let Some(_lease) = self.guard.try_acquire(product_id) else {
            return Ok(LeasedRun::Busy);
        };
        // Reload under the lease so a run never saves over a newer copy.
        let Some(mut product) = self.store.find_product_for_user(user.id, product_id).await? else {
            return Ok(LeasedRun::Missing);
        };
        let results = self.run_product_check(&mut product, user).await?;
        Ok(LeasedRun::Done(results))
    }

    async fn require_user(&self, user_id: Uuid) -> Result<User, SyncError> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or(SyncError::UserNotFound(user_id))
    }

    async fn require_product(&self, user_id: Uuid, product_id: Uuid) -> Result<Product, SyncError> {
        self.store
            .find_product_for_user(user_id, product_id)
            .await?
            .ok_or(SyncError::ProductNotFound {
                user_id,
                product_id,
            })
    }

    /// On-demand check of one product owned by `user_id`.
    pub async fn check_product(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<ProductCheckReport, SyncError> {
        let user = self.require_user(user_id).await?;
        self.require_product(user_id, product_id).await?;

        match self.run_leased(product_id, &user).await? {
            LeasedRun::Busy => Err(SyncError::CheckInProgress(product_id)),
            LeasedRun::Missing => Err(SyncError::ProductNotFound {
                user_id,
                product_id,
            }),
            LeasedRun::Done(results) => Ok(ProductCheckReport {
                product_id,
                alerts_triggered: self.count_alerts(&user, &results),
                results,
            }),
        }
    }

    /// Check all of one user's products that have competitors. Per-product
    /// failures are reported in the summary.
    pub async fn check_user_products(&self, user_id: Uuid) -> Result<UserCheckSummary, SyncError> {
        let user = self.require_user(user_id).await?;
        let products = self.store.products_with_competitors(Some(user_id)).await?;
        let mut summary = UserCheckSummary::default();

        for product in products {
            match self.run_leased(product.id, &user).await {
                Ok(LeasedRun::Done(results)) => {
                    summary.products_checked += 1;
                    summary.competitors_checked += results.len();
                    summary.alerts_triggered += self.count_alerts(&user, &results);
                }
                Ok(LeasedRun::Busy) | Ok(LeasedRun::Missing) => summary.products_skipped += 1,
                Err(err) => {
                    error!(
                        %user_id,
                        product_id = %product.id,
                        error = %err,
                        "product check failed"
                    );
                    summary.failures.push(ProductFailure {
                        product_id: product.id,
                        user_id,
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            %user_id,
            products = summary.products_checked,
            competitors = summary.competitors_checked,
            alerts = summary.alerts_triggered,
            "user check finished"
        );
        Ok(summary)
    }

    /// One pass over every product with competitors. Only failing to
    /// enumerate products is an error; everything per product is contained.
    pub async fn run_full_sweep(&self) -> Result<SweepSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = self.clock.now();
        let products = self.store.products_with_competitors(None).await?;
        info!(%run_id, products = products.len(), "starting full sweep");

        let mut summary = SweepSummary {
            run_id,
            started_at,
            finished_at: started_at,
            products_total: products.len(),
            products_checked: 0,
            products_skipped: 0,
            products_failed: Vec::new(),
            competitors_checked: 0,
            alerts_triggered: 0,
        };

        for product in products {
            let outcome = match self.store.get_user(product.user_id).await {
                Ok(Some(user)) => self
                    .run_leased(product.id, &user)
                    .await
                    .map(|run| (user, run)),
                Ok(None) => {
                    warn!(
                        %run_id,
                        product_id = %product.id,
                        user_id = %product.user_id,
                        "owner missing; skipping product"
                    );
                    summary.products_skipped += 1;
                    continue;
                }
                Err(err) => Err(err.into()),
            };

            match outcome {
                Ok((user, LeasedRun::Done(results))) => {
                    summary.products_checked += 1;
                    summary.competitors_checked += results.len();
                    summary.alerts_triggered += self.count_alerts(&user, &results);
                }
                Ok((_, LeasedRun::Busy)) => {
                    info!(
                        %run_id,
                        product_id = %product.id,
                        "product already being checked; skipping"
                    );
                    summary.products_skipped += 1;
                }
                Ok((_, LeasedRun::Missing)) => summary.products_skipped += 1,
                Err(err) => {
                    error!(%run_id, product_id = %product.id, error = %err, "product check failed");
                    summary.products_failed.push(ProductFailure {
                        product_id: product.id,
                        user_id: product.user_id,
                        error: err.to_string(),
                    });
                }
            }
        }

        summary.finished_at = self.clock.now();
        info!(
            %run_id,
            checked = summary.products_checked,
            skipped = summary.products_skipped,
            failed = summary.products_failed.len(),
            competitors = summary.competitors_checked,
            alerts = summary.alerts_triggered,
            "full sweep finished"
        );
        Ok(summary)
    }

    pub async fn run_daily_digest(&self) -> Result<DigestSweepSummary, SyncError> {
        Ok(self.notifier.run_daily_digest(self.clock.now()).await?)
    }

    pub async fn purge_expired_history(&self) -> Result<usize, SyncError> {
        let removed = self.store.purge_expired_history(self.clock.now()).await?;
        info!(removed, "expired price history purged");
        Ok(removed)
    }

    pub async fn health_check(&self) -> HealthReport {
        let checked_at = self.clock.now();
        match self.store.list_users().await {
            Ok(users) => {
                info!(users = users.len(), "health check passed");
                HealthReport {
                    healthy: true,
                    users: users.len(),
                    checked_at,
                    error: None,
                }
            }
            Err(err) => {
                error!(error = %err, "health check failed");
                HealthReport {
                    healthy: false,
                    users: 0,
                    checked_at,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    pub async fn suggest(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<RepriceSuggestion, SyncError> {
        let product = self.require_product(user_id, product_id).await?;
        Ok(suggest_reprice(&product, &product.competitors))
    }

    pub async fn price_history(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        days: Option<i64>,
        competitor_id: Option<Uuid>,
    ) -> Result<Vec<PriceHistoryRecord>, SyncError> {
        let product = self.require_product(user_id, product_id).await?;
        let since = self.clock.now() - chrono::Duration::days(clamp_history_days(days));
        let query = HistoryQuery::for_product(product.id, since).competitor(competitor_id);
        Ok(self.store.price_history(&query).await?)
    }

    pub async fn dashboard(&self, user_id: Uuid) -> Result<Dashboard, SyncError> {
        self.require_user(user_id).await?;
        let products = self.store.list_products_for_user(user_id).await?;
        let alerts_unread = self.store.count_unread_alerts(user_id).await?;
        Ok(Dashboard {
            user_id,
            products: products.iter().map(DashboardProduct::from).collect(),
            alerts_unread,
        })
    }

    pub async fn alerts(&self, user_id: Uuid) -> Result<Vec<Alert>, SyncError> {
        self.require_user(user_id).await?;
        Ok(self.store.alerts_for_user(user_id, ALERT_INBOX_LIMIT).await?)
    }

    pub async fn mark_alert_read(&self, user_id: Uuid, alert_id: Uuid) -> Result<Alert, SyncError> {
        self.store
            .mark_alert_read(user_id, alert_id)
            .await?
            .ok_or(SyncError::AlertNotFound { user_id, alert_id })
    }

    pub async fn preferences(&self, user_id: Uuid) -> Result<AlertPreferences, SyncError> {
        Ok(self.require_user(user_id).await?.alert_preferences)
    }

    pub async fn update_preferences(
        &self,
        user_id: Uuid,
        preferences: AlertPreferences,
    ) -> Result<AlertPreferences, SyncError> {
        validate_preferences(&preferences)?;
        let mut user = self.require_user(user_id).await?;
        user.alert_preferences = preferences;
        self.store.save_user(&user).await?;
        info!(%user_id, "alert preferences updated");
        Ok(user.alert_preferences)
    }

    pub async fn send_test_email(&self, user_id: Uuid) -> Result<(), SyncError> {
        let user = self.require_user(user_id).await?;
        self.notifier.send_test_email(&user.email).await?;
        Ok(())
    }

    /// Fetch one listing without recording anything.
    pub async fn probe(&self, url: &str) -> Result<ProbeReport, SyncError> {
        let url = url.trim();
        if !is_supported_listing_url(url) {
            return Err(SyncError::UnsupportedUrl(url.to_string()));
        }
        let outcome = self.fetcher.fetch_price(url).await;
        Ok(ProbeReport {
            url: url.to_string(),
            status: outcome.status,
            price: observed_price(&outcome),
            error: outcome.error,
        })
    }
}

/// Live or offline fetcher per config, always bounded by the fetch timeout.
pub fn price_fetcher_for(config: &MonitorConfig) -> anyhow::Result<Arc<dyn PriceFetcher>> {
    let inner: Arc<dyn PriceFetcher> = if config.offline {
        Arc::new(OfflinePriceFetcher)
    } else {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Arc::new(MarketplacePriceFetcher::new(Arc::new(http)))
    };
    Ok(Arc::new(TimedFetcher::new(inner, config.fetch_timeout())))
}

/// Wire the snapshot store, fetcher, mail transport and pacer from config.
pub async fn monitor_from_config(config: &MonitorConfig) -> anyhow::Result<PriceMonitor> {
    let store = MemoryRecordStore::open(&config.store_path)
        .await
        .with_context(|| format!("opening record store at {}", config.store_path.display()))?;
    let store: Arc<dyn RecordStore> = Arc::new(store);
    let fetcher = price_fetcher_for(config)?;
    let notifier = AlertNotifier::new(
        Arc::clone(&store),
        mailer_for(config.mail_transport, &config.mail_outbox_dir),
        config.from_email.clone(),
    )
    .with_defaults(config.alert_defaults);
    info!(
        store = %config.store_path.display(),
        offline = config.offline,
        mail = ?config.mail_transport,
        "price monitor configured"
    );
    Ok(PriceMonitor::new(store, fetcher, notifier).with_pacer(Arc::new(config.pacer())))
}
