//! Core domain model for competitor price monitoring.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod pricing;

pub use pricing::{percent_change, suggest_reprice, RepriceStrategy, RepriceSuggestion};

pub const CRATE_NAME: &str = "pricewatch-core";

/// Threshold used when neither the user nor the deployment configures one.
pub const DEFAULT_THRESHOLD_PERCENT: f64 = 5.0;

/// Price history rows older than this are eligible for expiry.
pub const HISTORY_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertFrequency {
    #[default]
    Immediate,
    Daily,
}

impl AlertFrequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Daily => "daily",
        }
    }
}

impl fmt::Display for AlertFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFrequency(pub String);

impl fmt::Display for UnknownFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown alert frequency `{}` (expected immediate or daily)", self.0)
    }
}

impl std::error::Error for UnknownFrequency {}

impl FromStr for AlertFrequency {
    type Err = UnknownFrequency;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(Self::Immediate),
            "daily" => Ok(Self::Daily),
            other => Err(UnknownFrequency(other.to_string())),
        }
    }
}

/// Outcome classification of one price fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Success,
    Failed,
    /// The upstream page signalled bot detection.
    Blocked,
}

impl FetchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    PriceDrop,
    PriceIncrease,
}

impl AlertKind {
    /// An unchanged price counts as a drop; only a strict rise is an increase.
    pub fn from_prices(old_price: f64, new_price: f64) -> Self {
        if new_price > old_price {
            Self::PriceIncrease
        } else {
            Self::PriceDrop
        }
    }

    pub fn direction_word(self) -> &'static str {
        match self {
            Self::PriceDrop => "decreased",
            Self::PriceIncrease => "increased",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPreferences {
    pub email_enabled: bool,
    #[serde(default)]
    pub threshold_percent: Option<f64>,
    #[serde(default)]
    pub frequency: Option<AlertFrequency>,
}

impl Default for AlertPreferences {
    fn default() -> Self {
        Self {
            email_enabled: true,
            threshold_percent: Some(DEFAULT_THRESHOLD_PERCENT),
            frequency: Some(AlertFrequency::Immediate),
        }
    }
}

impl AlertPreferences {
    pub fn effective_threshold(&self, fallback: f64) -> f64 {
        self.threshold_percent.unwrap_or(fallback)
    }

    pub fn effective_frequency(&self, fallback: AlertFrequency) -> AlertFrequency {
        self.frequency.unwrap_or(fallback)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub alert_preferences: AlertPreferences,
    pub created_at: DateTime<Utc>,
    /// Digest cursor; only the digest job moves it, and only forward.
    #[serde(default)]
    pub last_digest_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            alert_preferences: AlertPreferences::default(),
            created_at: Utc::now(),
            last_digest_at: None,
        }
    }

    pub fn with_preferences(mut self, preferences: AlertPreferences) -> Self {
        self.alert_preferences = preferences;
        self
    }

    /// Advance the digest cursor. Earlier instants are ignored.
    pub fn advance_digest_cursor(&mut self, at: DateTime<Utc>) {
        match self.last_digest_at {
            Some(current) if current >= at => {}
            _ => self.last_digest_at = Some(at),
        }
    }

    /// Lower bound of the next digest window.
    pub fn digest_window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.last_digest_at.unwrap_or_else(|| now - Duration::hours(24))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competitor {
    pub id: Uuid,
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub current_price: Option<f64>,
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl Competitor {
    pub fn new(url: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            name,
            current_price: None,
            last_checked: None,
            is_active: true,
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.current_price = Some(price);
        self
    }

    pub fn display_label(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.url)
    }
}

/// A tracked listing. Competitors are owned here and only persisted through
/// the product's own save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub my_listing_url: Option<String>,
    #[serde(default)]
    pub my_current_price: Option<f64>,
    #[serde(default)]
    pub profit_margin: Option<f64>,
    #[serde(default)]
    pub competitors: Vec<Competitor>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn new(user_id: Uuid, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            category: None,
            my_listing_url: None,
            my_current_price: None,
            profit_margin: None,
            competitors: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_competitors(&self) -> bool {
        !self.competitors.is_empty()
    }

    pub fn add_competitor(&mut self, competitor: Competitor) -> Uuid {
        let id = competitor.id;
        self.competitors.push(competitor);
        id
    }

    pub fn remove_competitor(&mut self, competitor_id: Uuid) -> Option<Competitor> {
        let idx = self.competitors.iter().position(|c| c.id == competitor_id)?;
        Some(self.competitors.remove(idx))
    }

    pub fn competitor(&self, competitor_id: Uuid) -> Option<&Competitor> {
        self.competitors.iter().find(|c| c.id == competitor_id)
    }

    pub fn competitor_mut(&mut self, competitor_id: Uuid) -> Option<&mut Competitor> {
        self.competitors.iter_mut().find(|c| c.id == competitor_id)
    }

    /// Ids of active competitors, in list order.
    pub fn active_competitor_ids(&self) -> Vec<Uuid> {
        self.competitors
            .iter()
            .filter(|c| c.is_active)
            .map(|c| c.id)
            .collect()
    }

    /// Apply one check outcome to the owned competitor. `last_checked`
    /// advances even when the price became unknown.
    pub fn record_check(
        &mut self,
        competitor_id: Uuid,
        new_price: Option<f64>,
        checked_at: DateTime<Utc>,
    ) -> bool {
        match self.competitor_mut(competitor_id) {
            Some(competitor) => {
                competitor.current_price = new_price;
                competitor.last_checked = Some(checked_at);
                true
            }
            None => false,
        }
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
}

/// One row per check attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryRecord {
    pub id: Uuid,
    pub product_id: Uuid,
    pub competitor_id: Uuid,
    /// Observed price, `0.0` when the fetch produced none.
    pub price: f64,
    pub price_change: f64,
    pub percent_change: f64,
    pub checked_at: DateTime<Utc>,
    pub status: FetchStatus,
}

impl PriceHistoryRecord {
    pub fn from_check(product_id: Uuid, result: &CheckResult, checked_at: DateTime<Utc>) -> Self {
        let price_change = match (result.old_price, result.new_price) {
            (Some(old), Some(new)) => new - old,
            _ => 0.0,
        };
        Self {
            id: Uuid::new_v4(),
            product_id,
            competitor_id: result.competitor_id,
            price: result.new_price.unwrap_or(0.0),
            price_change,
            percent_change: result.percent_change,
            checked_at,
            status: result.status,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.checked_at <= history_cutoff(now)
    }
}

/// Instant at or before which history rows are past retention.
pub fn history_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::days(HISTORY_RETENTION_DAYS)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub competitor_id: Uuid,
    pub kind: AlertKind,
    pub old_price: f64,
    pub new_price: f64,
    pub percent_change: f64,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

impl Alert {
    pub fn new(
        user_id: Uuid,
        product_id: Uuid,
        competitor_id: Uuid,
        old_price: f64,
        new_price: f64,
        percent_change: f64,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            product_id,
            competitor_id,
            kind: AlertKind::from_prices(old_price, new_price),
            old_price,
            new_price,
            percent_change,
            sent_at,
            is_read: false,
        }
    }
}

/// Result of asking a price fetcher about one URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub price: Option<f64>,
    pub status: FetchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FetchOutcome {
    pub fn success(price: f64) -> Self {
        Self {
            price: Some(price),
            status: FetchStatus::Success,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            price: None,
            status: FetchStatus::Failed,
            error: Some(error.into()),
        }
    }

    pub fn blocked(error: impl Into<String>) -> Self {
        Self {
            price: None,
            status: FetchStatus::Blocked,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == FetchStatus::Success
    }
}

/// Per-competitor result of one check cycle, used for aggregate reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub competitor_id: Uuid,
    pub status: FetchStatus,
    pub old_price: Option<f64>,
    pub new_price: Option<f64>,
    pub percent_change: f64,
}

impl CheckResult {
    pub fn both_prices_known(&self) -> bool {
        self.old_price.is_some() && self.new_price.is_some()
    }

    pub fn crosses_threshold(&self, threshold_percent: f64) -> bool {
        self.both_prices_known() && self.percent_change.abs() >= threshold_percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn frequency_parses_case_insensitively() {
        assert_eq!("Daily".parse::<AlertFrequency>().unwrap(), AlertFrequency::Daily);
        assert_eq!(" immediate ".parse::<AlertFrequency>().unwrap(), AlertFrequency::Immediate);
        assert!("weekly".parse::<AlertFrequency>().is_err());
    }

    #[test]
    fn preferences_fall_back_when_unset() {
        let prefs = AlertPreferences {
            email_enabled: true,
            threshold_percent: None,
            frequency: None,
        };
        assert_eq!(prefs.effective_threshold(7.5), 7.5);
        assert_eq!(prefs.effective_frequency(AlertFrequency::Daily), AlertFrequency::Daily);

        let defaults = AlertPreferences::default();
        assert_eq!(defaults.effective_threshold(1.0), DEFAULT_THRESHOLD_PERCENT);
        assert_eq!(defaults.effective_frequency(AlertFrequency::Daily), AlertFrequency::Immediate);
    }

    #[test]
    fn digest_cursor_only_moves_forward() {
        let mut user = User::new("a@example.com");
        assert_eq!(user.digest_window_start(ts(10)), ts(9));

        user.advance_digest_cursor(ts(10));
        user.advance_digest_cursor(ts(5));
        assert_eq!(user.last_digest_at, Some(ts(10)));
        assert_eq!(user.digest_window_start(ts(20)), ts(10));
    }

    #[test]
    fn record_check_updates_owned_competitor() {
        let mut product = Product::new(Uuid::new_v4(), "Widget");
        let id = product.add_competitor(Competitor::new("mock://a?price=1", None).with_price(10.0));

        assert!(product.record_check(id, None, ts(3)));
        let competitor = product.competitor(id).unwrap();
        assert_eq!(competitor.current_price, None);
        assert_eq!(competitor.last_checked, Some(ts(3)));
        assert!(!product.record_check(Uuid::new_v4(), Some(1.0), ts(3)));
    }

    #[test]
    fn inactive_competitors_are_not_listed_for_checks() {
        let mut product = Product::new(Uuid::new_v4(), "Widget");
        let a = product.add_competitor(Competitor::new("mock://a?price=1", None));
        let mut off = Competitor::new("mock://b?price=2", Some("B".into()));
        off.is_active = false;
        product.add_competitor(off);
        let c = product.add_competitor(Competitor::new("mock://c?price=3", None));
        assert_eq!(product.active_competitor_ids(), vec![a, c]);
    }

    #[test]
    fn history_record_keeps_price_numeric_on_failure() {
        let result = CheckResult {
            competitor_id: Uuid::new_v4(),
            status: FetchStatus::Failed,
            old_price: Some(12.0),
            new_price: None,
            percent_change: 0.0,
        };
        let record = PriceHistoryRecord::from_check(Uuid::new_v4(), &result, ts(1));
        assert_eq!(record.price, 0.0);
        assert_eq!(record.price_change, 0.0);
        assert_eq!(record.status, FetchStatus::Failed);
        assert!(!result.crosses_threshold(0.0));
    }

    #[test]
    fn history_expires_after_retention_window() {
        let result = CheckResult {
            competitor_id: Uuid::new_v4(),
            status: FetchStatus::Success,
            old_price: None,
            new_price: Some(4.0),
            percent_change: 0.0,
        };
        let record = PriceHistoryRecord::from_check(Uuid::new_v4(), &result, ts(1));
        assert!(!record.is_expired(ts(30)));
        assert!(record.is_expired(ts(1) + Duration::days(HISTORY_RETENTION_DAYS)));
    }

    #[test]
    fn alert_kind_follows_direction() {
        assert_eq!(AlertKind::from_prices(100.0, 110.0), AlertKind::PriceIncrease);
        assert_eq!(AlertKind::from_prices(100.0, 90.0), AlertKind::PriceDrop);
    }

    #[test]
    fn serde_uses_snake_case_tags() {
        let json = serde_json::to_string(&FetchOutcome::blocked("captcha")).unwrap();
        assert!(json.contains("\"status\":\"blocked\""));
        let json = serde_json::to_string(&AlertKind::PriceIncrease).unwrap();
        assert_eq!(json, "\"price_increase\"");
    }

    #[test]
    fn competitor_label_prefers_name() {
        let named = Competitor::new("https://www.ebay.com/itm/1", Some("Shop".into()));
        let blank = Competitor::new("https://www.ebay.com/itm/2", Some("  ".into()));
        assert_eq!(named.display_label(), "Shop");
        assert_eq!(blank.display_label(), "https://www.ebay.com/itm/2");
    }
}
