//! Price fetcher contracts, the `mock:` scheme, and marketplace page parsing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pricewatch_core::FetchOutcome;
use pricewatch_storage::HttpFetcher;
use reqwest::Url;
use scraper::{Html, Selector};
use thiserror::Error;

pub const CRATE_NAME: &str = "pricewatch-adapters";

pub const MOCK_SCHEME: &str = "mock";

/// Price locations on marketplace listing pages, most specific first.
pub const DEFAULT_PRICE_SELECTORS: &[&str] = &[
    ".mainPrice .amount",
    ".u-flL.condText .amount",
    ".current-price .amount",
    "#mm-saleDscPrc",
    "#prcIsum",
    ".x-price-primary .ux-textspans",
];

const BOT_WALL_MARKERS: &[&str] = &[
    "captcha",
    "pardon our interruption",
    "verify you are a human",
    "unusual traffic",
];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
}

/// Resolves one listing URL to a price reading.
///
/// Implementations never fail: transport problems, timeouts and unparseable
/// pages all come back as a `failed` or `blocked` outcome.
#[async_trait]
pub trait PriceFetcher: Send + Sync {
    async fn fetch_price(&self, url: &str) -> FetchOutcome;
}

pub fn is_mock_url(url: &str) -> bool {
    Url::parse(url).is_ok_and(|u| u.scheme() == MOCK_SCHEME)
}

/// Resolve a `mock:` URL from its `price` query parameter. Returns `None`
/// for any other scheme.
pub fn parse_mock_url(url: &str) -> Option<FetchOutcome> {
    let parsed = Url::parse(url).ok()?;
    if parsed.scheme() != MOCK_SCHEME {
        return None;
    }
    let price = parsed
        .query_pairs()
        .find(|(key, _)| key == "price")
        .and_then(|(_, value)| value.trim().parse::<f64>().ok())
        .filter(|p| p.is_finite());
    Some(match price {
        Some(price) => FetchOutcome::success(price),
        None => FetchOutcome::failed("mock url carries no numeric price"),
    })
}

/// Listing URLs accepted at the trigger surface: `mock:` URLs and http(s)
/// URLs on an eBay host.
pub fn is_supported_listing_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url.trim()) else {
        return false;
    };
    match parsed.scheme() {
        MOCK_SCHEME => true,
        "http" | "https" => parsed
            .host_str()
            .is_some_and(|host| host.to_ascii_lowercase().contains("ebay.")),
        _ => false,
    }
}

/// Keep digits and dots, then parse the leading number ("US $1,299.99" is
/// 1299.99).
pub fn parse_price_text(text: &str) -> Option<f64> {
    let mut digits = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else if ch == '.' {
            if seen_dot {
                break;
            }
            seen_dot = true;
            digits.push(ch);
        }
    }
    let digits = digits.trim_end_matches('.');
    if digits.is_empty() || digits == "." {
        return None;
    }
    digits.parse::<f64>().ok().filter(|p| p.is_finite())
}

pub fn looks_like_bot_wall(html: &str) -> bool {
    let lower = html.to_ascii_lowercase();
    BOT_WALL_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_price(document: &Html, selector: &str) -> Result<Option<f64>, AdapterError> {
    let sel = Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })?;
    let Some(node) = document.select(&sel).next() else {
        return Ok(None);
    };
    let raw = text_or_none(node.text().collect::<String>())
        .or_else(|| node.value().attr("content").and_then(|s| text_or_none(s.to_string())));
    Ok(raw.as_deref().and_then(parse_price_text))
}

/// First price found by trying `selectors` in order.
pub fn extract_price<S: AsRef<str>>(
    html: &str,
    selectors: &[S],
) -> Result<Option<f64>, AdapterError> {
    let document = Html::parse_document(html);
    for selector in selectors {
        if let Some(price) = select_first_price(&document, selector.as_ref())? {
            return Ok(Some(price));
        }
    }
    Ok(None)
}

/// Turn a fetched listing page into an outcome.
pub fn classify_page<S: AsRef<str>>(html: &str, selectors: &[S]) -> FetchOutcome {
    match extract_price(html, selectors) {
        Ok(Some(price)) => FetchOutcome::success(price),
        Ok(None) if looks_like_bot_wall(html) => {
            FetchOutcome::blocked("listing page served a bot-detection challenge")
        }
        Ok(None) => FetchOutcome::failed("no price element matched"),
        Err(err) => FetchOutcome::failed(err.to_string()),
    }
}

/// Serves only `mock:` URLs; everything else fails without touching the
/// network.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflinePriceFetcher;

#[async_trait]
impl PriceFetcher for OfflinePriceFetcher {
    async fn fetch_price(&self, url: &str) -> FetchOutcome {
        parse_mock_url(url)
            .unwrap_or_else(|| FetchOutcome::failed("live fetching is disabled (offline mode)"))
    }
}

/// Fetches live listing pages and extracts the price with CSS selectors.
/// `mock:` URLs short-circuit before any request is made.
#[derive(Debug, Clone)]
pub struct MarketplacePriceFetcher {
    http: Arc<HttpFetcher>,
    selectors: Vec<String>,
}

impl MarketplacePriceFetcher {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            http,
            selectors: DEFAULT_PRICE_SELECTORS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_selectors(mut self, selectors: Vec<String>) -> Self {
        self.selectors = selectors;
        self
    }
}

#[async_trait]
impl PriceFetcher for MarketplacePriceFetcher {
    async fn fetch_price(&self, url: &str) -> FetchOutcome {
        if let Some(outcome) = parse_mock_url(url) {
            return outcome;
        }
        let outcome = match self.http.fetch_page(url).await {
            Ok(page) => {
                let outcome = classify_page(&page.body, self.selectors.as_slice());
                if !outcome.is_success() {
                    tracing::debug!(
                        http_status = page.status.as_u16(),
                        final_url = %page.final_url,
                        "listing page yielded no price"
                    );
                }
                outcome
            }
            Err(err) if err.is_bot_wall() => FetchOutcome::blocked(err.to_string()),
            Err(err) => FetchOutcome::failed(err.to_string()),
        };
        if !outcome.is_success() {
            tracing::warn!(
                url,
                status = %outcome.status,
                error = ?outcome.error,
                "price fetch did not succeed"
            );
        }
        outcome
    }
}

/// Bounds any fetcher by a wall-clock timeout; an expired fetch is a
/// `failed` outcome.
#[derive(Clone)]
pub struct TimedFetcher {
    inner: Arc<dyn PriceFetcher>,
    timeout: Duration,
}

impl TimedFetcher {
    pub fn new(inner: Arc<dyn PriceFetcher>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl PriceFetcher for TimedFetcher {
    async fn fetch_price(&self, url: &str) -> FetchOutcome {
        match tokio::time::timeout(self.timeout, self.inner.fetch_price(url)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let timeout_ms = self.timeout.as_millis() as u64;
                tracing::warn!(url, timeout_ms, "price fetch timed out");
                FetchOutcome::failed(format!("fetch timed out after {timeout_ms}ms"))
            }
        }
    }
}
