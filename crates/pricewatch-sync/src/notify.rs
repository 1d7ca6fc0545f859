//! Alert notifier: immediate price alerts, daily digests, and the mail
//! transports they dispatch through.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use askama::Template;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricewatch_core::{Alert, AlertFrequency, CheckResult, Competitor, Product, User};
use pricewatch_storage::{write_atomic, RecordStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{AlertDefaults, MailTransport, SyncError};

pub const TEST_EMAIL_SUBJECT: &str = "Price Monitor Test Email";
const TEST_EMAIL_HTML: &str = "<p>This is a test email from the competitor price monitor.</p>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

impl MailMessage {
    /// Render as an RFC 5322 message with an HTML body.
    pub fn to_eml(&self, date: DateTime<Utc>) -> String {
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/html; charset=utf-8\r\n\r\n{}\r\n",
            self.from,
            self.to,
            self.subject,
            date.to_rfc2822(),
            self.html
        )
    }
}

#[derive(Debug, Error)]
pub enum MailerError {
    #[error("no mail transport configured")]
    NotConfigured,
    #[error("mail delivery failed: {0}")]
    Delivery(String),
    #[error("writing outbox message failed: {0}")]
    Outbox(#[source] StoreError),
    #[error("rendering email failed: {0}")]
    Render(#[from] askama::Error),
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<(), MailerError>;
}

/// Emits each message as a log event instead of delivering it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &MailMessage) -> Result<(), MailerError> {
        info!(
            to = %message.to,
            subject = %message.subject,
            bytes = message.html.len(),
            "email dispatched to log transport"
        );
        Ok(())
    }
}

/// Drops `.eml` files into a pickup directory for an external relay.
#[derive(Debug, Clone)]
pub struct OutboxMailer {
    dir: PathBuf,
}

impl OutboxMailer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Mailer for OutboxMailer {
    async fn send(&self, message: &MailMessage) -> Result<(), MailerError> {
        let now = Utc::now();
        let path = self
            .dir
            .join(format!("{}-{}.eml", now.format("%Y%m%dT%H%M%S"), Uuid::new_v4()));
        write_atomic(&path, message.to_eml(now).as_bytes())
            .await
            .map_err(MailerError::Outbox)?;
        debug!(path = %path.display(), to = %message.to, "queued email in outbox");
        Ok(())
    }
}

/// Build the configured transport. `Disabled` yields `None`, the expected
/// degraded mode where alerts are recorded but never emailed.
pub fn mailer_for(transport: MailTransport, outbox_dir: &Path) -> Option<Arc<dyn Mailer>> {
    match transport {
        MailTransport::Disabled => None,
        MailTransport::Log => Some(Arc::new(LogMailer)),
        MailTransport::Outbox => Some(Arc::new(OutboxMailer::new(outbox_dir))),
    }
}

#[derive(Template)]
#[template(path = "price_alert.html")]
struct PriceAlertTemplate<'a> {
    direction: &'a str,
    product_name: &'a str,
    competitor_label: &'a str,
    competitor_url: &'a str,
    old_price: String,
    new_price: String,
    percent_change: String,
}

struct DigestLine {
    product_name: String,
    competitor_label: String,
    old_price: String,
    new_price: String,
    percent_change: String,
    sent_at: String,
}

#[derive(Template)]
#[template(path = "daily_digest.html")]
struct DailyDigestTemplate {
    lines: Vec<DigestLine>,
}

pub fn render_price_alert_html(
    product: &Product,
    competitor: &Competitor,
    alert: &Alert,
) -> Result<String, MailerError> {
    let html = PriceAlertTemplate {
        direction: alert.kind.direction_word(),
        product_name: &product.name,
        competitor_label: competitor.display_label(),
        competitor_url: &competitor.url,
        old_price: format!("{:.2}", alert.old_price),
        new_price: format!("{:.2}", alert.new_price),
        percent_change: format!("{:.2}", alert.percent_change),
    }
    .render()?;
    Ok(html)
}

/// One table row per alert. `products` resolves names; alerts whose product
/// or competitor has since disappeared still render with placeholders.
pub fn render_digest_html(
    alerts: &[Alert],
    products: &HashMap<Uuid, Product>,
) -> Result<String, MailerError> {
    let lines = alerts
        .iter()
        .map(|alert| {
            let product = products.get(&alert.product_id);
            let competitor = product.and_then(|p| p.competitor(alert.competitor_id));
            DigestLine {
                product_name: product
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| "Unknown product".to_string()),
                competitor_label: competitor
                    .map(|c| c.display_label().to_string())
                    .unwrap_or_else(|| "Unknown competitor".to_string()),
                old_price: format!("{:.2}", alert.old_price),
                new_price: format!("{:.2}", alert.new_price),
                percent_change: format!("{:+.2}", alert.percent_change),
                sent_at: alert.sent_at.format("%Y-%m-%d %H:%M UTC").to_string(),
            }
        })
        .collect();
    Ok(DailyDigestTemplate { lines }.render()?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DigestOutcome {
    /// One digest email went out.
    Sent { alerts: usize },
    /// Alerts were pending but no transport is configured.
    Recorded { alerts: usize },
    NothingToSend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestFailure {
    pub user_id: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DigestSweepSummary {
    pub users_considered: usize,
    pub digests_sent: usize,
    pub digests_recorded: usize,
    pub nothing_to_send: usize,
    pub failures: Vec<DigestFailure>,
}

/// Records alerts and decides when they are emailed.
#[derive(Clone)]
pub struct AlertNotifier {
    store: Arc<dyn RecordStore>,
    mailer: Option<Arc<dyn Mailer>>,
    from_email: String,
    defaults: AlertDefaults,
}

impl AlertNotifier {
    pub fn new(
        store: Arc<dyn RecordStore>,
        mailer: Option<Arc<dyn Mailer>>,
        from_email: impl Into<String>,
    ) -> Self {
        Self {
            store,
            mailer,
            from_email: from_email.into(),
            defaults: AlertDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: AlertDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn defaults(&self) -> AlertDefaults {
        self.defaults
    }

    pub fn has_transport(&self) -> bool {
        self.mailer.is_some()
    }

    fn wants_digest(&self, user: &User) -> bool {
        user.alert_preferences.email_enabled
            && user.alert_preferences.effective_frequency(self.defaults.frequency)
                == AlertFrequency::Daily
    }

    /// Record an alert for a threshold-crossing check and, for users on the
    /// immediate schedule with email enabled, email it right away.
    ///
    /// Returns `None` when either price is unknown. Mail problems are logged
    /// and never fail the call; only the alert insert can.
    pub async fn notify_price_change(
        &self,
        user: &User,
        product: &Product,
        competitor: &Competitor,
        result: &CheckResult,
        at: DateTime<Utc>,
    ) -> Result<Option<Alert>, StoreError> {
        let (Some(old_price), Some(new_price)) = (result.old_price, result.new_price) else {
            return Ok(None);
        };
        let alert = Alert::new(
            user.id,
            product.id,
            competitor.id,
            old_price,
            new_price,
            result.percent_change,
            at,
        );

        let prefs = &user.alert_preferences;
        let immediate =
            prefs.effective_frequency(self.defaults.frequency) == AlertFrequency::Immediate;
        if immediate && prefs.email_enabled {
            self.dispatch_price_alert(user, product, competitor, &alert).await;
        }

        self.store.insert_alert(&alert).await?;
        info!(
            user_id = %user.id,
            product_id = %product.id,
            competitor_id = %competitor.id,
            kind = ?alert.kind,
            percent_change = alert.percent_change,
            "price alert recorded"
        );
        Ok(Some(alert))
    }

    async fn dispatch_price_alert(
        &self,
        user: &User,
        product: &Product,
        competitor: &Competitor,
        alert: &Alert,
    ) {
        let Some(mailer) = &self.mailer else {
            debug!(user_id = %user.id, "no mail transport configured; skipping alert email");
            return;
        };
        let html = match render_price_alert_html(product, competitor, alert) {
            Ok(html) => html,
            Err(err) => {
                warn!(user_id = %user.id, error = %err, "could not render alert email");
                return;
            }
        };
        let message = MailMessage {
            from: self.from_email.clone(),
            to: user.email.clone(),
            subject: format!("Price Alert: {}", product.name),
            html,
        };
        if let Err(err) = mailer.send(&message).await {
            warn!(user_id = %user.id, product_id = %product.id, error = %err, "alert email failed");
        }
    }

    /// Send one user's digest of unread alerts since their cursor.
    ///
    /// The cursor advances to `now` after a send, an empty window, or a
    /// missing transport. A failed send leaves it untouched so the next run
    /// retries the same window.
    pub async fn send_digest_for_user(
        &self,
        user: &mut User,
        now: DateTime<Utc>,
    ) -> Result<DigestOutcome, SyncError> {
        let since = user.digest_window_start(now);
        let alerts: Vec<Alert> = self
            .store
            .unread_alerts_since(user.id, since)
            .await?
            .into_iter()
            .filter(|alert| alert.sent_at <= now)
            .collect();

        let outcome = if alerts.is_empty() {
            DigestOutcome::NothingToSend
        } else if let Some(mailer) = &self.mailer {
            let products: HashMap<Uuid, Product> = self
                .store
                .list_products_for_user(user.id)
                .await?
                .into_iter()
                .map(|p| (p.id, p))
                .collect();
            let count = alerts.len();
            let message = MailMessage {
                from: self.from_email.clone(),
                to: user.email.clone(),
                subject: format!(
                    "Daily Price Digest: {count} price change{}",
                    if count == 1 { "" } else { "s" }
                ),
                html: render_digest_html(&alerts, &products)?,
            };
            mailer.send(&message).await?;
            DigestOutcome::Sent { alerts: count }
        } else {
            debug!(
                user_id = %user.id,
                alerts = alerts.len(),
                "no mail transport configured; digest not emailed"
            );
            DigestOutcome::Recorded {
                alerts: alerts.len(),
            }
        };

        // Only the cursor is written; preferences edited while the mail was
        // in flight stay as stored.
        match self.store.advance_digest_cursor(user.id, now).await? {
            Some(stored) => *user = stored,
            None => user.advance_digest_cursor(now),
        }
        Ok(outcome)
    }

    /// Run the digest for every user on the daily schedule. One user's
    /// failure is logged and reported without stopping the rest.
    pub async fn run_daily_digest(
        &self,
        now: DateTime<Utc>,
    ) -> Result<DigestSweepSummary, StoreError> {
        let users = self.store.list_users().await?;
        let mut summary = DigestSweepSummary::default();

        for mut user in users.into_iter().filter(|u| self.wants_digest(u)) {
            summary.users_considered += 1;
            match self.send_digest_for_user(&mut user, now).await {
                Ok(DigestOutcome::Sent { .. }) => summary.digests_sent += 1,
                Ok(DigestOutcome::Recorded { .. }) => summary.digests_recorded += 1,
                Ok(DigestOutcome::NothingToSend) => summary.nothing_to_send += 1,
                Err(err) => {
                    error!(user_id = %user.id, error = %err, "daily digest failed for user");
                    summary.failures.push(DigestFailure {
                        user_id: user.id,
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            users = summary.users_considered,
            sent = summary.digests_sent,
            failed = summary.failures.len(),
            "daily digest finished"
        );
        Ok(summary)
    }

    /// Deliver a fixed test message. Unlike alert dispatch, a missing
    /// transport is an error here.
    pub async fn send_test_email(&self, to: &str) -> Result<(), MailerError> {
        let mailer = self.mailer.as_ref().ok_or(MailerError::NotConfigured)?;
        mailer
            .send(&MailMessage {
                from: self.from_email.clone(),
                to: to.to_string(),
                subject: TEST_EMAIL_SUBJECT.to_string(),
                html: TEST_EMAIL_HTML.to_string(),
            })
            .await
    }
}
