//! YAML watchlist import used to seed users, products and competitors.

use std::path::Path;

use anyhow::{Context, Result};
use pricewatch_adapters::is_supported_listing_url;
use pricewatch_core::{AlertPreferences, Competitor, Product, User};
use pricewatch_storage::RecordStore;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::{validate_preferences, SyncError};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Watchlist {
    #[serde(default)]
    pub users: Vec<WatchlistUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchlistUser {
    pub email: String,
    #[serde(default)]
    pub alert_preferences: Option<AlertPreferences>,
    #[serde(default)]
    pub products: Vec<WatchlistProduct>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchlistProduct {
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
    pub competitors: Vec<WatchlistCompetitor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchlistCompetitor {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub users_created: usize,
    pub users_updated: usize,
    pub products_created: usize,
    pub products_updated: usize,
    pub competitors_added: usize,
    pub competitors_rejected: usize,
}

pub async fn load_watchlist(path: &Path) -> Result<Watchlist> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Merge a watchlist into the store. Users match by email and products by
/// name within their owner; competitors match by URL and keep their id and
/// cached price. Running the same import twice changes nothing.
pub async fn import_watchlist(
    store: &dyn RecordStore,
    watchlist: &Watchlist,
) -> Result<ImportSummary, SyncError> {
    let mut summary = ImportSummary::default();

    for entry in &watchlist.users {
        let email = entry.email.trim();
        let mut user = match store.find_user_by_email(email).await? {
            Some(existing) => {
                summary.users_updated += 1;
                existing
            }
            None => {
                summary.users_created += 1;
                User::new(email)
            }
        };
        if let Some(preferences) = &entry.alert_preferences {
            validate_preferences(preferences)?;
            user.alert_preferences = preferences.clone();
        }
        store.save_user(&user).await?;

        let existing = store.list_products_for_user(user.id).await?;
        for item in &entry.products {
            let mut product = match existing.iter().find(|p| p.name == item.name) {
                Some(found) => {
                    summary.products_updated += 1;
                    found.clone()
                }
                None => {
                    summary.products_created += 1;
                    Product::new(user.id, item.name.clone())
                }
            };
            product.category = item.category.clone();
            product.my_listing_url = item.my_listing_url.clone();
            product.my_current_price = item.my_current_price;
            product.profit_margin = item.profit_margin;

            for listing in &item.competitors {
                let url = listing.url.trim();
                if !is_supported_listing_url(url) {
                    warn!(url, product = %item.name, "skipping unsupported competitor url");
                    summary.competitors_rejected += 1;
                    continue;
                }
                match product.competitors.iter_mut().find(|c| c.url == url) {
                    Some(competitor) => {
                        competitor.name = listing.name.clone();
                        competitor.is_active = listing.is_active;
                    }
                    None => {
                        let mut competitor = Competitor::new(url, listing.name.clone());
                        competitor.is_active = listing.is_active;
                        product.add_competitor(competitor);
                        summary.competitors_added += 1;
                    }
                }
            }
            store.save_product(&product).await?;
        }
    }

    info!(
        users_created = summary.users_created,
        products_created = summary.products_created,
        competitors_added = summary.competitors_added,
        "watchlist imported"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use pricewatch_storage::MemoryRecordStore;
    use tempfile::tempdir;

    use super::*;

    const WATCHLIST: &str = r#"
users:
  - email: seller@example.com
    alert_preferences:
      email_enabled: true
      threshold_percent: 7.5
      frequency: daily
    products:
      - name: Canon 50mm lens
        category: Cameras
        my_current_price: 119.99
        profit_margin: 20
        competitors:
          - url: https://www.ebay.com/itm/1234567890
            name: Lens World
          - url: mock://rival?price=109.5
          - url: https://www.amazon.com/dp/B00
            name: Elsewhere
"#;

    #[tokio::test]
    async fn import_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("watchlist.yaml");
        std::fs::write(&path, WATCHLIST).unwrap();
        let watchlist = load_watchlist(&path).await.expect("load");

        let store = MemoryRecordStore::new();
        let first = import_watchlist(&store, &watchlist).await.unwrap();
        assert_eq!(first.users_created, 1);
        assert_eq!(first.products_created, 1);
        assert_eq!(first.competitors_added, 2);
        assert_eq!(first.competitors_rejected, 1);

        let second = import_watchlist(&store, &watchlist).await.unwrap();
        assert_eq!(second.users_updated, 1);
        assert_eq!(second.products_updated, 1);
        assert_eq!(second.competitors_added, 0);

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.users.len(), 1);
        assert_eq!(snapshot.products.len(), 1);
        let user = &snapshot.users[0];
        assert_eq!(user.alert_preferences.threshold_percent, Some(7.5));
        let product = &snapshot.products[0];
        assert_eq!(product.user_id, user.id);
        assert_eq!(product.competitors.len(), 2);
        assert_eq!(product.competitors[0].display_label(), "Lens World");
    }

    #[tokio::test]
    async fn missing_file_reports_path() {
        let err = load_watchlist(Path::new("/definitely/not/here.yaml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.yaml"));
    }
}
