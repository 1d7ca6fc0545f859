//! Record store boundary, snapshot-backed memory store, and HTTP page client.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricewatch_core::{history_cutoff, Alert, PriceHistoryRecord, Product, User};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

mod http;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedPage,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};

pub const CRATE_NAME: &str = "pricewatch-storage";

/// Upper bound on rows returned by one history query.
pub const HISTORY_QUERY_LIMIT: usize = 2000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("snapshot io failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub product_id: Uuid,
    pub competitor_id: Option<Uuid>,
    pub since: DateTime<Utc>,
    pub limit: usize,
}

impl HistoryQuery {
    pub fn for_product(product_id: Uuid, since: DateTime<Utc>) -> Self {
        Self {
            product_id,
            competitor_id: None,
            since,
            limit: HISTORY_QUERY_LIMIT,
        }
    }

    pub fn competitor(mut self, competitor_id: Option<Uuid>) -> Self {
        self.competitor_id = competitor_id;
        self
    }
}

/// Persistence boundary consumed by the check pipeline.
///
/// Products are written whole; competitors only change through their owning
/// product's save.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn list_users(&self) -> Result<Vec<User>, StoreError>;
    async fn save_user(&self, user: &User) -> Result<(), StoreError>;
    /// Move only the digest cursor, never backwards. Returns the stored user,
    /// or `None` when the user no longer exists.
    async fn advance_digest_cursor(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<User>, StoreError>;

    async fn get_product(&self, product_id: Uuid) -> Result<Option<Product>, StoreError>;
    /// Find a product only if `user_id` owns it.
    async fn find_product_for_user(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<Product>, StoreError>;
    async fn list_products_for_user(&self, user_id: Uuid) -> Result<Vec<Product>, StoreError>;
    /// Products with at least one competitor, optionally limited to one owner,
    /// in insertion order.
    async fn products_with_competitors(
        &self,
        user_id: Option<Uuid>,
    ) -> Result<Vec<Product>, StoreError>;
    async fn save_product(&self, product: &Product) -> Result<(), StoreError>;

    async fn insert_price_history(&self, records: &[PriceHistoryRecord]) -> Result<(), StoreError>;
    /// Newest first, at most `query.limit` rows.
    async fn price_history(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<PriceHistoryRecord>, StoreError>;
    /// Drop rows past the retention window, returning how many were removed.
    async fn purge_expired_history(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn insert_alert(&self, alert: &Alert) -> Result<(), StoreError>;
    /// Newest first, at most `limit` alerts.
    async fn alerts_for_user(&self, user_id: Uuid, limit: usize) -> Result<Vec<Alert>, StoreError>;
    /// Unread alerts sent strictly after `since`, oldest first.
    async fn unread_alerts_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Alert>, StoreError>;
    async fn mark_alert_read(
        &self,
        user_id: Uuid,
        alert_id: Uuid,
    ) -> Result<Option<Alert>, StoreError>;
    async fn count_unread_alerts(&self, user_id: Uuid) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub price_history: Vec<PriceHistoryRecord>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

/// In-process record store. When opened on a path, every mutation rewrites a
/// JSON snapshot through an atomic temp-file rename, and a mutation whose
/// snapshot write fails is not applied.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: RwLock<StoreSnapshot>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
            snapshot_path: None,
        }
    }

    /// Load the snapshot at `path` (an absent file means an empty store) and
    /// keep writing back to it.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let snapshot = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoreSnapshot::default(),
            Err(err) => return Err(StoreError::io(&path, err)),
        };
        tracing::debug!(path = %path.display(), "opened record store snapshot");
        Ok(Self {
            state: RwLock::new(snapshot),
            snapshot_path: Some(path),
        })
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        self.state.read().await.clone()
    }

    /// Apply `change` to a copy of the state, persist the copy, then swap it
    /// in. `change` reports whether it modified anything; untouched state is
    /// not rewritten.
    async fn commit<R, F>(&self, change: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut StoreSnapshot) -> (R, bool),
    {
        let mut state = self.state.write().await;
        let Some(path) = &self.snapshot_path else {
            return Ok(change(&mut *state).0);
        };
        let mut next = state.clone();
        let (out, changed) = change(&mut next);
        if changed {
            let bytes = serde_json::to_vec_pretty(&next)?;
            write_atomic(path, &bytes).await?;
            *state = next;
        }
        Ok(out)
    }
}

/// Write `bytes` to `path` via a uniquely named temp file and a rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|e| StoreError::io(parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io(&temp_path, err));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io(path, err));
    }
    Ok(())
}

fn upsert<T, F>(items: &mut Vec<T>, item: &T, same: F)
where
    T: Clone,
    F: Fn(&T) -> bool,
{
    match items.iter_mut().find(|existing| same(existing)) {
        Some(existing) => *existing = item.clone(),
        None => items.push(item.clone()),
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        let state = self.state.read().await;
        Ok(state.users.iter().find(|u| u.id == user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.state.read().await.users.clone())
    }

    async fn save_user(&self, user: &User) -> Result<(), StoreError> {
        self.commit(|state| {
            upsert(&mut state.users, user, |u| u.id == user.id);
            ((), true)
        })
        .await
    }

    async fn advance_digest_cursor(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<User>, StoreError> {
        self.commit(|state| match state.users.iter_mut().find(|u| u.id == user_id) {
            Some(user) => {
                let before = user.last_digest_at;
                user.advance_digest_cursor(at);
                let changed = user.last_digest_at != before;
                (Some(user.clone()), changed)
            }
            None => (None, false),
        })
        .await
    }

    async fn get_product(&self, product_id: Uuid) -> Result<Option<Product>, StoreError> {
        let state = self.state.read().await;
        Ok(state.products.iter().find(|p| p.id == product_id).cloned())
    }

    async fn find_product_for_user(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<Product>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .products
            .iter()
            .find(|p| p.id == product_id && p.user_id == user_id)
            .cloned())
    }

    async fn list_products_for_user(&self, user_id: Uuid) -> Result<Vec<Product>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .products
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn products_with_competitors(
        &self,
        user_id: Option<Uuid>,
    ) -> Result<Vec<Product>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .products
            .iter()
            .filter(|p| p.has_competitors())
            .filter(|p| user_id.map_or(true, |id| p.user_id == id))
            .cloned()
            .collect())
    }

    async fn save_product(&self, product: &Product) -> Result<(), StoreError> {
        self.commit(|state| {
            upsert(&mut state.products, product, |p| p.id == product.id);
            ((), true)
        })
        .await
    }

    async fn insert_price_history(&self, records: &[PriceHistoryRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        self.commit(|state| {
            state.price_history.extend_from_slice(records);
            ((), true)
        })
        .await
    }

    async fn price_history(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<PriceHistoryRecord>, StoreError> {
        let state = self.state.read().await;
        let mut rows: Vec<PriceHistoryRecord> = state
            .price_history
            .iter()
            .filter(|r| r.product_id == query.product_id)
            .filter(|r| query.competitor_id.map_or(true, |id| r.competitor_id == id))
            .filter(|r| r.checked_at >= query.since)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.checked_at.cmp(&a.checked_at));
        rows.truncate(query.limit);
        Ok(rows)
    }

    async fn purge_expired_history(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = history_cutoff(now);
        self.commit(|state| {
            let before = state.price_history.len();
            state.price_history.retain(|r| r.checked_at > cutoff);
            let removed = before - state.price_history.len();
            (removed, removed > 0)
        })
        .await
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        self.commit(|state| {
            state.alerts.push(alert.clone());
            ((), true)
        })
        .await
    }

    async fn alerts_for_user(&self, user_id: Uuid, limit: usize) -> Result<Vec<Alert>, StoreError> {
        let state = self.state.read().await;
        let mut alerts: Vec<Alert> = state
            .alerts
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
        alerts.truncate(limit);
        Ok(alerts)
    }

    async fn unread_alerts_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Alert>, StoreError> {
        let state = self.state.read().await;
        let mut alerts: Vec<Alert> = state
            .alerts
            .iter()
            .filter(|a| a.user_id == user_id && !a.is_read && a.sent_at > since)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
        Ok(alerts)
    }

    async fn mark_alert_read(
        &self,
        user_id: Uuid,
        alert_id: Uuid,
    ) -> Result<Option<Alert>, StoreError> {
        self.commit(|state| {
            let updated = state
                .alerts
                .iter_mut()
                .find(|a| a.id == alert_id && a.user_id == user_id)
                .map(|alert| {
                    alert.is_read = true;
                    alert.clone()
                });
            let changed = updated.is_some();
            (updated, changed)
        })
        .await
    }

    async fn count_unread_alerts(&self, user_id: Uuid) -> Result<usize, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .alerts
            .iter()
            .filter(|a| a.user_id == user_id && !a.is_read)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pricewatch_core::{CheckResult, Competitor, FetchStatus};
    use tempfile::tempdir;

    fn history_row(
        product_id: Uuid,
        competitor_id: Uuid,
        checked_at: DateTime<Utc>,
    ) -> PriceHistoryRecord {
        let result = CheckResult {
            competitor_id,
            status: FetchStatus::Success,
            old_price: None,
            new_price: Some(10.0),
            percent_change: 0.0,
        };
        PriceHistoryRecord::from_check(product_id, &result, checked_at)
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("store.json");

        let store = MemoryRecordStore::open(&path).await.expect("open empty");
        let user = User::new("seller@example.com");
        let mut product = Product::new(user.id, "Tripod");
        product.add_competitor(Competitor::new("mock://listing?price=20", None));
        store.save_user(&user).await.expect("save user");
        store.save_product(&product).await.expect("save product");
        assert!(path.exists());

        let reopened = MemoryRecordStore::open(&path).await.expect("reopen");
        assert_eq!(reopened.get_user(user.id).await.unwrap(), Some(user.clone()));
        assert_eq!(reopened.get_product(product.id).await.unwrap(), Some(product));
        assert_eq!(
            reopened.find_user_by_email("SELLER@example.com").await.unwrap().map(|u| u.id),
            Some(user.id)
        );
    }

    #[tokio::test]
    async fn products_are_scoped_to_owner() {
        let store = MemoryRecordStore::new();
        let owner = Uuid::new_v4();
        let mut with = Product::new(owner, "With competitors");
        with.add_competitor(Competitor::new("mock://a?price=1", None));
        let without = Product::new(owner, "Empty");
        let mut foreign = Product::new(Uuid::new_v4(), "Foreign");
        foreign.add_competitor(Competitor::new("mock://b?price=1", None));
        for p in [&with, &without, &foreign] {
            store.save_product(p).await.unwrap();
        }

        assert!(store.find_product_for_user(owner, foreign.id).await.unwrap().is_none());
        assert!(store.find_product_for_user(owner, with.id).await.unwrap().is_some());
        let all: Vec<Uuid> = store
            .products_with_competitors(None)
            .await
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(all, vec![with.id, foreign.id]);
        let mine = store.products_with_competitors(Some(owner)).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(store.list_products_for_user(owner).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn history_query_filters_orders_and_limits() {
        let store = MemoryRecordStore::new();
        let product_id = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        let rows = vec![
            history_row(product_id, a, now - Duration::days(40)),
            history_row(product_id, a, now - Duration::days(2)),
            history_row(product_id, b, now - Duration::days(1)),
            history_row(product_id, a, now),
            history_row(Uuid::new_v4(), a, now),
        ];
        store.insert_price_history(&rows).await.unwrap();

        let since = now - Duration::days(30);
        let all = store
            .price_history(&HistoryQuery::for_product(product_id, since))
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].checked_at >= w[1].checked_at));

        let only_a = store
            .price_history(&HistoryQuery::for_product(product_id, since).competitor(Some(a)))
            .await
            .unwrap();
        assert_eq!(only_a.len(), 2);

        let mut limited = HistoryQuery::for_product(product_id, since);
        limited.limit = 1;
        let newest = store.price_history(&limited).await.unwrap();
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].checked_at, now);
    }

    #[tokio::test]
    async fn purge_removes_only_expired_rows() {
        let store = MemoryRecordStore::new();
        let product_id = Uuid::new_v4();
        let now = Utc::now();
        store
            .insert_price_history(&[
                history_row(product_id, Uuid::new_v4(), now - Duration::days(31)),
                history_row(product_id, Uuid::new_v4(), now - Duration::days(29)),
            ])
            .await
            .unwrap();
        assert_eq!(store.purge_expired_history(now).await.unwrap(), 1);
        assert_eq!(store.purge_expired_history(now).await.unwrap(), 0);
        assert_eq!(store.snapshot().await.price_history.len(), 1);
    }

    #[tokio::test]
    async fn alerts_read_state_is_owner_scoped() {
        let store = MemoryRecordStore::new();
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        let (p, c) = (Uuid::new_v4(), Uuid::new_v4());
        let older = Alert::new(user_id, p, c, 10.0, 12.0, 20.0, now - Duration::hours(3));
        let newer = Alert::new(user_id, p, c, 10.0, 8.0, -20.0, now);
        store.insert_alert(&older).await.unwrap();
        store.insert_alert(&newer).await.unwrap();

        let listed = store.alerts_for_user(user_id, 200).await.unwrap();
        assert_eq!(listed[0].id, newer.id);

        assert!(store.mark_alert_read(Uuid::new_v4(), older.id).await.unwrap().is_none());
        let read = store
            .mark_alert_read(user_id, older.id)
            .await
            .unwrap()
            .expect("owned alert");
        assert!(read.is_read);
        assert_eq!(store.count_unread_alerts(user_id).await.unwrap(), 1);

        let pending = store
            .unread_alerts_since(user_id, now - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(pending.iter().map(|a| a.id).collect::<Vec<_>>(), vec![newer.id]);
        assert!(store.unread_alerts_since(user_id, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_rejects_corrupt_snapshot() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(MemoryRecordStore::open(&path).await, Err(StoreError::Json(_))));
    }

    #[tokio::test]
    async fn failed_snapshot_write_leaves_state_untouched() {
        let dir = tempdir().expect("tempdir");
        let data_dir = dir.path().join("data");
        let store = MemoryRecordStore::open(data_dir.join("store.json"))
            .await
            .expect("open empty");
        let user = User::new("seller@example.com");
        store.save_user(&user).await.expect("save user");

        std::fs::remove_dir_all(&data_dir).unwrap();
        std::fs::write(&data_dir, b"not a directory").unwrap();

        let mut product = Product::new(user.id, "Tripod");
        product.add_competitor(Competitor::new("mock://listing?price=20", None));
        assert!(matches!(store.save_product(&product).await, Err(StoreError::Io { .. })));
        assert!(store.get_product(product.id).await.unwrap().is_none());

        let alert = Alert::new(user.id, product.id, Uuid::new_v4(), 10.0, 8.0, -20.0, Utc::now());
        assert!(store.insert_alert(&alert).await.is_err());
        assert_eq!(store.count_unread_alerts(user.id).await.unwrap(), 0);

        assert!(store.advance_digest_cursor(user.id, Utc::now()).await.is_err());
        let stored = store.get_user(user.id).await.unwrap().expect("user kept");
        assert_eq!(stored.last_digest_at, None);
    }

    #[tokio::test]
    async fn digest_cursor_moves_forward_only_and_keeps_preferences() {
        let store = MemoryRecordStore::new();
        let mut user = User::new("seller@example.com");
        store.save_user(&user).await.unwrap();

        user.alert_preferences.threshold_percent = Some(42.0);
        store.save_user(&user).await.unwrap();

        let now = Utc::now();
        let advanced = store
            .advance_digest_cursor(user.id, now)
            .await
            .unwrap()
            .expect("known user");
        assert_eq!(advanced.last_digest_at, Some(now));
        assert_eq!(advanced.alert_preferences.threshold_percent, Some(42.0));

        let earlier = now - Duration::hours(1);
        let kept = store.advance_digest_cursor(user.id, earlier).await.unwrap().unwrap();
        assert_eq!(kept.last_digest_at, Some(now));
        assert!(store
            .advance_digest_cursor(Uuid::new_v4(), now)
            .await
            .unwrap()
            .is_none());
    }
}
