//! Durable user store backed by a flat JSON file.
//!
//! All records live in memory; every mutation is written through to disk
//! (temp file + rename, so a crash never leaves a half-written file) before
//! the call returns. Mutations on the same id are serialized through a
//! per-id lock; operations on different ids only contend on the short
//! map and file critical sections.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::store::error::StoreError;
use crate::store::user::{Language, Reminder, UserRecord, UserRole};

/// Seed data for a record created on first contact.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub role: UserRole,
    pub language: Language,
    pub display_name: String,
    pub username: Option<String>,
}

/// User counts per privilege tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleCounts {
    pub users: usize,
    pub moderators: usize,
    pub admins: usize,
}

/// Daily activity aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivitySummary {
    pub total_users: usize,
    pub new_today: usize,
    pub active_today: usize,
    pub messages_total: u64,
}

/// The rate-limit window length in seconds.
const RATE_WINDOW_SECS: i64 = 60;

#[derive(Debug)]
pub struct UserStore {
    path: PathBuf,
    records: RwLock<HashMap<i64, UserRecord>>,
    /// Per-identity mutation locks, created lazily.
    id_locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
    /// Serializes the file write path so partial writes never interleave.
    write_lock: Mutex<()>,
}

impl UserStore {
    /// Open the store at `path`, loading any existing records.
    ///
    /// A missing file starts an empty store. An unreadable or non-JSON file
    /// is an error; individual records that fail validation are skipped with
    /// a warning so one bad entry cannot take the rest down.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut records = HashMap::new();

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| StoreError::Io { path: path.clone(), source: e })?;

            if !content.trim().is_empty() {
                let raw: HashMap<String, serde_json::Value> = serde_json::from_str(&content)
                    .map_err(|e| StoreError::Corrupt { path: path.clone(), source: e })?;

                for (key, value) in raw {
                    let id: i64 = match key.parse() {
                        Ok(id) => id,
                        Err(_) => {
                            warn!("Skipping record with non-numeric key '{}'", key);
                            continue;
                        }
                    };
                    match serde_json::from_value::<UserRecord>(value) {
                        Ok(mut record) if record.id == id => {
                            record.migrate();
                            records.insert(id, record);
                        }
                        Ok(record) => {
                            warn!(
                                "Skipping record under key {} with mismatched id {}",
                                id, record.id
                            );
                        }
                        Err(e) => {
                            warn!("Skipping malformed record for user {}: {}", id, e);
                        }
                    }
                }
            }
            info!("Loaded {} user record(s) from {:?}", records.len(), path);
        } else {
            info!("No store file at {:?}, starting empty", path);
        }

        Ok(Self {
            path,
            records: RwLock::new(records),
            id_locks: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
        })
    }

    fn id_lock(&self, id: i64) -> Arc<AsyncMutex<()>> {
        let mut locks = self.id_locks.lock().expect("id lock registry poisoned");
        locks.entry(id).or_default().clone()
    }

    /// Write the full record set to disk atomically.
    fn persist(&self) -> Result<(), StoreError> {
        let json = {
            let records = self.records.read().expect("record map poisoned");
            let by_key: BTreeMap<String, &UserRecord> =
                records.iter().map(|(id, r)| (id.to_string(), r)).collect();
            serde_json::to_string_pretty(&by_key).map_err(StoreError::Serialize)?
        };

        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| StoreError::Io { path: tmp.clone(), source: e })?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| StoreError::Io { path: self.path.clone(), source: e })?;
        Ok(())
    }

    /// Return the record for `id`, creating a default one on first contact.
    ///
    /// Creation is idempotent: subsequent calls return the accumulated state
    /// without re-initializing anything.
    pub async fn get_or_create(&self, id: i64, seed: &NewUser) -> Result<UserRecord, StoreError> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        if let Some(record) = self.records.read().expect("record map poisoned").get(&id) {
            return Ok(record.clone());
        }

        let mut record = UserRecord::new(id, seed.role, seed.language, Utc::now());
        record.profile.display_name = seed.display_name.clone();
        record.profile.username = seed.username.clone();

        self.records
            .write()
            .expect("record map poisoned")
            .insert(id, record.clone());
        self.persist()?;
        info!("Created record for user {} (role: {})", id, seed.role);
        Ok(record)
    }

    /// Atomically read, transform, and write back the record for `id`.
    ///
    /// The per-id lock guarantees no concurrent update on the same id is
    /// lost. Returns the record after the mutation.
    pub async fn update<F>(&self, id: i64, f: F) -> Result<UserRecord, StoreError>
    where
        F: FnOnce(&mut UserRecord),
    {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let updated = {
            let mut records = self.records.write().expect("record map poisoned");
            let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            f(record);
            record.clone()
        };
        self.persist()?;
        Ok(updated)
    }

    /// Count a request against the per-minute window; `Ok(false)` means the
    /// quota is exhausted and nothing was mutated.
    pub async fn check_and_increment_rate(
        &self,
        id: i64,
        limit_per_minute: u32,
    ) -> Result<bool, StoreError> {
        self.check_and_increment_rate_at(id, limit_per_minute, Utc::now()).await
    }

    /// Same as [`check_and_increment_rate`] with an explicit clock.
    pub async fn check_and_increment_rate_at(
        &self,
        id: i64,
        limit_per_minute: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let allowed = {
            let mut records = self.records.write().expect("record map poisoned");
            let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;

            if now > record.counters.window_start + Duration::seconds(RATE_WINDOW_SECS) {
                record.counters.window_start = now;
                record.counters.count = 1;
                true
            } else if record.counters.count >= limit_per_minute {
                false
            } else {
                record.counters.count += 1;
                true
            }
        };

        if allowed {
            self.persist()?;
        }
        Ok(allowed)
    }

    /// Change `target_id`'s role. Only an Admin actor may do this.
    pub async fn set_role(
        &self,
        actor_id: i64,
        target_id: i64,
        new_role: UserRole,
    ) -> Result<UserRecord, StoreError> {
        {
            let records = self.records.read().expect("record map poisoned");
            let is_admin = records
                .get(&actor_id)
                .map(|r| r.role == UserRole::Admin)
                .unwrap_or(false);
            if !is_admin {
                return Err(StoreError::PermissionDenied);
            }
        }

        let updated = self.update(target_id, |record| record.role = new_role).await?;
        info!("User {} set role of {} to {}", actor_id, target_id, new_role);
        Ok(updated)
    }

    /// Look up a record without creating it.
    pub fn get(&self, id: i64) -> Option<UserRecord> {
        self.records
            .read()
            .expect("record map poisoned")
            .get(&id)
            .cloned()
    }

    /// Snapshot of all records.
    pub fn list_all(&self) -> Vec<UserRecord> {
        self.records
            .read()
            .expect("record map poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Remove every record. The full-removal primitive behind data purges.
    pub async fn purge_all(&self) -> Result<usize, StoreError> {
        let removed = {
            let mut records = self.records.write().expect("record map poisoned");
            let n = records.len();
            records.clear();
            n
        };
        self.persist()?;
        info!("Purged {} record(s)", removed);
        Ok(removed)
    }

    /// Queue a reminder for `id`.
    pub async fn append_reminder(
        &self,
        id: i64,
        fire_at: DateTime<Utc>,
        text: impl Into<String>,
    ) -> Result<(), StoreError> {
        let text = text.into();
        self.update(id, |record| {
            record.reminders.push(Reminder { fire_at, text, created_at: Utc::now() });
        })
        .await?;
        Ok(())
    }

    /// Remove and return all reminders due at or before `now`.
    ///
    /// Each reminder is returned exactly once; a second sweep at the same
    /// instant comes back empty.
    pub async fn pop_due_reminders(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(i64, String)>, StoreError> {
        let candidates: Vec<i64> = {
            let records = self.records.read().expect("record map poisoned");
            records
                .values()
                .filter(|r| r.reminders.iter().any(|rem| rem.fire_at <= now))
                .map(|r| r.id)
                .collect()
        };

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut due = Vec::new();
        for id in candidates {
            let lock = self.id_lock(id);
            let _guard = lock.lock().await;

            let mut records = self.records.write().expect("record map poisoned");
            if let Some(record) = records.get_mut(&id) {
                let mut remaining = Vec::with_capacity(record.reminders.len());
                for reminder in record.reminders.drain(..) {
                    if reminder.fire_at <= now {
                        due.push((id, reminder.text));
                    } else {
                        remaining.push(reminder);
                    }
                }
                record.reminders = remaining;
            }
        }

        if !due.is_empty() {
            self.persist()?;
        }
        Ok(due)
    }

    /// User counts grouped by role.
    pub fn count_by_role(&self) -> RoleCounts {
        let records = self.records.read().expect("record map poisoned");
        let mut counts = RoleCounts { users: 0, moderators: 0, admins: 0 };
        for record in records.values() {
            match record.role {
                UserRole::User => counts.users += 1,
                UserRole::Moderator => counts.moderators += 1,
                UserRole::Admin => counts.admins += 1,
            }
        }
        counts
    }

    /// Activity aggregate for the day containing `now`.
    pub fn activity_summary(&self, now: DateTime<Utc>) -> ActivitySummary {
        let today = now.date_naive();
        let records = self.records.read().expect("record map poisoned");

        ActivitySummary {
            total_users: records.len(),
            new_today: records
                .values()
                .filter(|r| r.created_at.date_naive() == today)
                .count(),
            active_today: records
                .values()
                .filter(|r| r.last_seen_at.date_naive() == today)
                .count(),
            messages_total: records.values().map(|r| r.message_count).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::user::TurnRole;
    use tempfile::TempDir;

    fn seed() -> NewUser {
        NewUser {
            role: UserRole::User,
            language: Language::En,
            display_name: "Alice".to_string(),
            username: Some("alice".to_string()),
        }
    }

    fn admin_seed() -> NewUser {
        NewUser { role: UserRole::Admin, ..seed() }
    }

    fn open_store(dir: &TempDir) -> UserStore {
        UserStore::open(dir.path().join("users.json")).unwrap()
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let first = store.get_or_create(100, &seed()).await.unwrap();
        store
            .update(100, |r| {
                r.message_count = 7;
                r.chat_mode = true;
            })
            .await
            .unwrap();

        let second = store.get_or_create(100, &seed()).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.message_count, 7);
        assert!(second.chat_mode);
    }

    #[tokio::test]
    async fn test_update_unknown_id_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let err = store.update(999, |_| {}).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(999)));
    }

    #[tokio::test]
    async fn test_rate_limit_allows_exactly_limit_per_window() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.get_or_create(100, &seed()).await.unwrap();

        let t0 = Utc::now();
        let mut results = Vec::new();
        for i in 0..5 {
            let now = t0 + Duration::seconds(i * 2);
            results.push(store.check_and_increment_rate_at(100, 3, now).await.unwrap());
        }
        assert_eq!(results, vec![true, true, true, false, false]);
    }

    #[tokio::test]
    async fn test_rate_limit_window_rolls_over() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.get_or_create(100, &seed()).await.unwrap();

        let t0 = Utc::now();
        for _ in 0..3 {
            assert!(store.check_and_increment_rate_at(100, 3, t0).await.unwrap());
        }
        assert!(!store.check_and_increment_rate_at(100, 3, t0).await.unwrap());

        // Past the window, the counter resets and counting starts at 1.
        let later = t0 + Duration::seconds(61);
        assert!(store.check_and_increment_rate_at(100, 3, later).await.unwrap());

        let record = store.get_or_create(100, &seed()).await.unwrap();
        assert_eq!(record.counters.count, 1);
    }

    #[tokio::test]
    async fn test_denied_rate_check_does_not_mutate() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.get_or_create(100, &seed()).await.unwrap();

        let t0 = Utc::now();
        store.check_and_increment_rate_at(100, 1, t0).await.unwrap();
        assert!(!store.check_and_increment_rate_at(100, 1, t0).await.unwrap());
        assert!(!store.check_and_increment_rate_at(100, 1, t0).await.unwrap());

        let record = store.get_or_create(100, &seed()).await.unwrap();
        assert_eq!(record.counters.count, 1);
    }

    #[tokio::test]
    async fn test_set_role_requires_admin_actor() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.get_or_create(1, &admin_seed()).await.unwrap();
        store.get_or_create(2, &seed()).await.unwrap();
        store.get_or_create(3, &seed()).await.unwrap();

        // Plain user cannot change roles.
        let err = store.set_role(2, 3, UserRole::Moderator).await.unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied));

        // Unknown actor cannot either.
        let err = store.set_role(999, 3, UserRole::Moderator).await.unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied));

        // Admin promotes user 2 to moderator.
        let updated = store.set_role(1, 2, UserRole::Moderator).await.unwrap();
        assert_eq!(updated.role, UserRole::Moderator);

        // A moderator still cannot change roles.
        let err = store.set_role(2, 3, UserRole::Admin).await.unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied));
    }

    #[tokio::test]
    async fn test_set_role_unknown_target_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.get_or_create(1, &admin_seed()).await.unwrap();

        let err = store.set_role(1, 999, UserRole::Moderator).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(999)));
    }

    #[tokio::test]
    async fn test_round_trip_survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users.json");

        {
            let store = UserStore::open(&path).unwrap();
            store.get_or_create(100, &seed()).await.unwrap();
            store
                .update(100, |r| {
                    r.chat_mode = true;
                    r.message_count = 3;
                    r.profile.bio = "rustacean".to_string();
                    r.push_turn(TurnRole::User, "hi");
                    r.push_turn(TurnRole::Assistant, "hello!");
                })
                .await
                .unwrap();
        }

        let reopened = UserStore::open(&path).unwrap();
        let record = reopened.get_or_create(100, &seed()).await.unwrap();
        assert!(record.chat_mode);
        assert_eq!(record.message_count, 3);
        assert_eq!(record.profile.bio, "rustacean");
        assert_eq!(record.history.len(), 2);
        assert_eq!(record.profile.username.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users.json");

        {
            let store = UserStore::open(&path).unwrap();
            store.get_or_create(100, &seed()).await.unwrap();
        }

        // Splice a garbage entry into the file by hand.
        let content = std::fs::read_to_string(&path).unwrap();
        let mut raw: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&content).unwrap();
        raw.insert("200".to_string(), serde_json::json!({"id": "not a number"}));
        std::fs::write(&path, serde_json::to_string(&raw).unwrap()).unwrap();

        let reopened = UserStore::open(&path).unwrap();
        let all = reopened.list_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, 100);
    }

    #[test]
    fn test_unparseable_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = UserStore::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_reminders_pop_at_most_once() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.get_or_create(100, &seed()).await.unwrap();

        let t0 = Utc::now();
        store
            .append_reminder(100, t0 + Duration::seconds(5), "call mom")
            .await
            .unwrap();

        // Not due yet.
        assert!(store.pop_due_reminders(t0).await.unwrap().is_empty());

        let due = store.pop_due_reminders(t0 + Duration::seconds(6)).await.unwrap();
        assert_eq!(due, vec![(100, "call mom".to_string())]);

        // Already delivered.
        assert!(store
            .pop_due_reminders(t0 + Duration::seconds(7))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_pop_keeps_future_reminders() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.get_or_create(100, &seed()).await.unwrap();

        let t0 = Utc::now();
        store.append_reminder(100, t0 + Duration::seconds(5), "soon").await.unwrap();
        store.append_reminder(100, t0 + Duration::hours(1), "later").await.unwrap();

        let due = store.pop_due_reminders(t0 + Duration::seconds(10)).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1, "soon");

        let record = store.get_or_create(100, &seed()).await.unwrap();
        assert_eq!(record.reminders.len(), 1);
        assert_eq!(record.reminders[0].text, "later");
    }

    #[tokio::test]
    async fn test_purge_all_removes_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users.json");
        let store = UserStore::open(&path).unwrap();
        store.get_or_create(1, &seed()).await.unwrap();
        store.get_or_create(2, &seed()).await.unwrap();

        assert_eq!(store.purge_all().await.unwrap(), 2);
        assert!(store.list_all().is_empty());

        let reopened = UserStore::open(&path).unwrap();
        assert!(reopened.list_all().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open_store(&dir));
        store.get_or_create(100, &seed()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    store.update(100, |r| r.message_count += 1).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get(100).unwrap().message_count, 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rate_checks_allow_exactly_limit() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open_store(&dir));
        store.get_or_create(100, &seed()).await.unwrap();

        // All calls share one instant so the window never rolls over.
        let now = Utc::now();
        let limit = 50u32;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut allowed = 0u32;
                for _ in 0..10 {
                    if store.check_and_increment_rate_at(100, limit, now).await.unwrap() {
                        allowed += 1;
                    }
                }
                allowed
            }));
        }

        let mut total_allowed = 0;
        for handle in handles {
            total_allowed += handle.await.unwrap();
        }

        assert_eq!(total_allowed, limit);
        assert_eq!(store.get(100).unwrap().counters.count, limit);
    }

    #[tokio::test]
    async fn test_aggregates() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.get_or_create(1, &admin_seed()).await.unwrap();
        store.get_or_create(2, &seed()).await.unwrap();
        store.get_or_create(3, &seed()).await.unwrap();
        store.update(2, |r| r.message_count = 4).await.unwrap();
        store.update(3, |r| r.message_count = 6).await.unwrap();

        let counts = store.count_by_role();
        assert_eq!(counts, RoleCounts { users: 2, moderators: 0, admins: 1 });

        let now = Utc::now();
        let summary = store.activity_summary(now);
        assert_eq!(summary.total_users, 3);
        assert_eq!(summary.new_today, 3);
        assert_eq!(summary.active_today, 3);
        assert_eq!(summary.messages_total, 10);
    }
}
