//! Quota Ledger
//!
//! One [`QuotaRecord`] per identity key: the remaining daily uses, the daily
//! allotment at the time of issue and the end of the access window. All
//! mutations run under one ledger-wide lock and are flushed to disk before
//! they return.

use crate::identity::{Identity, IdentityKey, DIRECT_CONTEXT};
use crate::storage::{JsonFile, StorageError};
use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Current on-disk layout version
pub const LEDGER_VERSION: u32 = 2;

const LEGACY_DAY_FORMAT: &str = "%Y-%m-%d";
const LEGACY_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Errors returned by the ledger
#[derive(Debug, Error)]
pub enum LedgerError {
    /// No record matches the given key or nickname
    #[error("no quota record for [{0}]")]
    NotFound(String),
    /// Persisting the ledger failed
    #[error("ledger storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Per-identity quota state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    /// Display name, refreshed on access
    pub nickname: String,
    /// Whether the record belongs to a group context
    #[serde(default)]
    pub is_group: bool,
    /// Group label or `direct`
    #[serde(default = "direct_context")]
    pub group_name: String,
    /// Daily allotment at the time of (re)issue
    pub default_limit: u32,
    /// Uses left today
    pub remaining: u32,
    /// End of the access window
    pub expire_at: DateTime<Utc>,
    /// Last mutation
    pub updated_at: DateTime<Utc>,
    /// Local calendar day of the last daily reset
    #[serde(default)]
    pub rollover_day: Option<NaiveDate>,
}

fn direct_context() -> String {
    DIRECT_CONTEXT.to_string()
}

impl QuotaRecord {
    fn last_rollover_day(&self) -> NaiveDate {
        self.rollover_day.unwrap_or_else(|| local_day(self.updated_at))
    }
}

/// Whether the access window of `record` has closed
#[must_use]
pub fn is_expired(record: &QuotaRecord, now: DateTime<Utc>) -> bool {
    record.expire_at < now
}

fn local_day(at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&Local).date_naive()
}

/// Which records a reset or renewal applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetTarget {
    /// Every record
    All,
    /// Records whose nickname matches exactly
    Nickname(String),
}

impl ResetTarget {
    /// `all` (or nothing) selects every record, anything else is a nickname
    #[must_use]
    pub fn parse(arg: Option<&str>) -> Self {
        match arg.map(str::trim) {
            None | Some("") => Self::All,
            Some(a) if a.eq_ignore_ascii_case("all") => Self::All,
            Some(a) => Self::Nickname(a.to_string()),
        }
    }

    fn matches(&self, record: &QuotaRecord) -> bool {
        match self {
            Self::All => true,
            Self::Nickname(n) => record.nickname == *n,
        }
    }
}

#[derive(Debug, Clone)]
struct LedgerState {
    daily_limit: u32,
    records: BTreeMap<IdentityKey, QuotaRecord>,
}

impl LedgerState {
    fn fresh_record(
        &self,
        identity: &Identity,
        window: Duration,
        now: DateTime<Utc>,
    ) -> QuotaRecord {
        QuotaRecord {
            nickname: identity.nickname.clone(),
            is_group: identity.is_group(),
            group_name: identity.group_name().to_string(),
            default_limit: self.daily_limit,
            remaining: self.daily_limit,
            expire_at: now + window,
            updated_at: now,
            rollover_day: Some(local_day(now)),
        }
    }

    /// Daily reset; returns whether the record changed
    fn roll_over(&self, record: &mut QuotaRecord, now: DateTime<Utc>) -> bool {
        let today = local_day(now);
        if record.last_rollover_day() == today {
            return false;
        }
        record.default_limit = self.daily_limit;
        record.remaining = self.daily_limit;
        record.rollover_day = Some(today);
        record.updated_at = now;
        true
    }
}

/// Current on-disk layout
#[derive(Debug, Serialize, Deserialize)]
struct LedgerDocument {
    version: u32,
    #[serde(default)]
    daily_limit: Option<u32>,
    #[serde(default)]
    records: BTreeMap<IdentityKey, QuotaRecord>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LedgerFile {
    Current(LedgerDocument),
    Legacy(BTreeMap<String, LegacyEntry>),
}

#[derive(Deserialize)]
struct LegacyEntry {
    #[serde(default)]
    mj_data: Option<LegacyUserQuota>,
    #[serde(default)]
    mj_datas: Option<LegacyIdentityQuota>,
}

/// Per-user layout, one record per user regardless of group
#[derive(Deserialize)]
struct LegacyUserQuota {
    #[serde(default)]
    limit: i64,
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
}

/// Per-identity layout keyed by `<user>_<group>`
#[derive(Deserialize)]
struct LegacyIdentityQuota {
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default)]
    isgroup: bool,
    #[serde(default)]
    group_name: Option<String>,
    #[serde(default)]
    default_limit: Option<i64>,
    #[serde(default)]
    limit: i64,
    #[serde(default)]
    expire_time: Option<String>,
    #[serde(default)]
    update_time: Option<String>,
}

fn clamp_count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

fn parse_legacy_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw?, LEGACY_TIME_FORMAT).ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

fn migrate_legacy(
    entries: BTreeMap<String, LegacyEntry>,
    daily_limit: u32,
    window: Duration,
    now: DateTime<Utc>,
) -> BTreeMap<IdentityKey, QuotaRecord> {
    let mut records = BTreeMap::new();
    for (raw_key, entry) in entries {
        if let Some(data) = entry.mj_datas {
            let updated_at = parse_legacy_time(data.update_time.as_deref()).unwrap_or(now);
            let record = QuotaRecord {
                nickname: data.nickname.unwrap_or_default(),
                is_group: data.isgroup,
                group_name: data.group_name.unwrap_or_else(direct_context),
                default_limit: data.default_limit.map_or(daily_limit, clamp_count),
                remaining: clamp_count(data.limit),
                expire_at: parse_legacy_time(data.expire_time.as_deref())
                    .unwrap_or(now + window),
                updated_at,
                rollover_day: Some(local_day(updated_at)),
            };
            records.insert(IdentityKey::from_raw(raw_key), record);
        } else if let Some(data) = entry.mj_data {
            let rollover_day = data
                .time
                .as_deref()
                .and_then(|t| NaiveDate::parse_from_str(t, LEGACY_DAY_FORMAT).ok());
            let record = QuotaRecord {
                nickname: data.nickname.unwrap_or_default(),
                is_group: false,
                group_name: direct_context(),
                default_limit: daily_limit,
                remaining: clamp_count(data.limit),
                expire_at: now + window,
                updated_at: now,
                rollover_day,
            };
            records.insert(IdentityKey::new(&raw_key, DIRECT_CONTEXT), record);
        } else {
            warn!(key = %raw_key, "Skipping unrecognised legacy quota entry");
        }
    }
    records
}

/// Durable per-identity quota store
pub struct QuotaLedger {
    file: JsonFile,
    window: Duration,
    state: Mutex<LedgerState>,
}

impl QuotaLedger {
    /// Opens the ledger.
    ///
    /// A daily limit persisted by an earlier `set_default_limit` takes
    /// precedence over `daily_limit`. Legacy layouts are migrated and
    /// rewritten in the current layout.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the file cannot be read, decoded or rewritten.
    pub async fn open(
        file: JsonFile,
        daily_limit: u32,
        access_window_days: i64,
    ) -> Result<Self, StorageError> {
        let window = Duration::days(access_window_days);
        let now = Utc::now();
        let (state, rewrite) = match file.load::<LedgerFile>().await? {
            None => (
                LedgerState {
                    daily_limit,
                    records: BTreeMap::new(),
                },
                true,
            ),
            Some(LedgerFile::Current(doc)) => (
                LedgerState {
                    daily_limit: doc.daily_limit.unwrap_or(daily_limit),
                    records: doc.records,
                },
                false,
            ),
            Some(LedgerFile::Legacy(entries)) => {
                let records = migrate_legacy(entries, daily_limit, window, now);
                info!(records = records.len(), "Migrated legacy quota ledger");
                (
                    LedgerState {
                        daily_limit,
                        records,
                    },
                    true,
                )
            }
        };

        let ledger = Self {
            file,
            window,
            state: Mutex::new(state),
        };
        if rewrite {
            let state = ledger.state.lock().await;
            ledger.persist(&state).await?;
        }
        Ok(ledger)
    }

    async fn persist(&self, state: &LedgerState) -> Result<(), StorageError> {
        let doc = LedgerDocument {
            version: LEDGER_VERSION,
            daily_limit: Some(state.daily_limit),
            records: state.records.clone(),
        };
        self.file.save(&doc).await
    }

    /// Current system-wide daily limit
    pub async fn daily_limit(&self) -> u32 {
        self.state.lock().await.daily_limit
    }

    /// Record for `key`, if any, without rollover
    pub async fn get(&self, key: &IdentityKey) -> Option<QuotaRecord> {
        self.state.lock().await.records.get(key).cloned()
    }

    /// Every record ordered by key
    pub async fn records(&self) -> Vec<(IdentityKey, QuotaRecord)> {
        self.state
            .lock()
            .await
            .records
            .iter()
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect()
    }

    /// Returns the record of `identity`, creating it or applying the daily
    /// reset first.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Storage` if a change could not be persisted.
    pub async fn get_or_init(&self, identity: &Identity) -> Result<QuotaRecord, LedgerError> {
        self.get_or_init_at(identity, Utc::now()).await
    }

    /// [`Self::get_or_init`] at an explicit instant
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Storage` if a change could not be persisted.
    pub async fn get_or_init_at(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<QuotaRecord, LedgerError> {
        let key = identity.key();
        let mut state = self.state.lock().await;

        let Some(mut record) = state.records.get(&key).cloned() else {
            let record = state.fresh_record(identity, self.window, now);
            let mut next = state.clone();
            next.records.insert(key.clone(), record.clone());
            self.persist(&next).await?;
            *state = next;
            info!(identity = %key, remaining = record.remaining, "Quota record created");
            return Ok(record);
        };

        let mut changed = state.roll_over(&mut record, now);
        if changed {
            debug!(identity = %key, remaining = record.remaining, "Daily quota reset");
        }
        if record.nickname != identity.nickname && !identity.nickname.is_empty() {
            record.nickname.clone_from(&identity.nickname);
            changed = true;
        }
        if changed {
            let mut next = state.clone();
            next.records.insert(key, record.clone());
            self.persist(&next).await?;
            *state = next;
        }
        Ok(record)
    }

    /// Decrements `remaining` by `amount`, clamped at zero.
    ///
    /// Applies the daily reset first so a completion landing after midnight
    /// is charged to the new day. Returns `None` (and logs) when the key has
    /// no record.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Storage` if the change could not be persisted.
    pub async fn debit(
        &self,
        key: &IdentityKey,
        amount: u32,
    ) -> Result<Option<QuotaRecord>, LedgerError> {
        self.debit_at(key, amount, Utc::now()).await
    }

    /// [`Self::debit`] at an explicit instant
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Storage` if the change could not be persisted.
    pub async fn debit_at(
        &self,
        key: &IdentityKey,
        amount: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaRecord>, LedgerError> {
        let mut state = self.state.lock().await;
        let Some(existing) = state.records.get(key) else {
            warn!(identity = %key, "Debit for unknown identity ignored");
            return Ok(None);
        };

        let mut record = existing.clone();
        state.roll_over(&mut record, now);
        record.remaining = record.remaining.saturating_sub(amount);
        record.updated_at = now;

        let mut next = state.clone();
        next.records.insert(key.clone(), record.clone());
        self.persist(&next).await?;
        *state = next;

        debug!(identity = %key, remaining = record.remaining, "Quota debited");
        Ok(Some(record))
    }

    /// Sets the system-wide daily limit and immediately rewrites every
    /// record's `default_limit` and `remaining` to it. Returns the number of
    /// records rewritten.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Storage` if the change could not be persisted.
    pub async fn set_default_limit(&self, limit: u32) -> Result<usize, LedgerError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.daily_limit = limit;
        for record in next.records.values_mut() {
            record.default_limit = limit;
            record.remaining = limit;
            record.updated_at = now;
        }
        self.persist(&next).await?;
        let count = next.records.len();
        *state = next;
        info!(limit, records = count, "Daily limit changed");
        Ok(count)
    }

    /// Restores `remaining` to the configured daily limit for the matching
    /// records; `expire_at` is left untouched.
    ///
    /// # Errors
    ///
    /// `NotFound` when a nickname matches no record, `Storage` on persist
    /// failure.
    pub async fn reset_limit(&self, target: &ResetTarget) -> Result<usize, LedgerError> {
        let now = Utc::now();
        self.update_matching(target, |limit, record| {
            record.default_limit = limit;
            record.remaining = limit;
            record.updated_at = now;
        })
        .await
    }

    /// Moves the end of the access window of matching records to
    /// `now + days`.
    ///
    /// # Errors
    ///
    /// `NotFound` when a nickname matches no record, `Storage` on persist
    /// failure.
    pub async fn renew(&self, target: &ResetTarget, days: i64) -> Result<usize, LedgerError> {
        let now = Utc::now();
        let expire_at = now + Duration::days(days);
        self.update_matching(target, |_, record| {
            record.expire_at = expire_at;
            record.updated_at = now;
        })
        .await
    }

    async fn update_matching(
        &self,
        target: &ResetTarget,
        apply: impl Fn(u32, &mut QuotaRecord),
    ) -> Result<usize, LedgerError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let limit = next.daily_limit;
        let mut count = 0;
        for record in next.records.values_mut().filter(|r| target.matches(r)) {
            apply(limit, record);
            count += 1;
        }
        if let ResetTarget::Nickname(name) = target {
            if count == 0 {
                return Err(LedgerError::NotFound(name.clone()));
            }
        }
        self.persist(&next).await?;
        *state = next;
        Ok(count)
    }

    /// Deletes the record with identity key `selector`, or every record whose
    /// nickname is `selector`. Returns the removed keys.
    ///
    /// # Errors
    ///
    /// `NotFound` when nothing matches, `Storage` on persist failure.
    pub async fn remove(&self, selector: &str) -> Result<Vec<IdentityKey>, LedgerError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let by_key = IdentityKey::from_raw(selector);
        let removed: Vec<IdentityKey> = if next.records.remove(&by_key).is_some() {
            vec![by_key]
        } else {
            let keys: Vec<IdentityKey> = next
                .records
                .iter()
                .filter(|(_, r)| r.nickname == selector)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                next.records.remove(key);
            }
            keys
        };
        if removed.is_empty() {
            return Err(LedgerError::NotFound(selector.to_string()));
        }
        self.persist(&next).await?;
        *state = next;
        info!(removed = removed.len(), "Quota records deleted");
        Ok(removed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::tests::temp_dir;
    use chrono::NaiveTime;
    use std::sync::Arc;
    use std::path::PathBuf;

    /// Local noon of a fixed day, as UTC
    pub(crate) fn local_noon(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        let naive = NaiveDate::from_ymd_opt(year, month, day)
            .expect("valid date")
            .and_time(NaiveTime::from_hms_opt(12, 0, 0).expect("valid time"));
        Local
            .from_local_datetime(&naive)
            .earliest()
            .expect("local noon exists")
            .with_timezone(&Utc)
    }

    async fn open_ledger(limit: u32) -> (QuotaLedger, PathBuf) {
        let dir = temp_dir();
        let ledger = QuotaLedger::open(JsonFile::new(dir.join("quota.json")), limit, 30)
            .await
            .expect("open ledger");
        (ledger, dir)
    }

    #[tokio::test]
    async fn test_new_identity_scenario() {
        let (ledger, dir) = open_ledger(10).await;
        let alice = Identity::direct("1", "alice");
        let bob = Identity::in_group("2", "bob", "-100", "Artists");
        let now = Utc::now();

        let record = ledger.get_or_init_at(&alice, now).await.expect("init");
        assert_eq!(record.remaining, 10);
        assert_eq!(record.expire_at, now + Duration::days(30));
        let bob_record = ledger.get_or_init_at(&bob, now).await.expect("init");
        assert!(bob_record.is_group);
        assert_eq!(bob_record.group_name, "Artists");

        for _ in 0..3 {
            ledger
                .debit_at(&alice.key(), 1, now)
                .await
                .expect("debit");
        }
        assert_eq!(
            ledger.get(&alice.key()).await.map(|r| r.remaining),
            Some(7)
        );

        let count = ledger.reset_limit(&ResetTarget::All).await.expect("reset");
        assert_eq!(count, 2);
        for (_, record) in ledger.records().await {
            assert_eq!(record.remaining, 10);
        }
        let after = ledger.get(&alice.key()).await.expect("record");
        assert_eq!(after.expire_at, record.expire_at);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_set_default_limit_overwrites_balances() {
        let (ledger, dir) = open_ledger(10).await;
        let alice = Identity::direct("1", "alice");
        let now = Utc::now();
        ledger.get_or_init_at(&alice, now).await.expect("init");
        ledger.debit_at(&alice.key(), 2, now).await.expect("debit");

        ledger.set_default_limit(5).await.expect("set limit");
        let record = ledger.get(&alice.key()).await.expect("record");
        assert_eq!(record.remaining, 5);
        assert_eq!(record.default_limit, 5);
        assert_eq!(ledger.daily_limit().await, 5);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_debit_clamps_at_zero_and_ignores_unknown_keys() {
        let (ledger, dir) = open_ledger(2).await;
        let alice = Identity::direct("1", "alice");
        let now = Utc::now();
        ledger.get_or_init_at(&alice, now).await.expect("init");

        let record = ledger
            .debit_at(&alice.key(), 5, now)
            .await
            .expect("debit")
            .expect("known key");
        assert_eq!(record.remaining, 0);

        let missing = ledger
            .debit(&IdentityKey::from_raw("nobody_direct"), 1)
            .await
            .expect("debit");
        assert!(missing.is_none());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_rollover_happens_once_per_day() {
        let (ledger, dir) = open_ledger(10).await;
        let alice = Identity::direct("1", "alice");
        let day_one = local_noon(2024, 3, 10);
        ledger.get_or_init_at(&alice, day_one).await.expect("init");
        ledger
            .debit_at(&alice.key(), 10, day_one)
            .await
            .expect("debit");

        let day_two = local_noon(2024, 3, 11);
        let record = ledger.get_or_init_at(&alice, day_two).await.expect("next day");
        assert_eq!(record.remaining, 10);

        ledger
            .debit_at(&alice.key(), 1, day_two)
            .await
            .expect("debit");
        let later = day_two + Duration::hours(3);
        let record = ledger.get_or_init_at(&alice, later).await.expect("same day");
        assert_eq!(record.remaining, 9);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_reset_and_renew_unknown_nickname() {
        let (ledger, dir) = open_ledger(10).await;
        let target = ResetTarget::Nickname("ghost".into());
        assert!(matches!(
            ledger.reset_limit(&target).await,
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(
            ledger.renew(&target, 30).await,
            Err(LedgerError::NotFound(_))
        ));
        // "all" over an empty ledger is not an error
        assert_eq!(ledger.reset_limit(&ResetTarget::All).await.expect("all"), 0);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_renew_and_expiry() {
        let (ledger, dir) = open_ledger(10).await;
        let alice = Identity::direct("1", "alice");
        let long_ago = Utc::now() - Duration::days(60);
        let record = ledger.get_or_init_at(&alice, long_ago).await.expect("init");
        assert!(is_expired(&record, Utc::now()));

        ledger
            .renew(&ResetTarget::Nickname("alice".into()), 7)
            .await
            .expect("renew");
        let record = ledger.get(&alice.key()).await.expect("record");
        assert!(!is_expired(&record, Utc::now()));
        assert!(is_expired(&record, Utc::now() + Duration::days(8)));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_remove_by_key_or_nickname() {
        let (ledger, dir) = open_ledger(10).await;
        let direct = Identity::direct("1", "alice");
        let grouped = Identity::in_group("1", "alice", "-100", "Artists");
        ledger.get_or_init(&direct).await.expect("init");
        ledger.get_or_init(&grouped).await.expect("init");

        let removed = ledger.remove("1_direct").await.expect("by key");
        assert_eq!(removed, vec![direct.key()]);
        let removed = ledger.remove("alice").await.expect("by nickname");
        assert_eq!(removed, vec![grouped.key()]);
        assert!(matches!(
            ledger.remove("alice").await,
            Err(LedgerError::NotFound(_))
        ));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_state_survives_reopen_with_persisted_limit() {
        let (ledger, dir) = open_ledger(10).await;
        let alice = Identity::direct("1", "alice");
        ledger.get_or_init(&alice).await.expect("init");
        ledger.set_default_limit(4).await.expect("limit");
        drop(ledger);

        let reopened = QuotaLedger::open(JsonFile::new(dir.join("quota.json")), 10, 30)
            .await
            .expect("reopen");
        assert_eq!(reopened.daily_limit().await, 4);
        assert_eq!(
            reopened.get(&alice.key()).await.map(|r| r.remaining),
            Some(4)
        );

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_legacy_layouts_are_migrated() {
        let dir = temp_dir();
        tokio::fs::create_dir_all(&dir).await.expect("mkdir");
        let path = dir.join("quota.json");
        let legacy = r#"{
            "7_Artists": {"mj_datas": {
                "nickname": "carol", "isgroup": true, "group_name": "Artists",
                "default_limit": 10, "limit": 3,
                "expire_time": "2099/01/01 00:00:00",
                "update_time": "2024/03/10 08:00:00"
            }},
            "8": {"mj_data": {"limit": 6, "time": "2024-03-10", "nickname": "dave"}}
        }"#;
        tokio::fs::write(&path, legacy).await.expect("write");

        let ledger = QuotaLedger::open(JsonFile::new(&path), 10, 30)
            .await
            .expect("open");
        let carol = ledger
            .get(&IdentityKey::from_raw("7_Artists"))
            .await
            .expect("carol");
        assert_eq!(carol.remaining, 3);
        assert!(carol.is_group);
        assert!(!is_expired(&carol, Utc::now()));

        let dave = ledger
            .get(&IdentityKey::new("8", DIRECT_CONTEXT))
            .await
            .expect("dave");
        assert_eq!(dave.remaining, 6);
        assert_eq!(dave.rollover_day, NaiveDate::from_ymd_opt(2024, 3, 10));

        // Rewritten in the current layout
        let body = tokio::fs::read_to_string(&path).await.expect("read");
        assert!(body.contains("\"version\""));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[test]
    fn test_reset_target_parse() {
        assert_eq!(ResetTarget::parse(None), ResetTarget::All);
        assert_eq!(ResetTarget::parse(Some("ALL")), ResetTarget::All);
        assert_eq!(
            ResetTarget::parse(Some("alice")),
            ResetTarget::Nickname("alice".into())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debits_are_all_counted_and_clamped() {
        let (ledger, dir) = open_ledger(10).await;
        let ledger = Arc::new(ledger);
        let alice = Identity::direct("1", "alice");
        let noon = local_noon(2024, 5, 1);
        ledger.get_or_init_at(&alice, noon).await.expect("init");

        let spawn_debits = |count: usize| {
            (0..count)
                .map(|_| {
                    let ledger = Arc::clone(&ledger);
                    let key = alice.key();
                    tokio::spawn(async move { ledger.debit_at(&key, 1, noon).await })
                })
                .collect::<Vec<_>>()
        };

        for handle in spawn_debits(7) {
            handle.await.expect("join").expect("debit");
        }
        assert_eq!(ledger.get(&alice.key()).await.map(|r| r.remaining), Some(3));

        for handle in spawn_debits(12) {
            handle.await.expect("join").expect("debit");
        }
        assert_eq!(ledger.get(&alice.key()).await.map(|r| r.remaining), Some(0));

        // The persisted balance matches memory
        let reopened = QuotaLedger::open(JsonFile::new(dir.join("quota.json")), 10, 30)
            .await
            .expect("reopen");
        assert_eq!(reopened.get(&alice.key()).await.map(|r| r.remaining), Some(0));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
