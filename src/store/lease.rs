// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! File-based leader lease.
//!
//! The lease lives in `leader.json` and is only read-modify-written while
//! holding an exclusive `flock` on `leader.lock`. The lock is taken with
//! `try_lock_exclusive`, so a contended lock reports [`StoreError::LeaseBusy`]
//! instead of blocking. These functions do blocking I/O and are meant to be
//! run on the blocking pool.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

use super::StoreResult;

pub(crate) const LEASE_FILE: &str = "leader.json";
pub(crate) const LOCK_FILE: &str = "leader.lock";

/// Persisted lease state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder: String,
    /// Bumped every time the lease changes hands.
    pub fencing_token: u64,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    /// Whether the lease is still in force at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Holds the flock until dropped.
struct LockGuard(File);

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

fn open_lock_file(dir: &Path) -> StoreResult<File> {
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(dir.join(LOCK_FILE))?)
}

fn lock_exclusive(dir: &Path) -> StoreResult<LockGuard> {
    let file = open_lock_file(dir)?;
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => Ok(LockGuard(file)),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => Err(StoreError::LeaseBusy),
        Err(e) => Err(e.into()),
    }
}

fn lock_shared(dir: &Path) -> StoreResult<LockGuard> {
    let file = open_lock_file(dir)?;
    FileExt::lock_shared(&file)?;
    Ok(LockGuard(file))
}

fn read_record(dir: &Path) -> StoreResult<Option<LeaseRecord>> {
    let path = dir.join(LEASE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&content)?))
}

fn write_record(dir: &Path, record: &LeaseRecord) -> StoreResult<()> {
    let json = serde_json::to_vec_pretty(record)?;
    std::fs::write(dir.join(LEASE_FILE), json)?;
    Ok(())
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    chrono::Duration::try_milliseconds(millis)
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Take the lease for `holder`, or return `None` if someone else holds a
/// live one.
pub(crate) fn acquire(dir: &Path, holder: &str, ttl: Duration) -> StoreResult<Option<LeaseRecord>> {
    let _guard = lock_exclusive(dir)?;
    let now = Utc::now();
    let expires_at = expiry(now, ttl);

    let record = match read_record(dir)? {
        Some(current) if current.is_live(now) && current.holder != holder => return Ok(None),
        Some(current) if current.is_live(now) => LeaseRecord {
            expires_at,
            ..current
        },
        Some(current) => LeaseRecord {
            holder: holder.to_string(),
            fencing_token: current.fencing_token + 1,
            expires_at,
        },
        None => LeaseRecord {
            holder: holder.to_string(),
            fencing_token: 1,
            expires_at,
        },
    };

    write_record(dir, &record)?;
    Ok(Some(record))
}

/// Extend a live lease held by `holder`.
pub(crate) fn renew(dir: &Path, holder: &str, ttl: Duration) -> StoreResult<LeaseRecord> {
    let _guard = lock_exclusive(dir)?;
    let now = Utc::now();

    match read_record(dir)? {
        Some(current) if current.is_live(now) && current.holder == holder => {
            let record = LeaseRecord {
                expires_at: expiry(now, ttl),
                ..current
            };
            write_record(dir, &record)?;
            Ok(record)
        }
        Some(current) if current.is_live(now) => Err(StoreError::NotLeader(format!(
            "{} does not hold the lease (held by {})",
            holder, current.holder
        ))),
        _ => Err(StoreError::NotLeader(format!(
            "{} does not hold a live lease",
            holder
        ))),
    }
}

/// Read the lease as it is on disk.
pub(crate) fn current(dir: &Path) -> StoreResult<Option<LeaseRecord>> {
    let _guard = lock_shared(dir)?;
    read_record(dir)
}
