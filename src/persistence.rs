use crate::cache_entry::CacheEntry;
use crate::error::PersistError;
use crate::stats::MemoStats;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// One line of the mirror file. `Put` commits a key, `Del` tombstones it;
/// replaying the lines in order reproduces the committed cache state.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Record<V> {
    Put { k: String, t0: f64, v: V },
    Del { k: String },
}

/// Write-side twin of [`Record`], borrowing the value so commits serialize
/// without cloning.
#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum RecordRef<'a, V> {
    Put { k: &'a str, t0: f64, v: &'a V },
    Del { k: &'a str },
}

/// Entries reconstructed from the mirror, plus the number of records that
/// had to be skipped (corrupt or undecodable).
pub(crate) struct LoadOutcome<V> {
    pub(crate) entries: Vec<(String, CacheEntry<V>)>,
    pub(crate) skipped: u64,
}

/// Storage side of the persistence adapter, object-safe so engines can hold
/// it without carrying serde bounds.
pub(crate) trait PersistBackend<V>: Send {
    /// Replays the mirror into entries, dropping those already past the
    /// duration bound, and compacts the file.
    fn load(&mut self, ttl: Option<Duration>) -> Result<LoadOutcome<V>, PersistError>;
    /// Appends a commit record for `key`.
    fn record(&mut self, key: &str, value: &V) -> Result<(), PersistError>;
    /// Appends a tombstone for `key`.
    fn remove(&mut self, key: &str) -> Result<(), PersistError>;
    /// Truncates the mirror.
    fn clear(&mut self) -> Result<(), PersistError>;
}

/// Append-only JSON-lines mirror of the committed (non-identity-linked)
/// cache entries.
///
/// Each record is one line, so a crash mid-append corrupts at most the
/// trailing line; loading skips undecodable lines and keeps every prior
/// valid record. Loading also compacts: expired entries and tombstoned keys
/// are dropped and the file is rewritten with only the survivors.
pub(crate) struct JsonlMirror<V> {
    path: PathBuf,
    appender: Option<File>,
    _marker: PhantomData<fn() -> V>,
}

impl<V> JsonlMirror<V> {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            appender: None,
            _marker: PhantomData,
        }
    }

    fn appender(&mut self) -> Result<&mut File, PersistError> {
        if self.appender.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.appender = Some(file);
        }
        // Just populated above when empty.
        match self.appender.as_mut() {
            Some(file) => Ok(file),
            None => Err(PersistError::Io(std::io::Error::other(
                "append handle unavailable",
            ))),
        }
    }

    fn append_line<R: Serialize>(&mut self, record: &R) -> Result<(), PersistError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let file = self.appender()?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl<V> PersistBackend<V> for JsonlMirror<V>
where
    V: Serialize + DeserializeOwned + Send + 'static,
{
    fn load(&mut self, ttl: Option<Duration>) -> Result<LoadOutcome<V>, PersistError> {
        let mut committed: HashMap<String, (f64, V)> = HashMap::new();
        let mut skipped = 0u64;

        if self.path.exists() {
            let reader = BufReader::new(File::open(&self.path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Record<V>>(&line) {
                    Ok(Record::Put { k, t0, v }) => {
                        committed.insert(k, (t0, v));
                    }
                    Ok(Record::Del { k }) => {
                        committed.remove(&k);
                    }
                    Err(err) => {
                        warn!(error = %err, "skipping undecodable persistence record");
                        skipped += 1;
                    }
                }
            }
        }

        let now_unix = unix_now();
        let now = Instant::now();
        let mut live: Vec<(String, f64, V)> = committed
            .into_iter()
            .filter(|(_, (t0, _))| match ttl {
                Some(ttl) => now_unix < t0 + ttl.as_secs_f64(),
                None => true,
            })
            .map(|(k, (t0, v))| (k, t0, v))
            .collect();
        // Oldest first, so store insertion order matches expiry order.
        live.sort_by(|a, b| a.1.total_cmp(&b.1));

        // Compact: rewrite the mirror with only the surviving records.
        self.appender = None;
        let mut file = File::create(&self.path)?;
        for (k, t0, v) in &live {
            let mut line = serde_json::to_string(&RecordRef::Put {
                k,
                t0: *t0,
                v,
            })?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
        }
        file.flush()?;
        drop(file);

        let entries = live
            .into_iter()
            .map(|(k, t0, v)| {
                let age = Duration::from_secs_f64((now_unix - t0).max(0.0));
                let created_at = now.checked_sub(age).unwrap_or(now);
                let expires_at = ttl.map(|ttl| created_at + ttl);
                (k, CacheEntry::with_timestamps(v, created_at, expires_at))
            })
            .collect();

        Ok(LoadOutcome { entries, skipped })
    }

    fn record(&mut self, key: &str, value: &V) -> Result<(), PersistError> {
        self.append_line(&RecordRef::Put {
            k: key,
            t0: unix_now(),
            v: value,
        })
    }

    fn remove(&mut self, key: &str) -> Result<(), PersistError> {
        let rec: RecordRef<'_, V> = RecordRef::Del { k: key };
        self.append_line(&rec)
    }

    fn clear(&mut self) -> Result<(), PersistError> {
        self.appender = None;
        File::create(&self.path)?;
        Ok(())
    }
}

/// Mirrors a commit, logging and counting failures instead of surfacing them.
pub(crate) fn mirror_put<V>(
    backend: &mut Option<Box<dyn PersistBackend<V>>>,
    stats: &MemoStats,
    key: &str,
    value: &V,
) {
    if let Some(backend) = backend {
        if let Err(err) = backend.record(key, value) {
            warn!(key = %key, error = %err, "failed to mirror cache entry");
            stats.record_persist_error();
        }
    }
}

/// Mirrors a removal or eviction tombstone.
pub(crate) fn mirror_del<V>(
    backend: &mut Option<Box<dyn PersistBackend<V>>>,
    stats: &MemoStats,
    key: &str,
) {
    if let Some(backend) = backend {
        if let Err(err) = backend.remove(key) {
            warn!(key = %key, error = %err, "failed to mirror cache removal");
            stats.record_persist_error();
        }
    }
}

/// Truncates the mirror on reset.
pub(crate) fn mirror_clear<V>(backend: &mut Option<Box<dyn PersistBackend<V>>>, stats: &MemoStats) {
    if let Some(backend) = backend {
        if let Err(err) = backend.clear() {
            warn!(error = %err, "failed to truncate persistence mirror");
            stats.record_persist_error();
        }
    }
}
