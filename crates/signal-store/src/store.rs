use heed::types::*;
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::error::{Result, StoreError};

/// Signals older than this are swept on the next write.
///
/// Expiry works in whole seconds: `created_at` is truncated, so a signal
/// can stay claimable for up to a second past its TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

const SIGNALS_DB: &str = "signals";
const META_DB: &str = "meta";
const NEXT_ID_KEY: &str = "next_id";

/// A signal as submitted by a sender, before the store assigns identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSignal {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
}

impl NewSignal {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        kind: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind: kind.into(),
            data: data.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.from.is_empty() {
            return Err(StoreError::Invalid("from must not be empty"));
        }
        if self.to.is_empty() {
            return Err(StoreError::Invalid("to must not be empty"));
        }
        if self.kind.is_empty() {
            return Err(StoreError::Invalid("type must not be empty"));
        }
        Ok(())
    }
}

/// A stored signal. Immutable: it is deleted, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub id: u64,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
    /// Unix seconds
    #[serde(rename = "createdAt")]
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    pub ttl: Duration,
    pub map_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            map_size: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub pending: u64,
    pub oldest_created_at: Option<u64>,
}

#[derive(Clone, Copy)]
struct Tables {
    /// big-endian id → JSON-encoded Signal, so iteration order is FIFO
    signals: Database<Bytes, Bytes>,
    meta: Database<Str, Bytes>,
}

/// Durable mailbox keyed by room.
pub struct SignalStore {
    env: Env,
    tables: OnceLock<Tables>,
    ttl: Duration,
    /// Woken on every successful post so waiting pollers re-check.
    posted: Notify,
}

impl SignalStore {
    /// Open or create a store at the given directory with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(options.map_size)
                .max_dbs(2)
                .open(path.as_ref())?
        };

        Ok(Self {
            env,
            tables: OnceLock::new(),
            ttl: options.ttl,
            posted: Notify::new(),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Append a signal. Expired signals of every room are swept in the same
    /// transaction.
    pub fn post(&self, signal: NewSignal) -> Result<Signal> {
        signal.validate()?;

        let stored = self.with_tables(|tables| self.append_in(tables, &signal, unix_now()))?;
        self.posted.notify_waiters();

        debug!(
            "Stored signal {} ({}) from {} to {}",
            stored.id, stored.kind, stored.from, stored.to
        );
        Ok(stored)
    }

    /// Claim the oldest live signal for `to` that was not sent by `from`,
    /// without waiting.
    pub fn try_claim(&self, to: &str, from: &str) -> Result<Option<Signal>> {
        self.with_tables(|tables| self.claim_in(tables, to, from, unix_now()))
    }

    /// Claim the oldest live signal for `to` not sent by `from`, waiting up
    /// to `timeout` for one to be posted. Storage failures are logged and
    /// reported as no signal.
    pub async fn poll(&self, to: &str, from: &str, timeout: Duration) -> Option<Signal> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking so a post between the check
            // and the wait is not missed.
            let posted = self.posted.notified();
            tokio::pin!(posted);
            posted.as_mut().enable();

            match self.try_claim(to, from) {
                Ok(Some(signal)) => {
                    debug!("Delivered signal {} to {} in {}", signal.id, from, to);
                    return Some(signal);
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Poll for {} in {} failed: {}", from, to, e);
                    return None;
                }
            }

            if tokio::time::timeout_at(deadline, posted).await.is_err() {
                return None;
            }
        }
    }

    /// Delete every expired signal now. Returns the number removed.
    pub fn sweep(&self) -> Result<usize> {
        self.with_tables(|tables| {
            let mut wtxn = self.env.write_txn()?;
            let removed = self.sweep_in(tables, &mut wtxn, unix_now())?;
            wtxn.commit()?;
            Ok(removed)
        })
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.with_tables(|tables| {
            let rtxn = self.env.read_txn()?;
            let pending = tables.signals.len(&rtxn)?;
            let oldest_created_at = match tables.signals.first(&rtxn)? {
                Some((_, value)) => Some(serde_json::from_slice::<Signal>(value)?.created_at),
                None => None,
            };
            Ok(StoreStats {
                pending,
                oldest_created_at,
            })
        })
    }

    /// Run `op` against the tables, creating them and retrying once if
    /// they do not exist yet.
    fn with_tables<T>(&self, op: impl Fn(Tables) -> Result<T>) -> Result<T> {
        match self.tables().and_then(&op) {
            Err(StoreError::NotInitialized) => {
                warn!("Signal table missing, creating it");
                let tables = self.initialize()?;
                op(tables)
            }
            other => other,
        }
    }

    fn tables(&self) -> Result<Tables> {
        if let Some(tables) = self.tables.get() {
            return Ok(*tables);
        }

        let rtxn = self.env.read_txn()?;
        let signals = self.env.open_database::<Bytes, Bytes>(&rtxn, Some(SIGNALS_DB))?;
        let meta = self.env.open_database::<Str, Bytes>(&rtxn, Some(META_DB))?;
        // Handles opened in an aborted txn are closed, so commit.
        rtxn.commit()?;

        match (signals, meta) {
            (Some(signals), Some(meta)) => {
                let tables = Tables { signals, meta };
                let _ = self.tables.set(tables);
                Ok(tables)
            }
            _ => Err(StoreError::NotInitialized),
        }
    }

    fn initialize(&self) -> Result<Tables> {
        let mut wtxn = self.env.write_txn()?;
        let signals = self
            .env
            .create_database::<Bytes, Bytes>(&mut wtxn, Some(SIGNALS_DB))?;
        let meta = self.env.create_database::<Str, Bytes>(&mut wtxn, Some(META_DB))?;
        wtxn.commit()?;

        let tables = Tables { signals, meta };
        let _ = self.tables.set(tables);
        Ok(tables)
    }

    fn append_in(&self, tables: Tables, signal: &NewSignal, now: u64) -> Result<Signal> {
        let mut wtxn = self.env.write_txn()?;

        let id = match tables.meta.get(&wtxn, NEXT_ID_KEY)? {
            Some(bytes) => decode_id(bytes)?,
            None => 1,
        };
        tables
            .meta
            .put(&mut wtxn, NEXT_ID_KEY, &(id + 1).to_be_bytes()[..])?;

        let removed = self.sweep_in(tables, &mut wtxn, now)?;
        if removed > 0 {
            debug!("Swept {} expired signals", removed);
        }

        let stored = Signal {
            id,
            from: signal.from.clone(),
            to: signal.to.clone(),
            kind: signal.kind.clone(),
            data: signal.data.clone(),
            created_at: now,
        };
        let value = serde_json::to_vec(&stored)?;
        tables
            .signals
            .put(&mut wtxn, &id.to_be_bytes()[..], &value[..])?;

        wtxn.commit()?;
        Ok(stored)
    }

    /// The write transaction is LMDB's single writer, so two claimers can
    /// never both observe and delete the same row.
    fn claim_in(&self, tables: Tables, to: &str, from: &str, now: u64) -> Result<Option<Signal>> {
        let mut wtxn = self.env.write_txn()?;

        let mut expired = Vec::new();
        let mut claimed = None;
        for item in tables.signals.iter(&wtxn)? {
            let (key, value) = item?;
            let signal: Signal = serde_json::from_slice(value)?;
            if self.is_expired(&signal, now) {
                expired.push(key.to_vec());
                continue;
            }
            if signal.to == to && signal.from != from {
                claimed = Some((key.to_vec(), signal));
                break;
            }
        }

        if expired.is_empty() && claimed.is_none() {
            wtxn.abort();
            return Ok(None);
        }

        for key in &expired {
            tables.signals.delete(&mut wtxn, key.as_slice())?;
        }
        if let Some((key, _)) = &claimed {
            tables.signals.delete(&mut wtxn, key.as_slice())?;
        }
        wtxn.commit()?;

        Ok(claimed.map(|(_, signal)| signal))
    }

    fn sweep_in(&self, tables: Tables, wtxn: &mut heed::RwTxn, now: u64) -> Result<usize> {
        let mut expired = Vec::new();
        for item in tables.signals.iter(wtxn)? {
            let (key, value) = item?;
            let signal: Signal = serde_json::from_slice(value)?;
            if self.is_expired(&signal, now) {
                expired.push(key.to_vec());
            }
        }

        for key in &expired {
            tables.signals.delete(wtxn, key.as_slice())?;
        }
        Ok(expired.len())
    }

    fn is_expired(&self, signal: &Signal, now: u64) -> bool {
        signal.created_at < now.saturating_sub(self.ttl.as_secs())
    }
}

fn decode_id(bytes: &[u8]) -> Result<u64> {
    <[u8; 8]>::try_from(bytes)
        .map(u64::from_be_bytes)
        .map_err(|_| StoreError::Corrupt(format!("next id has {} bytes", bytes.len())))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
