//! Local state cache for restart resilience.
//!
//! Keeps a JSON snapshot of run id, baselines, quarantine set and the ingest
//! API key on disk. Writes are atomic (temp file + rename, owner-only mode);
//! a background flusher coalesces dirty state, and critical changes force an
//! immediate flush.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use cordon_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCHEMA_VERSION: u32 = 1;
const CACHE_FILE: &str = "state.json";

/// Persisted snapshot. A schema version mismatch on load discards the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheSnapshot {
    #[serde(rename = "_schema_version")]
    pub schema_version: u32,
    pub run_id: Option<String>,
    pub api_key: Option<String>,
    /// Serialized baseline profiles keyed by agent id.
    pub baselines: BTreeMap<String, serde_json::Value>,
    pub quarantine: BTreeSet<String>,
}

impl Default for CacheSnapshot {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            run_id: None,
            api_key: None,
            baselines: BTreeMap::new(),
            quarantine: BTreeSet::new(),
        }
    }
}

/// Atomic JSON file cache with coalesced flushing.
#[derive(Debug)]
pub struct CacheManager {
    dir: PathBuf,
    state: Mutex<CacheSnapshot>,
    dirty: AtomicBool,
    /// False when the directory proved unwritable; the run continues in
    /// degraded in-memory mode.
    writable: AtomicBool,
}

impl CacheManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            state: Mutex::new(CacheSnapshot::default()),
            dirty: AtomicBool::new(false),
            writable: AtomicBool::new(true),
        }
    }

    fn path(&self) -> PathBuf {
        self.dir.join(CACHE_FILE)
    }

    /// Load the snapshot from disk. Missing, corrupt or version-mismatched
    /// files yield the empty default.
    pub fn load(&self) -> CacheSnapshot {
        let path = self.path();
        let loaded = match Self::read_snapshot(&path) {
            Ok(Some(snapshot)) => {
                info!(
                    path = %path.display(),
                    run_id = snapshot.run_id.as_deref().unwrap_or("-"),
                    baselines = snapshot.baselines.len(),
                    "cache loaded"
                );
                snapshot
            }
            Ok(None) => {
                info!(path = %path.display(), "no cache file, starting fresh");
                CacheSnapshot::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding cache");
                CacheSnapshot::default()
            }
        };
        let mut state = self.state.lock().expect("cache poisoned");
        *state = loaded.clone();
        loaded
    }

    fn read_snapshot(path: &Path) -> Result<Option<CacheSnapshot>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        let snapshot: CacheSnapshot = serde_json::from_str(&raw)
            .map_err(|e| Error::CacheCorrupt(format!("invalid snapshot: {e}")))?;
        if snapshot.schema_version != SCHEMA_VERSION {
            return Err(Error::CacheCorrupt(format!(
                "schema version {} != {}",
                snapshot.schema_version, SCHEMA_VERSION
            )));
        }
        Ok(Some(snapshot))
    }

    /// Atomic write: temp file in the same directory, then rename.
    pub fn save(&self) -> Result<()> {
        let serialized = {
            let state = self.state.lock().expect("cache poisoned");
            serde_json::to_string_pretty(&*state)?
        };
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path();
        let tmp = self.dir.join(format!("{CACHE_FILE}.{}.tmp", std::process::id()));
        std::fs::write(&tmp, serialized)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        self.dirty.store(false, Ordering::SeqCst);
        debug!(path = %path.display(), "cache flushed");
        Ok(())
    }

    /// Flush immediately if there are unsaved changes.
    pub fn save_if_dirty(&self) {
        if !self.dirty.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.save() {
            if self.writable.swap(false, Ordering::SeqCst) {
                warn!(error = %e, "cache flush failed, continuing in-memory");
            }
        }
    }

    /// Force a flush regardless of the coalescing interval. Used for
    /// critical changes: quarantine membership, first-ready baselines,
    /// run id generation.
    pub fn flush_now(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.save_if_dirty();
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    // ---- run id ----

    /// Persisted run id, generating one if absent.
    pub fn run_id(&self) -> String {
        let generated = {
            let mut state = self.state.lock().expect("cache poisoned");
            match &state.run_id {
                Some(id) => return id.clone(),
                None => {
                    let id = format!("run-{}", &Uuid::new_v4().simple().to_string()[..12]);
                    state.run_id = Some(id.clone());
                    self.mark_dirty();
                    id
                }
            }
        };
        self.flush_now();
        generated
    }

    pub fn put_run_id(&self, run_id: impl Into<String>) {
        let mut state = self.state.lock().expect("cache poisoned");
        state.run_id = Some(run_id.into());
        self.mark_dirty();
    }

    // ---- API key ----

    /// Ingest API key. Precedence: explicit value, cached value, then
    /// auto-generated and persisted.
    pub fn api_key(&self, explicit: Option<&str>) -> String {
        if let Some(key) = explicit {
            return key.to_string();
        }
        let generated = {
            let mut state = self.state.lock().expect("cache poisoned");
            match &state.api_key {
                Some(key) => return key.clone(),
                None => {
                    let key = format!("cdn-{}", Uuid::new_v4().simple());
                    state.api_key = Some(key.clone());
                    self.mark_dirty();
                    key
                }
            }
        };
        self.flush_now();
        generated
    }

    pub fn put_api_key(&self, key: impl Into<String>) {
        let mut state = self.state.lock().expect("cache poisoned");
        state.api_key = Some(key.into());
        self.mark_dirty();
    }

    // ---- baselines ----

    pub fn put_baseline(&self, agent_id: &str, profile: serde_json::Value) {
        let mut state = self.state.lock().expect("cache poisoned");
        state.baselines.insert(agent_id.to_string(), profile);
        self.mark_dirty();
    }

    pub fn baseline(&self, agent_id: &str) -> Option<serde_json::Value> {
        let state = self.state.lock().expect("cache poisoned");
        state.baselines.get(agent_id).cloned()
    }

    pub fn remove_baseline(&self, agent_id: &str) {
        let mut state = self.state.lock().expect("cache poisoned");
        if state.baselines.remove(agent_id).is_some() {
            self.mark_dirty();
        }
    }

    pub fn baselines(&self) -> BTreeMap<String, serde_json::Value> {
        let state = self.state.lock().expect("cache poisoned");
        state.baselines.clone()
    }

    // ---- quarantine ----

    pub fn put_quarantine(&self, agents: &BTreeSet<String>) {
        {
            let mut state = self.state.lock().expect("cache poisoned");
            state.quarantine = agents.clone();
            self.mark_dirty();
        }
        self.flush_now();
    }

    pub fn quarantine(&self) -> BTreeSet<String> {
        let state = self.state.lock().expect("cache poisoned");
        state.quarantine.clone()
    }

    /// Background flusher: coalesces dirty state at `interval`. Runs until
    /// the returned future is dropped or the shutdown signal fires.
    pub async fn run_flusher(
        self: std::sync::Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.save_if_dirty(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.save_if_dirty();
                        return;
                    }
                }
            }
        }
    }
}
