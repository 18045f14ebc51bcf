use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::domain::{PersistedState, STATE_SCHEMA_VERSION};

/// Serialise to a temp file in the target directory, fsync, then rename
/// over the target so readers never observe a torn write.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string())
    ));
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("renaming over {}", path.display()))?;
    Ok(())
}

/// Owner of the single persistent state document.
///
/// Loaded once at startup; written after any state-mutating controller
/// action, coalesced to at most one write per tick.
#[derive(Clone)]
pub struct StateStore {
    path: PathBuf,
    days_of_history: usize,
}

impl StateStore {
    pub fn new(path: PathBuf, days_of_history: usize) -> Self {
        Self {
            path,
            days_of_history,
        }
    }

    /// Load the state document. A missing file yields empty state; a corrupt
    /// file is backed up with a timestamp suffix and replaced by empty
    /// state, with a critical log line.
    pub fn load(&self) -> Result<PersistedState> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedState::empty(Utc::now()));
            }
            Err(e) => return Err(e).context("reading state file"),
        };

        match serde_json::from_slice::<PersistedState>(&bytes) {
            Ok(state) => {
                if state.meta.schema_version > STATE_SCHEMA_VERSION {
                    warn!(
                        version = state.meta.schema_version,
                        "state file written by a newer schema; unknown fields will be preserved"
                    );
                }
                Ok(state)
            }
            Err(e) => {
                let backup = self.backup_path();
                error!(
                    error = %e,
                    backup = %backup.display(),
                    "state file is corrupt; backing it up and starting fresh"
                );
                if let Err(copy_err) = fs::copy(&self.path, &backup) {
                    error!(error = %copy_err, "failed to back up corrupt state file");
                }
                Ok(PersistedState::empty(Utc::now()))
            }
        }
    }

    /// Persist the document, truncating each output's history ring first.
    pub fn save(&self, state: &mut PersistedState) -> Result<()> {
        state.meta.written_at = Utc::now();
        state.meta.schema_version = STATE_SCHEMA_VERSION;
        for output in state.outputs.values_mut() {
            while output.days.len() > self.days_of_history {
                output.days.pop_front();
            }
        }
        let bytes = serde_json::to_vec_pretty(state).context("serialising state")?;
        write_atomic(&self.path, &bytes)?;
        // Directory entry must survive a crash too.
        if let Some(dir) = self.path.parent() {
            if let Ok(handle) = File::open(dir) {
                let _ = handle.sync_all();
            }
        }
        Ok(())
    }

    fn backup_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        self.path.with_extension(format!("corrupt.{stamp}.json"))
    }
}

/// Commands accepted by the store writer task.
pub enum StoreCommand {
    /// Replaceable: only the newest queued document reaches the disk.
    Save(Box<PersistedState>),
    /// Write this document and acknowledge once it is on disk.
    Flush(Box<PersistedState>, oneshot::Sender<Result<()>>),
}

/// Cheap handle to the store writer. The control loop queues documents here
/// and never performs disk I/O itself.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Queue a save without waiting for the write. Returns false when the
    /// writer's queue is saturated; the caller keeps its dirty flag and
    /// retries on the next tick.
    pub fn queue_save(&self, state: PersistedState) -> bool {
        self.tx.try_send(StoreCommand::Save(Box::new(state))).is_ok()
    }

    /// Write `state` and wait until it has been fsynced and renamed into
    /// place. Used for the final flush at shutdown.
    pub async fn flush(&self, state: PersistedState) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Flush(Box::new(state), ack))
            .await
            .map_err(|_| anyhow!("store writer stopped"))?;
        rx.await.map_err(|_| anyhow!("store writer dropped the flush"))?
    }
}

/// Start the single-writer task that owns the state file. Serialisation,
/// fsync and rename all happen on the blocking pool; queued saves are
/// coalesced so a burst of ticks costs one write.
pub fn spawn_writer(store: StateStore) -> StoreHandle {
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(writer_loop(store, rx));
    StoreHandle { tx }
}

async fn writer_loop(store: StateStore, mut rx: mpsc::Receiver<StoreCommand>) {
    while let Some(first) = rx.recv().await {
        let mut acks = Vec::new();
        let mut doc = match first {
            StoreCommand::Save(doc) => doc,
            StoreCommand::Flush(doc, ack) => {
                acks.push(ack);
                doc
            }
        };
        // Coalesce everything already queued; the newest document wins but
        // every flush still gets its acknowledgement.
        while let Ok(command) = rx.try_recv() {
            match command {
                StoreCommand::Save(d) => doc = d,
                StoreCommand::Flush(d, ack) => {
                    doc = d;
                    acks.push(ack);
                }
            }
        }

        let writer = store.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut state = *doc;
            writer.save(&mut state)
        })
        .await
        .unwrap_or_else(|e| Err(anyhow!("store writer task panicked: {e}")));

        match &result {
            Ok(()) => debug!("state document written"),
            Err(e) => error!(error = %e, "state store write failed"),
        }
        for ack in acks {
            let _ = ack.send(result.as_ref().map(|_| ()).map_err(|e| anyhow!("{e}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OutputState, RelayState};
    use chrono::NaiveDate;

    fn store_in(dir: &Path) -> StateStore {
        StateStore::new(dir.join("state.json"), 3)
    }

    #[test]
    fn missing_file_yields_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = store_in(dir.path()).load().unwrap();
        assert!(state.outputs.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let mut state = PersistedState::empty(Utc::now());
        let mut output = OutputState::new(today);
        output.relay = RelayState::On;
        output.on_seconds_today = 4321;
        output.shortfall_hours = 1.5;
        state.outputs.insert("Pump".to_string(), output);

        store.save(&mut state).unwrap();
        let loaded = store.load().unwrap();

        let pump = &loaded.outputs["Pump"];
        assert_eq!(pump.relay, RelayState::On);
        assert_eq!(pump.on_seconds_today, 4321);
        assert_eq!(pump.shortfall_hours, 1.5);
    }

    #[test]
    fn corrupt_file_is_backed_up_and_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        fs::write(dir.path().join("state.json"), b"{not json").unwrap();

        let state = store.load().unwrap();
        assert!(state.outputs.is_empty());

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("corrupt"))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn history_ring_is_truncated_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let mut state = PersistedState::empty(Utc::now());
        let mut output = OutputState::new(NaiveDate::from_ymd_opt(2024, 6, 10).unwrap());
        for day in 1..=7 {
            output.days.push_back(crate::domain::DayRecord {
                date: NaiveDate::from_ymd_opt(2024, 6, day).unwrap(),
                on_seconds: 3600,
                energy_wh: 1000.0,
                cost_cents: 30.0,
            });
        }
        state.outputs.insert("Pump".to_string(), output);
        store.save(&mut state).unwrap();

        let loaded = store.load().unwrap();
        let days = &loaded.outputs["Pump"].days;
        assert_eq!(days.len(), 3);
        // Oldest entries rolled off the front.
        assert_eq!(days[0].date, NaiveDate::from_ymd_opt(2024, 6, 5).unwrap());
    }

    #[tokio::test]
    async fn writer_flush_lands_the_latest_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let handle = spawn_writer(store.clone());

        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let doc = |seconds: u64| {
            let mut state = PersistedState::empty(Utc::now());
            let mut output = OutputState::new(today);
            output.on_seconds_today = seconds;
            state.outputs.insert("Pump".to_string(), output);
            state
        };

        // Queued saves may be coalesced away; the flushed document must be
        // what the file ends up holding.
        handle.queue_save(doc(100));
        handle.queue_save(doc(200));
        handle.flush(doc(300)).await.unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.outputs["Pump"].on_seconds_today, 300);
    }

    #[tokio::test]
    async fn writer_reports_failed_flush() {
        // Point the store at a path whose parent cannot exist.
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("missing-dir").join("state.json");
        let handle = spawn_writer(StateStore::new(bogus, 3));

        let state = PersistedState::empty(Utc::now());
        assert!(handle.flush(state).await.is_err());
    }

    #[test]
    fn unknown_fields_survive_a_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let doc = serde_json::json!({
            "meta": {"schema_version": 1, "written_at": "2024-06-01T00:00:00Z"},
            "outputs": {},
            "futureSection": {"key": 7}
        });
        fs::write(dir.path().join("state.json"), doc.to_string()).unwrap();

        let mut state = store.load().unwrap();
        store.save(&mut state).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join("state.json")).unwrap()).unwrap();
        assert_eq!(raw["futureSection"]["key"], 7);
    }
}
