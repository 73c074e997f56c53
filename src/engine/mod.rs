mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::{available_times, generate_candidates, Candidates};
pub use conflict::has_conflict;
pub use error::EngineError;
pub use store::{BookingRef, LockScope, ScheduleView, Snapshot, Store, Transaction};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::model::*;
use crate::notify::Publisher;
use crate::wal::Wal;

/// Engine-level knobs. Server settings live in [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bookings can only be cancelled at least this long before the session starts.
    pub cancellation_lead_ms: Ms,
    /// How often a booking transaction re-acquires its locks after the
    /// contention set moved underneath it.
    pub contention_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cancellation_lead_ms: 2 * HOUR_MS,
            contention_retries: 3,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        batch: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        batches: Vec<Vec<Event>>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole group.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { batch, response } => {
                let mut group: Vec<PendingAppend> = vec![(batch, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { batch, response }) => group.push((batch, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                flush_group(&mut wal, group);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_group(wal: &mut Wal, group: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(group.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut append_err: Option<io::Error> = None;
    for (batch, _) in &group {
        if let Err(e) = wal.append_buffered(batch) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes don't leak
    // into the next group (callers were told this group failed).
    let flush_err = wal.flush_sync().err();
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    let result = match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    };
    for (_, tx) in group {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { batches, response } => {
            let result = Wal::write_compact_file(wal.path(), &batches)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { batch, response } => flush_group(wal, vec![(batch, response)]),
    }
}

/// The scheduling and conflict engine for one data directory.
pub struct Engine {
    pub(super) store: Arc<Store>,
    pub(super) publisher: Arc<dyn Publisher>,
    pub(super) config: EngineConfig,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its background writer.
    /// Must be called inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        publisher: Arc<dyn Publisher>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let batches = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Store::restore(&batches, wal_tx);
        info!(
            path = %wal_path.display(),
            batches = batches.len(),
            campaigns = store.campaign_count(),
            rooms = store.room_count(),
            "engine state restored"
        );

        Ok(Self {
            store: Arc::new(store),
            publisher,
            config,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
