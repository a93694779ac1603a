mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{free_slots, merge_overlapping, subtract_intervals};
pub(crate) use conflict::{now_ms, validate_details, validate_span, validate_window};
pub use error::EngineError;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedLocationState = Arc<RwLock<LocationState>>;

/// Which bookings take part in conflict checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Pending and approved bookings both hold their interval.
    #[default]
    PendingBlocks,
    /// Only approved bookings hold their interval; overlapping requests may
    /// queue up and are settled when an admin approves one of them.
    ApprovedOnly,
}

impl ConflictPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictPolicy::PendingBlocks => "pending-blocks",
            ConflictPolicy::ApprovedOnly => "approved-only",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "pending-blocks" | "pending" => Ok(ConflictPolicy::PendingBlocks),
            "approved-only" | "approved" => Ok(ConflictPolicy::ApprovedOnly),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

/// Admin decision on a pending booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Approve,
    Reject { reason: Option<String> },
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub conflict_policy: ConflictPolicy,
    /// Upper bound on waiting for a location's write lock.
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::default(),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        response: oneshot::Sender<io::Result<usize>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, events = batch.len(), "WAL flush failed");
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes don't leak
    // into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { response } => {
            let _ = response.send(compact_in_place(wal));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Rewrite the log as one `BookingRestored` per booking. Runs on the writer
/// task, so no append can slip in between reading and swapping the file.
fn compact_in_place(wal: &mut Wal) -> io::Result<usize> {
    let events = Wal::replay(wal.path())?;
    let snapshot = snapshot_events(rebuild(&events).0);
    Wal::write_compact_file(wal.path(), &snapshot)?;
    wal.swap_compact_file()?;
    Ok(snapshot.len())
}

/// Fold an event log into per-location state plus the booking → location index.
fn rebuild(events: &[Event]) -> (HashMap<Ulid, LocationState>, HashMap<Ulid, Ulid>) {
    let mut locations: HashMap<Ulid, LocationState> = HashMap::new();
    let mut index = HashMap::new();
    for event in events {
        let location_id = event.location_id();
        let ls = locations
            .entry(location_id)
            .or_insert_with(|| LocationState::new(location_id));
        if apply_to_location(ls, event) {
            index.insert(event.booking_id(), location_id);
        }
    }
    (locations, index)
}

fn snapshot_events(locations: HashMap<Ulid, LocationState>) -> Vec<Event> {
    let mut bookings: Vec<Booking> = locations.into_values().flat_map(|ls| ls.bookings).collect();
    bookings.sort_by_key(|b| b.id);
    bookings
        .into_iter()
        .map(|booking| Event::BookingRestored { booking })
        .collect()
}

/// Apply an event to a LocationState (no locking, caller holds the lock).
/// Returns whether the event referred to a known or newly inserted booking.
fn apply_to_location(ls: &mut LocationState, event: &Event) -> bool {
    match event {
        Event::BookingRequested {
            id,
            location_id,
            created_by,
            span,
            purpose,
            attendees,
            contact,
            created_at,
        } => {
            ls.insert_booking(Booking {
                id: *id,
                location_id: *location_id,
                created_by: *created_by,
                span: *span,
                purpose: purpose.clone(),
                attendees: *attendees,
                contact: contact.clone(),
                status: BookingStatus::Pending,
                created_at: *created_at,
                resolved_by: None,
                resolved_at: None,
                rejection_reason: None,
                cancelled_by: None,
                cancelled_at: None,
            });
            true
        }
        Event::BookingRestored { booking } => {
            if let Some(pos) = ls.bookings.iter().position(|b| b.id == booking.id) {
                ls.bookings.remove(pos);
            }
            ls.insert_booking(booking.clone());
            true
        }
        Event::BookingApproved { id, actor_id, at, .. } => {
            let Some(b) = ls.get_mut(id) else { return false };
            b.status = BookingStatus::Approved;
            b.resolved_by = Some(*actor_id);
            b.resolved_at = Some(*at);
            true
        }
        Event::BookingRejected {
            id,
            actor_id,
            at,
            reason,
            ..
        } => {
            let Some(b) = ls.get_mut(id) else { return false };
            b.status = BookingStatus::Rejected;
            b.resolved_by = Some(*actor_id);
            b.resolved_at = Some(*at);
            b.rejection_reason = reason.clone();
            true
        }
        Event::BookingCancelled { id, actor_id, at, .. } => {
            let Some(b) = ls.get_mut(id) else { return false };
            b.status = BookingStatus::Cancelled;
            b.cancelled_by = Some(*actor_id);
            b.cancelled_at = Some(*at);
            true
        }
    }
}

/// Write event to WAL via the background group-commit writer.
async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::WalError(e.to_string()))
}

/// The booking store: per-location state behind its own lock, durably
/// logged through a group-commit WAL.
pub struct Engine {
    pub state: DashMap<Ulid, SharedLocationState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → location id
    pub(super) booking_to_location: Arc<DashMap<Ulid, Ulid>>,
    pub(super) config: EngineConfig,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the writer task. Must be
    /// called inside a tokio runtime.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let (locations, index) = rebuild(&events);
        let bookings: usize = locations.values().map(|ls| ls.bookings.len()).sum();
        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            locations = locations.len(),
            bookings,
            policy = %config.conflict_policy,
            "booking store loaded"
        );

        Ok(Self {
            state: locations
                .into_iter()
                .map(|(id, ls)| (id, Arc::new(RwLock::new(ls))))
                .collect(),
            wal_tx,
            notify,
            booking_to_location: Arc::new(index.into_iter().collect()),
            config,
        })
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.config.conflict_policy
    }

    pub fn get_location(&self, id: &Ulid) -> Option<SharedLocationState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_location_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_location.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append, apply and notify, then return the booking as it now
    /// stands. Runs on its own task that owns the write guard: the lock is
    /// released only once memory matches the log, even if the caller stops
    /// waiting.
    pub(super) async fn commit(
        &self,
        location_id: Ulid,
        mut guard: OwnedRwLockWriteGuard<LocationState>,
        event: Event,
    ) -> Result<Booking, EngineError> {
        let wal_tx = self.wal_tx.clone();
        let index = self.booking_to_location.clone();
        let notify = self.notify.clone();
        let booking_id = event.booking_id();

        let task = tokio::spawn(async move {
            if let Err(e) = wal_append(&wal_tx, &event).await {
                if matches!(event, Event::BookingRequested { .. }) {
                    index.remove(&booking_id);
                }
                return Err(e);
            }
            if apply_to_location(&mut guard, &event) {
                index.insert(booking_id, location_id);
            }
            notify.send(location_id, &event);
            guard
                .get(&booking_id)
                .cloned()
                .ok_or(EngineError::NotFound("booking", booking_id))
        });
        task.await
            .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
    }

    /// Acquire a location's write lock, creating its state on first use.
    pub(super) async fn lock_location(
        &self,
        location_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<LocationState>, EngineError> {
        let rs = self
            .state
            .entry(location_id)
            .or_insert_with(|| Arc::new(RwLock::new(LocationState::new(location_id))))
            .value()
            .clone();
        self.acquire_write(location_id, rs).await
    }

    /// Lookup booking → location and acquire that location's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<LocationState>), EngineError> {
        let location_id = self
            .get_location_for_booking(booking_id)
            .ok_or(EngineError::NotFound("booking", *booking_id))?;
        let rs = self
            .get_location(&location_id)
            .ok_or(EngineError::NotFound("booking", *booking_id))?;
        let guard = self.acquire_write(location_id, rs).await?;
        Ok((location_id, guard))
    }

    async fn acquire_write(
        &self,
        location_id: Ulid,
        rs: SharedLocationState,
    ) -> Result<OwnedRwLockWriteGuard<LocationState>, EngineError> {
        match tokio::time::timeout(self.config.lock_timeout, rs.write_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                tracing::warn!(
                    %location_id,
                    timeout_ms = self.config.lock_timeout.as_millis() as u64,
                    "timed out waiting for location lock"
                );
                Err(EngineError::Busy(location_id))
            }
        }
    }
}
