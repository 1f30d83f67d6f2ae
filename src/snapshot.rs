use crate::{
    Error,
    Result,
    address::{
        Address,
        Wei,
    },
};
use std::{
    fmt,
    sync::Arc,
};
use tokio::sync::watch;

/// Number of most recent entries that split the pot.
pub const QUEUE_SIZE: usize = 100;

/// One independently polled read view of the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldGroup {
    TimeRemaining,
    Queue,
    PotValue,
    TotalEntries,
    EstimatedPayout,
    CanEndGame,
    GameEnded,
    GameActive,
}

impl FieldGroup {
    pub const ALL: [FieldGroup; 8] = [
        FieldGroup::TimeRemaining,
        FieldGroup::Queue,
        FieldGroup::PotValue,
        FieldGroup::TotalEntries,
        FieldGroup::EstimatedPayout,
        FieldGroup::CanEndGame,
        FieldGroup::GameEnded,
        FieldGroup::GameActive,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Only the countdown needs to feel live.
    pub fn is_fast(self) -> bool {
        matches!(self, FieldGroup::TimeRemaining)
    }
}

impl fmt::Display for FieldGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldGroup::TimeRemaining => "time_remaining",
            FieldGroup::Queue => "queue",
            FieldGroup::PotValue => "pot_value",
            FieldGroup::TotalEntries => "total_entries",
            FieldGroup::EstimatedPayout => "estimated_payout",
            FieldGroup::CanEndGame => "can_end_game",
            FieldGroup::GameEnded => "game_ended",
            FieldGroup::GameActive => "game_active",
        };
        write!(f, "{name}")
    }
}

/// Fixed-capacity queue of entrant addresses, oldest slot first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSlots(Vec<Address>);

impl QueueSlots {
    pub fn empty() -> Self {
        Self(vec![Address::ZERO; QUEUE_SIZE])
    }

    /// Pads with empty slots or truncates so the length is always [`QUEUE_SIZE`].
    pub fn from_slots(mut slots: Vec<Address>) -> Self {
        if slots.len() != QUEUE_SIZE {
            tracing::warn!(
                len = slots.len(),
                expected = QUEUE_SIZE,
                "queue view returned an unexpected number of slots"
            );
            slots.resize(QUEUE_SIZE, Address::ZERO);
        }
        Self(slots)
    }

    pub fn as_slice(&self) -> &[Address] {
        &self.0
    }

    pub fn occupied(&self) -> usize {
        self.0.iter().filter(|a| !a.is_zero()).count()
    }
}

impl Default for QueueSlots {
    fn default() -> Self {
        Self::empty()
    }
}

/// Merged view of every polled field.
///
/// Every field always holds a value; until the first successful read of its group
/// that value is the neutral default (zero, `false`, all-empty queue).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub time_remaining_seconds: u64,
    pub pot_value: Wei,
    pub total_entries: u64,
    pub estimated_payout_per_winner: Wei,
    pub can_end_game: bool,
    pub game_ended: bool,
    pub game_active: bool,
    pub queue: QueueSlots,
    /// Bumped on every published change.
    pub revision: u64,
}

/// Fresh value for exactly one [`FieldGroup`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldUpdate {
    TimeRemaining(u64),
    Queue(QueueSlots),
    PotValue(Wei),
    TotalEntries(u64),
    EstimatedPayout(Wei),
    CanEndGame(bool),
    GameEnded(bool),
    GameActive(bool),
}

impl FieldUpdate {
    pub fn group(&self) -> FieldGroup {
        match self {
            FieldUpdate::TimeRemaining(_) => FieldGroup::TimeRemaining,
            FieldUpdate::Queue(_) => FieldGroup::Queue,
            FieldUpdate::PotValue(_) => FieldGroup::PotValue,
            FieldUpdate::TotalEntries(_) => FieldGroup::TotalEntries,
            FieldUpdate::EstimatedPayout(_) => FieldGroup::EstimatedPayout,
            FieldUpdate::CanEndGame(_) => FieldGroup::CanEndGame,
            FieldUpdate::GameEnded(_) => FieldGroup::GameEnded,
            FieldUpdate::GameActive(_) => FieldGroup::GameActive,
        }
    }
}

impl Snapshot {
    /// Copy of `self` with one group replaced. Returns `None` when nothing changed.
    fn with_update(&self, update: FieldUpdate) -> Option<Snapshot> {
        let mut next = self.clone();
        match update {
            FieldUpdate::TimeRemaining(v) => next.time_remaining_seconds = v,
            FieldUpdate::Queue(v) => next.queue = v,
            FieldUpdate::PotValue(v) => next.pot_value = v,
            FieldUpdate::TotalEntries(v) => next.total_entries = v,
            FieldUpdate::EstimatedPayout(v) => next.estimated_payout_per_winner = v,
            FieldUpdate::CanEndGame(v) => next.can_end_game = v,
            FieldUpdate::GameEnded(v) => next.game_ended = v,
            FieldUpdate::GameActive(v) => next.game_active = v,
        }
        if next == *self {
            return None;
        }
        next.revision = self.revision.wrapping_add(1);
        Some(next)
    }
}

/// Owner of the published snapshot.
///
/// Reads are numbered per group when they are issued; a completion is only applied
/// when its number is newer than the last one applied for that group.
pub struct SnapshotStore {
    sender: watch::Sender<Arc<Snapshot>>,
    applied: [u64; FieldGroup::ALL.len()],
    issued: [u64; FieldGroup::ALL.len()],
}

impl SnapshotStore {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(Arc::new(Snapshot::default()));
        Self {
            sender,
            applied: [0; FieldGroup::ALL.len()],
            issued: [0; FieldGroup::ALL.len()],
        }
    }

    /// Sequence number for a read of `group` that is about to be issued.
    pub fn next_seq(&mut self, group: FieldGroup) -> u64 {
        let slot = &mut self.issued[group.index()];
        *slot += 1;
        *slot
    }

    /// Applies a completed read. Out-of-order completions are rejected with
    /// [`Error::StaleSnapshotRead`] and leave the snapshot untouched.
    pub fn apply(&mut self, seq: u64, update: FieldUpdate) -> Result<()> {
        let group = update.group();
        let applied = self.applied[group.index()];
        if seq <= applied {
            return Err(Error::StaleSnapshotRead {
                group,
                seq,
                applied,
            });
        }
        self.applied[group.index()] = seq;
        let current = self.sender.borrow().clone();
        if let Some(next) = current.with_update(update) {
            self.sender.send_replace(Arc::new(next));
        }
        Ok(())
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.sender.subscribe()
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}
