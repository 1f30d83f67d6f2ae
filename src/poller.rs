use crate::{
    Error,
    config::PollingConfig,
    error::ReadError,
    gateway::{
        LedgerGateway,
        ReadResult,
    },
    snapshot::{
        FieldGroup,
        FieldUpdate,
        QueueSlots,
        Snapshot,
        SnapshotStore,
    },
};
use std::{
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::watch,
    task::{
        JoinHandle,
        JoinSet,
    },
    time::{
        self,
        MissedTickBehavior,
    },
};
use tracing::{
    debug,
    info,
    warn,
};

/// Reads of one group allowed to be outstanding at once; ticks beyond this are skipped.
const MAX_READS_IN_FLIGHT: usize = 4;

/// Where read-path problems are reported. Nothing reported here reaches the UI.
pub trait ObservabilitySink: Send + Sync + 'static {
    fn read_failed(&self, error: &Error);

    fn stale_discarded(&self, error: &Error);
}

/// Default sink: structured log lines.
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn read_failed(&self, error: &Error) {
        warn!(%error, "snapshot read failed; keeping previous value");
    }

    fn stale_discarded(&self, error: &Error) {
        debug!(%error, "discarding out-of-order read");
    }
}

pub struct SnapshotPoller<G> {
    gateway: Arc<G>,
    polling: PollingConfig,
    sink: Arc<dyn ObservabilitySink>,
}

/// Running poller. Dropping it aborts the loops; [`PollerHandle::shutdown`] stops them
/// and waits for them to finish.
pub struct PollerHandle {
    store: Arc<Mutex<SnapshotStore>>,
    receiver: watch::Receiver<Arc<Snapshot>>,
    shutdown: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

struct GroupLoop<G> {
    group: FieldGroup,
    interval: Duration,
    read_timeout: Duration,
    gateway: Arc<G>,
    store: Arc<Mutex<SnapshotStore>>,
    sink: Arc<dyn ObservabilitySink>,
    shutdown: watch::Receiver<bool>,
}

fn lock(store: &Mutex<SnapshotStore>) -> MutexGuard<'_, SnapshotStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<G: LedgerGateway> SnapshotPoller<G> {
    pub fn new(gateway: Arc<G>, polling: PollingConfig) -> Self {
        Self {
            gateway,
            polling,
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Starts one loop per field group. Must be called inside a tokio runtime.
    pub fn spawn(self) -> PollerHandle {
        let store = SnapshotStore::new();
        let receiver = store.subscribe();
        let store = Arc::new(Mutex::new(store));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let loops = FieldGroup::ALL
            .iter()
            .map(|group| {
                let group_loop = GroupLoop {
                    group: *group,
                    interval: self.polling.interval(*group),
                    read_timeout: self.polling.read_timeout(),
                    gateway: self.gateway.clone(),
                    store: store.clone(),
                    sink: self.sink.clone(),
                    shutdown: shutdown_rx.clone(),
                };
                tokio::spawn(group_loop.run())
            })
            .collect();
        info!(
            groups = FieldGroup::ALL.len(),
            fast_ms = self.polling.fast_interval_ms,
            slow_ms = self.polling.slow_interval_ms,
            "snapshot poller started"
        );

        PollerHandle {
            store,
            receiver,
            shutdown,
            loops,
        }
    }
}

impl PollerHandle {
    /// Change notifications; every received value is a complete snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.receiver.clone()
    }

    pub fn current(&self) -> Arc<Snapshot> {
        lock(&self.store).current()
    }

    /// Stops issuing reads, drops outstanding ones and waits for every loop to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        let loops = std::mem::take(&mut self.loops);
        for result in futures::future::join_all(loops).await {
            if let Err(err) = result {
                warn!(?err, "poll loop ended abnormally");
            }
        }
        info!("snapshot poller stopped");
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        for handle in &self.loops {
            handle.abort();
        }
    }
}

impl<G: LedgerGateway> GroupLoop<G> {
    async fn run(mut self) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: JoinSet<(u64, ReadResult<FieldUpdate>)> = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if in_flight.len() >= MAX_READS_IN_FLIGHT {
                        debug!(group = %self.group, "skipping tick; reads still outstanding");
                        continue;
                    }
                    let seq = lock(&self.store).next_seq(self.group);
                    let gateway = self.gateway.clone();
                    let group = self.group;
                    let read_timeout = self.read_timeout;
                    in_flight.spawn(async move {
                        let result = time::timeout(read_timeout, read_group(&*gateway, group))
                            .await
                            .unwrap_or(Err(ReadError::Timeout(read_timeout)));
                        (seq, result)
                    });
                }
                Some(joined) = in_flight.join_next() => {
                    match joined {
                        Ok((seq, result)) => self.complete(seq, result),
                        Err(err) if err.is_cancelled() => {}
                        Err(err) => warn!(group = %self.group, ?err, "read task panicked"),
                    }
                }
                _ = self.shutdown.changed() => break,
            }
        }
        in_flight.abort_all();
        debug!(group = %self.group, "poll loop exited");
    }

    fn complete(&self, seq: u64, result: ReadResult<FieldUpdate>) {
        match result {
            Ok(update) => {
                let applied = lock(&self.store).apply(seq, update);
                if let Err(err) = applied {
                    self.sink.stale_discarded(&err);
                }
            }
            Err(source) => {
                self.sink.read_failed(&Error::TransientReadFailure {
                    group: self.group,
                    source,
                });
            }
        }
    }
}

async fn read_group<G: LedgerGateway>(
    gateway: &G,
    group: FieldGroup,
) -> ReadResult<FieldUpdate> {
    let update = match group {
        FieldGroup::TimeRemaining => FieldUpdate::TimeRemaining(gateway.time_remaining().await?),
        FieldGroup::Queue => FieldUpdate::Queue(QueueSlots::from_slots(gateway.queue().await?)),
        FieldGroup::PotValue => FieldUpdate::PotValue(gateway.pot_value().await?),
        FieldGroup::TotalEntries => FieldUpdate::TotalEntries(gateway.total_entries().await?),
        FieldGroup::EstimatedPayout => {
            FieldUpdate::EstimatedPayout(gateway.estimated_payout().await?)
        }
        FieldGroup::CanEndGame => FieldUpdate::CanEndGame(gateway.can_end_game().await?),
        FieldGroup::GameEnded => FieldUpdate::GameEnded(gateway.game_ended().await?),
        FieldGroup::GameActive => FieldUpdate::GameActive(gateway.game_active().await?),
    };
    Ok(update)
}
