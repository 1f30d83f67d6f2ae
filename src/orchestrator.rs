use crate::{
    Error,
    Result,
    abi,
    address::{
        Address,
        TxHash,
        Wei,
    },
    config::ConfirmationConfig,
    error::RelayStatus,
    gateway::LedgerGateway,
    relay::{
        CallPayload,
        SponsorshipRelay,
    },
};
use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
};
use tokio::{
    sync::watch,
    task::JoinHandle,
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

/// Write actions the game accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
    SendEntry,
    EndGame,
    BatchPayout,
}

impl ActionKind {
    pub const ALL: [ActionKind; 3] = [
        ActionKind::SendEntry,
        ActionKind::EndGame,
        ActionKind::BatchPayout,
    ];

    pub fn signature(self) -> &'static str {
        match self {
            ActionKind::SendEntry => abi::SEND_ONE,
            ActionKind::EndGame => abi::END_GAME,
            ActionKind::BatchPayout => abi::BATCH_PAYOUT,
        }
    }

    /// Only entries carry value.
    pub fn value(self, entry_fee: Wei) -> Wei {
        match self {
            ActionKind::SendEntry => entry_fee,
            ActionKind::EndGame | ActionKind::BatchPayout => 0,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::SendEntry => "send-entry",
            ActionKind::EndGame => "end-game",
            ActionKind::BatchPayout => "batch-payout",
        };
        write!(f, "{name}")
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ActionKind::ALL
            .into_iter()
            .find(|kind| kind.to_string() == s)
            .ok_or_else(|| {
                format!("unknown action {s:?}; expected send-entry, end-game or batch-payout")
            })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionStatus {
    Idle,
    Submitting,
    AwaitingConfirmation { tx_hash: TxHash },
    Confirmed { tx_hash: TxHash, block_number: u64 },
    Failed(Error),
    /// Watching stopped after the relay accepted the action. The action itself may
    /// still land on the ledger.
    Abandoned { tx_hash: TxHash },
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Confirmed { .. }
                | ActionStatus::Failed(_)
                | ActionStatus::Abandoned { .. }
        )
    }
}

/// Shared view of one action request. Every clone observes the same request.
#[derive(Clone)]
pub struct ActionHandle {
    id: u64,
    kind: ActionKind,
    status: watch::Receiver<ActionStatus>,
    stop: Arc<watch::Sender<bool>>,
}

impl PartialEq for ActionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ActionHandle {}

impl fmt::Debug for ActionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl ActionHandle {
    pub fn status(&self) -> ActionStatus {
        self.status.borrow().clone()
    }

    pub fn updates(&self) -> watch::Receiver<ActionStatus> {
        self.status.clone()
    }

    /// Resolves once the request reaches a terminal status.
    pub async fn wait(&self) -> ActionStatus {
        let mut status = self.status.clone();
        let waited = status
            .wait_for(ActionStatus::is_terminal)
            .await
            .map(|terminal| terminal.clone());
        match waited {
            Ok(terminal) => terminal,
            Err(_) => status.borrow().clone(),
        }
    }

    /// Stops watching this request.
    ///
    /// A request whose relay call has not started fails as [`Error::Cancelled`] and
    /// nothing is sent. Once the relay has the payload its answer is still awaited and
    /// the kind stays occupied: acceptance ends as [`ActionStatus::Abandoned`] with the
    /// ledger action left to run its course, a rejection ends as `Failed`.
    pub fn stop_watching(&self) {
        self.stop.send_replace(true);
    }
}

/// Runs write actions through the sponsorship relay, at most one per [`ActionKind`].
///
/// Failures are never retried; the caller decides whether to submit again.
pub struct TxOrchestrator<G, R> {
    inner: Arc<Inner<G, R>>,
}

struct Inner<G, R> {
    gateway: Arc<G>,
    relay: Arc<R>,
    contract: Address,
    /// Account the relay submits on behalf of.
    sender: Option<Address>,
    entry_fee: Wei,
    confirmation: ConfirmationConfig,
    in_flight: Mutex<HashMap<ActionKind, ActionHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<G: LedgerGateway, R: SponsorshipRelay> TxOrchestrator<G, R> {
    pub fn new(
        gateway: Arc<G>,
        relay: Arc<R>,
        contract: Address,
        sender: Option<Address>,
        entry_fee: Wei,
        confirmation: ConfirmationConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                gateway,
                relay,
                contract,
                sender,
                entry_fee,
                confirmation,
                in_flight: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Starts a request of `kind`, or returns the one already running.
    ///
    /// Must be called inside a tokio runtime.
    pub fn submit(&self, kind: ActionKind) -> ActionHandle {
        let mut in_flight = lock(&self.inner.in_flight);
        if let Some(existing) = in_flight.get(&kind) {
            debug!(%kind, id = existing.id, "request already in flight; joining it");
            return existing.clone();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (status_tx, status_rx) = watch::channel(ActionStatus::Submitting);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = ActionHandle {
            id,
            kind,
            status: status_rx,
            stop: Arc::new(stop_tx),
        };
        in_flight.insert(kind, handle.clone());
        drop(in_flight);

        info!(%kind, id, "submitting action");
        let task = tokio::spawn(self.inner.clone().drive(id, kind, status_tx, stop_rx));
        let mut tasks = lock(&self.inner.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
        handle
    }

    /// `Idle` when no request of `kind` is in flight.
    pub fn status(&self, kind: ActionKind) -> ActionStatus {
        lock(&self.inner.in_flight)
            .get(&kind)
            .map(ActionHandle::status)
            .unwrap_or(ActionStatus::Idle)
    }

    /// Stops watching every in-flight request and waits for their tasks to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<ActionHandle> =
            lock(&self.inner.in_flight).values().cloned().collect();
        for handle in &handles {
            handle.stop_watching();
        }
        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        for result in futures::future::join_all(tasks).await {
            if let Err(err) = result {
                warn!(?err, "action task ended abnormally");
            }
        }
    }
}

impl<G: LedgerGateway, R: SponsorshipRelay> Inner<G, R> {
    fn payload(&self, kind: ActionKind) -> CallPayload {
        CallPayload {
            from: self.sender,
            to: self.contract,
            data: abi::encode_call(kind.signature()),
            value: kind.value(self.entry_fee),
        }
    }

    async fn drive(
        self: Arc<Self>,
        id: u64,
        kind: ActionKind,
        status: watch::Sender<ActionStatus>,
        stop: watch::Receiver<bool>,
    ) {
        let outcome = self.run(kind, &status, stop).await;
        let terminal = outcome.unwrap_or_else(ActionStatus::Failed);
        match &terminal {
            ActionStatus::Confirmed {
                tx_hash,
                block_number,
            } => info!(%kind, id, %tx_hash, block_number, "action confirmed"),
            ActionStatus::Failed(error) => warn!(%kind, id, %error, "action failed"),
            ActionStatus::Abandoned { tx_hash } => {
                info!(%kind, id, %tx_hash, "stopped watching accepted action")
            }
            _ => {}
        }

        // free the slot before announcing the outcome so a waiter can resubmit at once
        {
            let mut in_flight = lock(&self.in_flight);
            if in_flight.get(&kind).is_some_and(|handle| handle.id == id) {
                in_flight.remove(&kind);
            }
        }
        status.send_replace(terminal);
    }

    async fn run(
        &self,
        kind: ActionKind,
        status: &watch::Sender<ActionStatus>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<ActionStatus> {
        if *stop.borrow() {
            return Err(Error::Cancelled);
        }
        let payload = self.payload(kind);
        // the relay call runs to completion even if watching stops meanwhile
        let relay_timeout = self.confirmation.relay_timeout();
        let acceptance = time::timeout(relay_timeout, self.relay.forward(&payload))
            .await
            .unwrap_or_else(|_| {
                Err(Error::RelayRejection {
                    status: RelayStatus::Unreachable,
                    detail: format!("relay did not answer within {relay_timeout:?}"),
                })
            })?;
        let tx_hash = acceptance.tx_hash;
        debug!(%kind, %tx_hash, "relay accepted action");
        if *stop.borrow() {
            return Ok(ActionStatus::Abandoned { tx_hash });
        }
        status.send_replace(ActionStatus::AwaitingConfirmation { tx_hash });

        let timeout = self.confirmation.timeout();
        tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => Ok(ActionStatus::Abandoned { tx_hash }),
            finality = time::timeout(timeout, self.await_finality(tx_hash)) => match finality {
                Ok(Ok(block_number)) => Ok(ActionStatus::Confirmed {
                    tx_hash,
                    block_number,
                }),
                Ok(Err(error)) => Err(error),
                Err(_) => Err(Error::ConfirmationTimeout(timeout)),
            },
        }
    }

    /// Polls until the receipt has enough confirmations. Read failures are retried on
    /// the next poll; a reverted receipt ends the wait.
    async fn await_finality(&self, tx_hash: TxHash) -> Result<u64> {
        let confirmations = self.confirmation.confirmations.max(1);
        let mut ticker = time::interval(self.confirmation.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let receipt = match self.gateway.receipt(tx_hash).await {
                Ok(Some(receipt)) => receipt,
                Ok(None) => continue,
                Err(error) => {
                    warn!(%tx_hash, %error, "receipt lookup failed");
                    continue;
                }
            };
            if !receipt.succeeded {
                return Err(Error::LedgerRevert {
                    reason: format!(
                        "transaction {tx_hash} reverted in block {}",
                        receipt.block_number
                    ),
                });
            }
            if confirmations == 1 {
                return Ok(receipt.block_number);
            }
            match self.gateway.block_number().await {
                Ok(head) if head.saturating_sub(receipt.block_number) + 1 >= confirmations => {
                    return Ok(receipt.block_number);
                }
                Ok(head) => {
                    debug!(%tx_hash, head, included = receipt.block_number, "waiting for confirmations")
                }
                Err(error) => warn!(%tx_hash, %error, "block number lookup failed"),
            }
        }
    }
}

/// Resolves when a stop is requested. Never resolves once every handle is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        test_helpers::{
            ACCEPTED_TX_HASH,
            FakeLedgerGateway,
            FakeSponsorshipRelay,
        },
    };
    use std::time::Duration;

    const CONTRACT: Address = Address::new([0x42; 20]);
    const ENTRY_FEE: Wei = 1_000_000_000_000_000;

    fn orchestrator(
        gateway: &Arc<FakeLedgerGateway>,
        relay: &Arc<FakeSponsorshipRelay>,
        confirmation: ConfirmationConfig,
    ) -> TxOrchestrator<FakeLedgerGateway, FakeSponsorshipRelay> {
        TxOrchestrator::new(
            gateway.clone(),
            relay.clone(),
            CONTRACT,
            None,
            ENTRY_FEE,
            confirmation,
        )
    }

    fn confirmation() -> ConfirmationConfig {
        ConfirmationConfig {
            poll_interval_ms: 1_000,
            confirmations: 1,
            timeout_secs: 60,
            relay_timeout_secs: 30,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn submit__duplicate_requests_share_one_handle_and_one_relay_call() {
        // given
        let gateway = Arc::new(FakeLedgerGateway::new());
        let relay = Arc::new(FakeSponsorshipRelay::new());
        relay.hold();
        gateway.include(ACCEPTED_TX_HASH, 7, true);
        let sut = orchestrator(&gateway, &relay, confirmation());

        // when
        let first = sut.submit(ActionKind::SendEntry);
        tokio::task::yield_now().await;
        let second = sut.submit(ActionKind::SendEntry);
        assert_eq!(sut.status(ActionKind::SendEntry), ActionStatus::Submitting);
        relay.release();
        let terminal = first.wait().await;

        // then
        assert_eq!(first, second);
        assert_eq!(relay.calls().len(), 1);
        assert_eq!(
            terminal,
            ActionStatus::Confirmed {
                tx_hash: ACCEPTED_TX_HASH,
                block_number: 7,
            }
        );
        assert_eq!(second.status(), terminal);
        assert_eq!(sut.status(ActionKind::SendEntry), ActionStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn submit__different_kinds_run_independently() {
        // given
        let gateway = Arc::new(FakeLedgerGateway::new());
        let relay = Arc::new(FakeSponsorshipRelay::new());
        relay.hold();
        let sut = orchestrator(&gateway, &relay, confirmation());

        // when
        let entry = sut.submit(ActionKind::SendEntry);
        let end = sut.submit(ActionKind::EndGame);
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        // then
        assert_ne!(entry, end);
        assert_eq!(relay.calls().len(), 2);
        relay.release();
        sut.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn submit__builds_payload_per_kind() {
        // given
        let gateway = Arc::new(FakeLedgerGateway::new());
        let relay = Arc::new(FakeSponsorshipRelay::new());
        gateway.include(ACCEPTED_TX_HASH, 1, true);
        let sender = Address::new([0x05; 20]);
        let sut = TxOrchestrator::new(
            gateway.clone(),
            relay.clone(),
            CONTRACT,
            Some(sender),
            ENTRY_FEE,
            confirmation(),
        );

        // when
        sut.submit(ActionKind::SendEntry).wait().await;
        sut.submit(ActionKind::BatchPayout).wait().await;

        // then
        let calls = relay.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].to, CONTRACT);
        assert_eq!(calls[0].from, Some(sender));
        assert_eq!(calls[0].value, ENTRY_FEE);
        assert_eq!(calls[0].data, abi::encode_call(abi::SEND_ONE));
        assert_eq!(calls[1].value, 0);
        assert_eq!(calls[1].data, abi::encode_call(abi::BATCH_PAYOUT));
    }

    #[tokio::test(start_paused = true)]
    async fn submit__relay_rejection_fails_then_allows_fresh_request() {
        // given
        let gateway = Arc::new(FakeLedgerGateway::new());
        let rejection = Error::RelayRejection {
            status: RelayStatus::Http(429),
            detail: "Paymaster request failed: quota exceeded".to_string(),
        };
        let relay = Arc::new(FakeSponsorshipRelay::rejecting(rejection.clone()));
        let sut = orchestrator(&gateway, &relay, confirmation());

        // when
        let first = sut.submit(ActionKind::EndGame);
        let terminal = first.wait().await;

        // then
        assert_eq!(terminal, ActionStatus::Failed(rejection));
        assert_eq!(sut.status(ActionKind::EndGame), ActionStatus::Idle);
        assert_eq!(relay.calls().len(), 1);

        let second = sut.submit(ActionKind::EndGame);
        assert_ne!(first, second);
        second.wait().await;
        assert_eq!(relay.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn submit__reverted_receipt_fails_with_ledger_revert() {
        // given
        let gateway = Arc::new(FakeLedgerGateway::new());
        let relay = Arc::new(FakeSponsorshipRelay::new());
        gateway.include(ACCEPTED_TX_HASH, 12, false);
        let sut = orchestrator(&gateway, &relay, confirmation());

        // when
        let terminal = sut.submit(ActionKind::SendEntry).wait().await;

        // then
        assert!(matches!(
            terminal,
            ActionStatus::Failed(Error::LedgerRevert { .. })
        ));
        assert_eq!(sut.status(ActionKind::SendEntry), ActionStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn submit__waits_for_required_confirmations() {
        // given
        let gateway = Arc::new(FakeLedgerGateway::new());
        let relay = Arc::new(FakeSponsorshipRelay::new());
        let sut = orchestrator(
            &gateway,
            &relay,
            ConfirmationConfig {
                confirmations: 3,
                ..confirmation()
            },
        );
        gateway.include(ACCEPTED_TX_HASH, 10, true);
        gateway.set_block_number(11);

        // when
        let handle = sut.submit(ActionKind::SendEntry);
        time::sleep(Duration::from_secs(5)).await;

        // then
        assert_eq!(
            handle.status(),
            ActionStatus::AwaitingConfirmation {
                tx_hash: ACCEPTED_TX_HASH
            }
        );
        gateway.set_block_number(12);
        assert_eq!(
            handle.wait().await,
            ActionStatus::Confirmed {
                tx_hash: ACCEPTED_TX_HASH,
                block_number: 10,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn submit__no_finality_within_timeout_fails() {
        // given
        let gateway = Arc::new(FakeLedgerGateway::new());
        let relay = Arc::new(FakeSponsorshipRelay::new());
        let sut = orchestrator(
            &gateway,
            &relay,
            ConfirmationConfig {
                timeout_secs: 10,
                ..confirmation()
            },
        );

        // when
        let terminal = sut.submit(ActionKind::BatchPayout).wait().await;

        // then
        assert_eq!(
            terminal,
            ActionStatus::Failed(Error::ConfirmationTimeout(Duration::from_secs(10)))
        );
        assert!(gateway.receipt_reads() >= 10);
        assert_eq!(relay.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_watching__before_relay_call_cancels_without_sending() {
        // given
        let gateway = Arc::new(FakeLedgerGateway::new());
        let relay = Arc::new(FakeSponsorshipRelay::new());
        let sut = orchestrator(&gateway, &relay, confirmation());

        // when
        let handle = sut.submit(ActionKind::SendEntry);
        handle.stop_watching();
        let terminal = handle.wait().await;

        // then
        assert_eq!(terminal, ActionStatus::Failed(Error::Cancelled));
        assert!(relay.calls().is_empty());
        assert_eq!(sut.status(ActionKind::SendEntry), ActionStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_watching__during_relay_call_keeps_kind_occupied_until_relay_answers() {
        // given
        let gateway = Arc::new(FakeLedgerGateway::new());
        let relay = Arc::new(FakeSponsorshipRelay::new());
        relay.hold();
        let sut = orchestrator(&gateway, &relay, confirmation());
        let first = sut.submit(ActionKind::SendEntry);
        tokio::task::yield_now().await;

        // when
        first.stop_watching();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        let second = sut.submit(ActionKind::SendEntry);

        // then
        assert_eq!(first, second);
        assert_eq!(first.status(), ActionStatus::Submitting);
        assert_eq!(relay.calls().len(), 1);

        relay.release();
        assert_eq!(
            first.wait().await,
            ActionStatus::Abandoned {
                tx_hash: ACCEPTED_TX_HASH
            }
        );
        assert_eq!(relay.calls().len(), 1);
        assert_eq!(sut.status(ActionKind::SendEntry), ActionStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_watching__during_relay_call_still_reports_rejection() {
        // given
        let gateway = Arc::new(FakeLedgerGateway::new());
        let rejection = Error::RelayRejection {
            status: RelayStatus::Http(400),
            detail: "Paymaster request failed".to_string(),
        };
        let relay = Arc::new(FakeSponsorshipRelay::rejecting(rejection.clone()));
        relay.hold();
        let sut = orchestrator(&gateway, &relay, confirmation());
        let handle = sut.submit(ActionKind::EndGame);
        tokio::task::yield_now().await;

        // when
        handle.stop_watching();
        relay.release();
        let terminal = handle.wait().await;

        // then
        assert_eq!(terminal, ActionStatus::Failed(rejection));
        assert_eq!(relay.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn submit__silent_relay_fails_as_unreachable_after_relay_timeout() {
        // given
        let gateway = Arc::new(FakeLedgerGateway::new());
        let relay = Arc::new(FakeSponsorshipRelay::new());
        relay.hold();
        let sut = orchestrator(
            &gateway,
            &relay,
            ConfirmationConfig {
                relay_timeout_secs: 5,
                ..confirmation()
            },
        );
        let started = time::Instant::now();

        // when
        let terminal = sut.submit(ActionKind::SendEntry).wait().await;

        // then
        assert!(matches!(
            terminal,
            ActionStatus::Failed(Error::RelayRejection {
                status: RelayStatus::Unreachable,
                ..
            })
        ));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(relay.calls().len(), 1);
        assert_eq!(sut.status(ActionKind::SendEntry), ActionStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_watching__after_acceptance_abandons_without_new_submission() {
        // given
        let gateway = Arc::new(FakeLedgerGateway::new());
        let relay = Arc::new(FakeSponsorshipRelay::new());
        let sut = orchestrator(&gateway, &relay, confirmation());
        let handle = sut.submit(ActionKind::EndGame);
        time::sleep(Duration::from_secs(3)).await;
        assert!(matches!(
            handle.status(),
            ActionStatus::AwaitingConfirmation { .. }
        ));

        // when
        handle.stop_watching();
        let terminal = handle.wait().await;

        // then
        assert_eq!(
            terminal,
            ActionStatus::Abandoned {
                tx_hash: ACCEPTED_TX_HASH
            }
        );
        assert_eq!(relay.calls().len(), 1);
        assert_eq!(sut.status(ActionKind::EndGame), ActionStatus::Idle);
    }

    #[test]
    fn action_kind__parses_cli_names() {
        for kind in ActionKind::ALL {
            assert_eq!(kind.to_string().parse::<ActionKind>(), Ok(kind));
        }
        assert!("sendOne".parse::<ActionKind>().is_err());
    }
}
