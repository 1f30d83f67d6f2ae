use crate::{
    Error,
    Result,
    address::{
        Address,
        TxHash,
        Wei,
    },
    error::ReadError,
    gateway::{
        LedgerGateway,
        ReadResult,
        Receipt,
    },
    poller::ObservabilitySink,
    relay::{
        Acceptance,
        CallPayload,
        SponsorshipRelay,
    },
    snapshot::FieldGroup,
};
use actix_web::{
    App,
    HttpResponse,
    HttpServer,
    dev::ServerHandle,
    http::StatusCode,
    web,
};
use serde_json::{
    Value,
    json,
};
use std::{
    collections::{
        HashMap,
        HashSet,
        VecDeque,
    },
    sync::{
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
    net::TcpListener,
    thread::JoinHandle,
    time::Duration,
};
use tokio::sync::Semaphore;
use url::Url;

pub const ACCEPTED_TX_HASH: TxHash = TxHash::new([0x11; 32]);

const RELEASED_PERMITS: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct FakeLedger {
    time_remaining: u64,
    time_script: VecDeque<(Duration, u64)>,
    queue: Vec<Address>,
    pot_value: Wei,
    total_entries: u64,
    estimated_payout: Wei,
    can_end_game: bool,
    game_ended: bool,
    game_active: bool,
    failing: HashSet<FieldGroup>,
    reads: HashMap<FieldGroup, usize>,
    receipts: HashMap<TxHash, Receipt>,
    receipt_reads: usize,
    block_number: u64,
}

/// In-memory ledger whose answers, delays and failures are set by the test.
#[derive(Default)]
pub struct FakeLedgerGateway {
    state: Mutex<FakeLedger>,
}

impl FakeLedgerGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_time_remaining(&self, seconds: u64) {
        lock(&self.state).time_remaining = seconds;
    }

    /// Answers for the next time-remaining reads, each after its delay. Once the script
    /// runs out reads fall back to [`Self::set_time_remaining`].
    pub fn script_time_remaining(&self, script: Vec<(Duration, u64)>) {
        lock(&self.state).time_script = script.into();
    }

    pub fn set_queue(&self, queue: Vec<Address>) {
        lock(&self.state).queue = queue;
    }

    pub fn set_pot_value(&self, wei: Wei) {
        lock(&self.state).pot_value = wei;
    }

    pub fn set_total_entries(&self, entries: u64) {
        lock(&self.state).total_entries = entries;
    }

    pub fn set_estimated_payout(&self, wei: Wei) {
        lock(&self.state).estimated_payout = wei;
    }

    pub fn set_can_end_game(&self, value: bool) {
        lock(&self.state).can_end_game = value;
    }

    pub fn set_game_ended(&self, value: bool) {
        lock(&self.state).game_ended = value;
    }

    pub fn set_game_active(&self, value: bool) {
        lock(&self.state).game_active = value;
    }

    pub fn fail_group(&self, group: FieldGroup, failing: bool) {
        let mut state = lock(&self.state);
        if failing {
            state.failing.insert(group);
        } else {
            state.failing.remove(&group);
        }
    }

    pub fn reads(&self, group: FieldGroup) -> usize {
        lock(&self.state).reads.get(&group).copied().unwrap_or(0)
    }

    /// Includes `tx_hash` in `block` and moves the head there if it was behind.
    pub fn include(&self, tx_hash: TxHash, block: u64, succeeded: bool) {
        let mut state = lock(&self.state);
        state.receipts.insert(
            tx_hash,
            Receipt {
                tx_hash,
                block_number: block,
                succeeded,
            },
        );
        state.block_number = state.block_number.max(block);
    }

    pub fn set_block_number(&self, block: u64) {
        lock(&self.state).block_number = block;
    }

    pub fn receipt_reads(&self) -> usize {
        lock(&self.state).receipt_reads
    }

    fn read<T>(
        &self,
        group: FieldGroup,
        pick: impl FnOnce(&mut FakeLedger) -> T,
    ) -> ReadResult<T> {
        let mut state = lock(&self.state);
        *state.reads.entry(group).or_default() += 1;
        if state.failing.contains(&group) {
            return Err(ReadError::Transport(format!("{group} unavailable")));
        }
        Ok(pick(&mut state))
    }
}

impl LedgerGateway for FakeLedgerGateway {
    async fn time_remaining(&self) -> ReadResult<u64> {
        let (delay, seconds) = self.read(FieldGroup::TimeRemaining, |s| {
            let fallback = s.time_remaining;
            s.time_script.pop_front().unwrap_or((Duration::ZERO, fallback))
        })?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(seconds)
    }

    async fn queue(&self) -> ReadResult<Vec<Address>> {
        self.read(FieldGroup::Queue, |s| s.queue.clone())
    }

    async fn pot_value(&self) -> ReadResult<Wei> {
        self.read(FieldGroup::PotValue, |s| s.pot_value)
    }

    async fn total_entries(&self) -> ReadResult<u64> {
        self.read(FieldGroup::TotalEntries, |s| s.total_entries)
    }

    async fn estimated_payout(&self) -> ReadResult<Wei> {
        self.read(FieldGroup::EstimatedPayout, |s| s.estimated_payout)
    }

    async fn can_end_game(&self) -> ReadResult<bool> {
        self.read(FieldGroup::CanEndGame, |s| s.can_end_game)
    }

    async fn game_ended(&self) -> ReadResult<bool> {
        self.read(FieldGroup::GameEnded, |s| s.game_ended)
    }

    async fn game_active(&self) -> ReadResult<bool> {
        self.read(FieldGroup::GameActive, |s| s.game_active)
    }

    async fn receipt(&self, tx_hash: TxHash) -> ReadResult<Option<Receipt>> {
        let mut state = lock(&self.state);
        state.receipt_reads += 1;
        Ok(state.receipts.get(&tx_hash).cloned())
    }

    async fn block_number(&self) -> ReadResult<u64> {
        Ok(lock(&self.state).block_number)
    }
}

/// Relay that records every payload and answers with a fixed response.
///
/// [`Self::hold`] makes calls wait until [`Self::release`] lets them through.
pub struct FakeSponsorshipRelay {
    response: Mutex<Result<Acceptance>>,
    calls: Mutex<Vec<CallPayload>>,
    held: AtomicBool,
    gate: Semaphore,
}

impl Default for FakeSponsorshipRelay {
    fn default() -> Self {
        Self {
            response: Mutex::new(Ok(Acceptance {
                tx_hash: ACCEPTED_TX_HASH,
            })),
            calls: Mutex::new(Vec::new()),
            held: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }
}

impl FakeSponsorshipRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(error: Error) -> Self {
        let relay = Self::default();
        relay.respond_with(Err(error));
        relay
    }

    pub fn respond_with(&self, response: Result<Acceptance>) {
        *lock(&self.response) = response;
    }

    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.gate.add_permits(RELEASED_PERMITS);
    }

    pub fn calls(&self) -> Vec<CallPayload> {
        lock(&self.calls).clone()
    }
}

impl SponsorshipRelay for FakeSponsorshipRelay {
    async fn forward(&self, payload: &CallPayload) -> Result<Acceptance> {
        lock(&self.calls).push(payload.clone());
        if self.held.load(Ordering::SeqCst)
            && let Ok(permit) = self.gate.acquire().await
        {
            permit.forget();
        }
        lock(&self.response).clone()
    }
}

/// Sink that keeps everything it is told for later assertions.
#[derive(Default)]
pub struct RecordingSink {
    failed: Mutex<Vec<Error>>,
    stale: Mutex<Vec<Error>>,
}

impl RecordingSink {
    pub fn failed_groups(&self) -> Vec<FieldGroup> {
        lock(&self.failed)
            .iter()
            .filter_map(|err| match err {
                Error::TransientReadFailure { group, .. } => Some(*group),
                _ => None,
            })
            .collect()
    }

    pub fn stale_count(&self) -> usize {
        lock(&self.stale).len()
    }
}

impl ObservabilitySink for RecordingSink {
    fn read_failed(&self, error: &Error) {
        lock(&self.failed).push(error.clone());
    }

    fn stale_discarded(&self, error: &Error) {
        lock(&self.stale).push(error.clone());
    }
}

#[derive(Default)]
struct StubAnswers {
    requests: Mutex<Vec<Value>>,
    by_method: Mutex<HashMap<String, (u16, Value)>>,
    fallback: Mutex<Option<(u16, Value)>>,
}

/// Local HTTP endpoint with canned JSON answers, for exercising the real clients.
///
/// A request whose body has a JSON-RPC `method` gets the answer set for that method;
/// anything else gets the answer from [`Self::respond`]. Stops when dropped.
pub struct StubHttpEndpoint {
    url: Url,
    answers: web::Data<StubAnswers>,
    server_handle: ServerHandle,
    server_thread: Option<JoinHandle<()>>,
}

impl StubHttpEndpoint {
    pub fn start() -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let url = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
        let answers = web::Data::new(StubAnswers::default());
        let app_answers = answers.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(app_answers.clone())
                .default_service(web::to(answer_stub_request))
        })
        .workers(1)
        .shutdown_timeout(1)
        .listen(listener)
        .unwrap()
        .run();
        let server_handle = server.handle();
        let server_thread = std::thread::spawn(move || {
            let _ = actix_web::rt::System::new().block_on(server);
        });
        Self {
            url,
            answers,
            server_handle,
            server_thread: Some(server_thread),
        }
    }

    pub fn url(&self) -> Url {
        self.url.clone()
    }

    pub fn respond(&self, status: u16, body: Value) {
        *lock(&self.answers.fallback) = Some((status, body));
    }

    /// Answers JSON-RPC `method` with `result`.
    pub fn respond_to(&self, method: &str, result: Value) {
        lock(&self.answers.by_method).insert(
            method.to_string(),
            (200, json!({ "jsonrpc": "2.0", "id": 1, "result": result })),
        );
    }

    /// Answers JSON-RPC `method` with an error object.
    pub fn fail(&self, method: &str, code: i64, message: &str) {
        lock(&self.answers.by_method).insert(
            method.to_string(),
            (
                200,
                json!({ "jsonrpc": "2.0", "id": 1, "error": { "code": code, "message": message } }),
            ),
        );
    }

    pub fn requests(&self) -> Vec<Value> {
        lock(&self.answers.requests).clone()
    }
}

impl Drop for StubHttpEndpoint {
    fn drop(&mut self) {
        let _ = self.server_handle.stop(true);
        if let Some(thread) = self.server_thread.take() {
            let _ = thread.join();
        }
    }
}

async fn answer_stub_request(answers: web::Data<StubAnswers>, body: web::Bytes) -> HttpResponse {
    let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let by_method = request
        .get("method")
        .and_then(Value::as_str)
        .and_then(|method| lock(&answers.by_method).get(method).cloned());
    lock(&answers.requests).push(request);
    let (status, body) = by_method
        .or_else(|| lock(&answers.fallback).clone())
        .unwrap_or((404, json!({ "error": "no answer configured" })));
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(body)
}

/// URL on which nothing listens.
pub fn closed_port_url() -> Url {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);
    Url::parse(&format!("http://{address}/")).unwrap()
}
