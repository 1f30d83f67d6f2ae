use crate::{
    Error,
    config::{
        ClientConfig,
        ConfigError,
    },
    derived::GameView,
    error::ReadError,
    gateway::{
        LedgerGateway,
        rpc_gateway::RpcLedgerGateway,
    },
    orchestrator::{
        ActionHandle,
        ActionKind,
        ActionStatus,
        TxOrchestrator,
    },
    poller::{
        ObservabilitySink,
        PollerHandle,
        SnapshotPoller,
        TracingSink,
    },
    relay::{
        SponsorshipRelay,
        http_relay::HttpSponsorshipRelay,
    },
    snapshot::Snapshot,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to set up ledger gateway: {0}")]
    Gateway(#[from] ReadError),
    #[error("failed to set up sponsorship relay: {0}")]
    Relay(#[from] Error),
}

/// Owns everything one client session needs: the polled snapshot and the action
/// orchestrator, both wired to the same gateway.
pub struct ClientContext<G, R> {
    config: ClientConfig,
    poller: PollerHandle,
    orchestrator: TxOrchestrator<G, R>,
}

impl ClientContext<RpcLedgerGateway, HttpSponsorshipRelay> {
    /// Validates `config`, connects to the ledger and relay and starts polling.
    pub fn connect(config: ClientConfig) -> Result<Self, ContextError> {
        config.validate()?;
        let gateway = Arc::new(RpcLedgerGateway::new(
            config.rpc_url.clone(),
            config.contract,
        )?);
        let relay = Arc::new(HttpSponsorshipRelay::new(
            config.relay_url.clone(),
            config.confirmation.relay_timeout(),
        )?);
        Ok(Self::start(config, gateway, relay, Arc::new(TracingSink)))
    }
}

impl<G: LedgerGateway, R: SponsorshipRelay> ClientContext<G, R> {
    /// Must be called inside a tokio runtime.
    pub fn start(
        config: ClientConfig,
        gateway: Arc<G>,
        relay: Arc<R>,
        sink: Arc<dyn ObservabilitySink>,
    ) -> Self {
        let poller = SnapshotPoller::new(gateway.clone(), config.polling.clone())
            .with_sink(sink)
            .spawn();
        let orchestrator = TxOrchestrator::new(
            gateway,
            relay,
            config.contract,
            config.viewer,
            config.entry_fee_wei,
            config.confirmation.clone(),
        );
        Self {
            config,
            poller,
            orchestrator,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.poller.subscribe()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.poller.current()
    }

    /// Presentation model for the current snapshot.
    pub fn view(&self) -> GameView {
        self.view_of(&self.poller.current())
    }

    pub fn view_of(&self, snapshot: &Snapshot) -> GameView {
        GameView::derive(
            snapshot,
            self.config.viewer.as_ref(),
            self.config.eth_usd_price,
        )
    }

    pub fn submit(&self, kind: ActionKind) -> ActionHandle {
        self.orchestrator.submit(kind)
    }

    pub fn action_status(&self, kind: ActionKind) -> ActionStatus {
        self.orchestrator.status(kind)
    }

    /// Stops polling and watching. Accepted ledger actions are not touched.
    pub async fn shutdown(self) {
        self.orchestrator.shutdown().await;
        self.poller.shutdown().await;
    }
}
