use clap::{
    Parser,
    Subcommand,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use send_one::{
    ClientContext,
    address::Address,
    config::{
        ClientConfig,
        DEFAULT_RELAY_URL,
        DEFAULT_RPC_URL,
    },
    derived::GameView,
    orchestrator::{
        ActionKind,
        ActionStatus,
    },
    server::{
        AccountAssociation,
        CollaboratorServer,
        DEFAULT_PUBLIC_URL,
        ServerConfig,
        default_manifest,
        load_manifest,
    },
};
use std::{
    path::{
        Path,
        PathBuf,
    },
    sync::OnceLock,
};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
};
use url::Url;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON config file; flags and environment variables override its values.
    #[arg(short, long, env = "SEND_ONE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "SEND_ONE_RPC_URL")]
    rpc_url: Option<Url>,

    #[arg(long, env = "SEND_ONE_CONTRACT")]
    contract: Option<Address>,

    #[arg(long, env = "SEND_ONE_RELAY_URL")]
    relay_url: Option<Url>,

    /// Account to highlight in the queue and to submit actions for.
    #[arg(long, env = "SEND_ONE_VIEWER")]
    viewer: Option<Address>,

    /// Write daily rolling log files here instead of stderr.
    #[arg(long, env = "SEND_ONE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the game and log the derived view whenever it changes.
    Watch,
    /// Submit one action and wait for it to finish.
    Submit {
        /// send-entry, end-game or batch-payout
        action: ActionKind,
    },
    /// Serve the webhook, paymaster proxy and manifest routes.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long, env = "PORT")]
        port: Option<u16>,

        #[arg(long, env = "CDP_PAYMASTER_URL")]
        paymaster_url: Option<Url>,

        /// Serve this manifest file instead of one built from the public URL.
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// URL the app is published under.
        #[arg(long, env = "NEXT_PUBLIC_URL", default_value = DEFAULT_PUBLIC_URL)]
        public_url: Url,

        #[arg(long, env = "FARCASTER_HEADER", default_value = "")]
        association_header: String,

        #[arg(long, env = "FARCASTER_PAYLOAD", default_value = "")]
        association_payload: String,

        #[arg(long, env = "FARCASTER_SIGNATURE", default_value = "")]
        association_signature: String,
    },
}

fn init_tracing(log_dir: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            let appender = rolling::daily(dir, "send-one.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = LOG_GUARD.set(guard);
            let _ = fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init();
        }
        None => {
            let _ = fmt().with_env_filter(filter).try_init();
        }
    }
}

fn resolve_config(args: &Args) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .wrap_err_with(|| format!("loading config from {}", path.display()))?,
        None => {
            let contract = args
                .contract
                .ok_or_else(|| eyre!("Specify --contract or provide a --config file"))?;
            ClientConfig::new(
                Url::parse(DEFAULT_RPC_URL)?,
                contract,
                Url::parse(DEFAULT_RELAY_URL)?,
            )
        }
    };
    if let Some(rpc_url) = &args.rpc_url {
        config.rpc_url = rpc_url.clone();
    }
    if let Some(contract) = args.contract {
        config.contract = contract;
    }
    if let Some(relay_url) = &args.relay_url {
        config.relay_url = relay_url.clone();
    }
    if args.viewer.is_some() {
        config.viewer = args.viewer;
    }
    config.validate()?;
    Ok(config)
}

fn log_view(view: &GameView) {
    tracing::info!(
        state = ?view.state,
        countdown = %view.countdown,
        pot_eth = %view.pot_eth,
        pot_usd = %view.pot_usd,
        payout_eth = %view.payout_eth,
        entries = view.total_entries,
        queued = view.queue.len(),
        viewer_in_queue = view.viewer_in_queue,
        end_game = view.show_end_game,
        "{}",
        view.banner()
    );
}

async fn watch(config: ClientConfig) -> Result<()> {
    let context = ClientContext::connect(config)?;
    let mut snapshots = context.subscribe();
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                log_view(&context.view_of(&snapshot));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    context.shutdown().await;
    Ok(())
}

async fn submit(config: ClientConfig, action: ActionKind) -> Result<()> {
    let context = ClientContext::connect(config)?;
    let handle = context.submit(action);
    let mut updates = handle.updates();
    let terminal = loop {
        let status = updates.borrow_and_update().clone();
        tracing::info!(%action, ?status, "action status");
        if status.is_terminal() {
            break status;
        }
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break handle.status();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                handle.stop_watching();
                break handle.wait().await;
            }
        }
    };
    context.shutdown().await;
    match terminal {
        ActionStatus::Confirmed { tx_hash, .. } => {
            println!("{action} confirmed: {tx_hash}");
            Ok(())
        }
        ActionStatus::Abandoned { tx_hash } => {
            println!("stopped watching {action}: {tx_hash}");
            Ok(())
        }
        ActionStatus::Failed(error) => Err(eyre!(error).wrap_err(format!("{action} failed"))),
        other => Err(eyre!("{action} ended in unexpected state {other:?}")),
    }
}

async fn serve(server_config: ServerConfig) -> Result<()> {
    let mut server = CollaboratorServer::new(server_config)?;
    println!("listening on {}", server.base_url());
    loop {
        tokio::select! {
            event = server.next_event() => match event {
                Some(event) => tracing::info!(
                    kind = ?event.kind,
                    fid = ?event.fid,
                    received_at = %event.received_at,
                    "lifecycle event"
                ),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    init_tracing(args.log_dir.as_deref());
    tracing::info!("starting send-one client");

    match &args.command {
        Command::Watch => watch(resolve_config(&args)?).await,
        Command::Submit { action } => submit(resolve_config(&args)?, *action).await,
        Command::Serve {
            host,
            port,
            paymaster_url,
            manifest,
            public_url,
            association_header,
            association_payload,
            association_signature,
        } => {
            let manifest = match manifest {
                Some(path) => load_manifest(path)?,
                None => default_manifest(
                    public_url,
                    &AccountAssociation {
                        header: association_header.clone(),
                        payload: association_payload.clone(),
                        signature: association_signature.clone(),
                    },
                ),
            };
            serve(ServerConfig {
                host: host.clone(),
                port: *port,
                paymaster_url: paymaster_url.clone(),
                manifest: Some(manifest),
                ..ServerConfig::default()
            })
            .await
        }
    }
}
