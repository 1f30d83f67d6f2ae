use actix_web::{
    App,
    HttpResponse,
    HttpServer,
    dev::ServerHandle,
    http::StatusCode,
    web,
};
use chrono::{
    DateTime,
    Utc,
};
use serde_json::{
    Value,
    json,
};
use std::{
    fs,
    net::TcpListener,
    path::{
        Path,
        PathBuf,
    },
    thread::JoinHandle,
};
use thiserror::Error;
use tokio::sync::mpsc::{
    self,
    error::TrySendError,
};
use tracing::{
    debug,
    error,
    info,
    warn,
};
use url::Url;

pub const WEBHOOK_PATH: &str = "/api/webhook";
pub const PAYMASTER_PATH: &str = "/api/paymaster";
pub const MANIFEST_PATH: &str = "/.well-known/farcaster.json";
pub const DEFAULT_PUBLIC_URL: &str = "http://localhost:3000";

const DEFAULT_EVENT_BUFFER: usize = 64;
const SHUTDOWN_TIMEOUT_SECS: u64 = 1;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind HTTP listener: {0}")]
    Bind(std::io::Error),
    #[error("failed to start HTTP server: {0}")]
    Start(std::io::Error),
    #[error("failed to build paymaster client: {0}")]
    Client(reqwest::Error),
    #[error("failed to read manifest {path}: {source}")]
    ManifestRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid manifest {path}: {source}")]
    ManifestParse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// `None` picks a free port.
    pub port: Option<u16>,
    /// Upstream sponsorship service the paymaster route forwards to.
    pub paymaster_url: Option<Url>,
    pub manifest: Option<Value>,
    /// Webhook events held for [`CollaboratorServer::next_event`] before new ones are
    /// dropped.
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: None,
            paymaster_url: None,
            manifest: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

pub fn load_manifest(path: impl AsRef<Path>) -> Result<Value, ServerError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| ServerError::ManifestRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ServerError::ManifestParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Signed proof tying the manifest to the publishing account. Empty fields are served
/// as-is.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountAssociation {
    pub header: String,
    pub payload: String,
    pub signature: String,
}

/// Manifest for an app served under `public_url`, with its asset and webhook URLs
/// derived from it.
pub fn default_manifest(public_url: &Url, association: &AccountAssociation) -> Value {
    let base = public_url.as_str().trim_end_matches('/');
    json!({
        "accountAssociation": {
            "header": association.header,
            "payload": association.payload,
            "signature": association.signature,
        },
        "frame": {
            "version": "1",
            "name": "Send $1 or NGMI",
            "subtitle": "The Beautiful Ponzi",
            "description": "Last 100 people to send $1 split the pot when timer expires. \
                Every transaction resets the 42-minute countdown. Pure chaos.",
            "iconUrl": format!("{base}/icon.png"),
            "splashImageUrl": format!("{base}/splash.png"),
            "splashBackgroundColor": "#000000",
            "homeUrl": base,
            "webhookUrl": format!("{base}{WEBHOOK_PATH}"),
            "primaryCategory": "social",
            "categories": ["social", "gaming", "defi"],
            "screenshotUrls": [
                format!("{base}/screenshots/1.png"),
                format!("{base}/screenshots/2.png"),
            ],
        },
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleKind {
    Added,
    Removed,
    NotificationsEnabled,
    NotificationsDisabled,
    Unknown(String),
}

impl LifecycleKind {
    fn parse(name: &str) -> Self {
        match name {
            "added" | "frame_added" => LifecycleKind::Added,
            "removed" | "frame_removed" => LifecycleKind::Removed,
            "notifications_enabled" => LifecycleKind::NotificationsEnabled,
            "notifications_disabled" => LifecycleKind::NotificationsDisabled,
            other => LifecycleKind::Unknown(other.to_string()),
        }
    }
}

/// One webhook delivery from the hosting platform.
#[derive(Clone, Debug, PartialEq)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    pub fid: Option<u64>,
    pub received_at: DateTime<Utc>,
    pub body: Value,
}

impl LifecycleEvent {
    fn from_body(body: Value) -> Self {
        let kind = LifecycleKind::parse(body.get("event").and_then(Value::as_str).unwrap_or(""));
        let fid = body.get("fid").and_then(Value::as_u64);
        Self {
            kind,
            fid,
            received_at: Utc::now(),
            body,
        }
    }
}

#[derive(Clone)]
struct Paymaster {
    upstream: Option<Url>,
    http: reqwest::Client,
}

/// HTTP surface around the client core: lifecycle webhook, paymaster proxy and the
/// app manifest. Runs on its own thread and stops when dropped.
pub struct CollaboratorServer {
    events: mpsc::Receiver<LifecycleEvent>,
    base_url: String,
    server_handle: ServerHandle,
    server_thread: Option<JoinHandle<()>>,
}

impl CollaboratorServer {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let (sender, events) = mpsc::channel(config.event_buffer.max(1));
        let paymaster = Paymaster {
            upstream: config.paymaster_url.clone(),
            http: reqwest::Client::builder()
                .build()
                .map_err(ServerError::Client)?,
        };
        if paymaster.upstream.is_none() {
            warn!("no paymaster upstream configured; sponsorship requests will fail");
        }

        let listener = TcpListener::bind((config.host.as_str(), config.port.unwrap_or(0)))
            .map_err(ServerError::Bind)?;
        let address = listener.local_addr().map_err(ServerError::Bind)?;
        let base_url = format!("http://{address}");
        info!("collaborator server listening on {base_url}");

        let sender = web::Data::new(sender);
        let paymaster = web::Data::new(paymaster);
        let manifest = web::Data::new(config.manifest);
        let server = HttpServer::new(move || {
            App::new()
                .app_data(sender.clone())
                .app_data(paymaster.clone())
                .app_data(manifest.clone())
                .route(WEBHOOK_PATH, web::post().to(handle_webhook))
                .route(WEBHOOK_PATH, web::get().to(webhook_health))
                .route(PAYMASTER_PATH, web::post().to(handle_paymaster))
                .route(PAYMASTER_PATH, web::get().to(paymaster_health))
                .route(MANIFEST_PATH, web::get().to(handle_manifest))
        })
        .shutdown_timeout(SHUTDOWN_TIMEOUT_SECS)
        .listen(listener)
        .map_err(ServerError::Start)?
        .run();

        let server_handle = server.handle();
        let server_thread = std::thread::spawn(move || {
            let sys = actix_web::rt::System::new();
            if let Err(error) = sys.block_on(server) {
                error!(%error, "collaborator server stopped with an error");
            }
        });

        Ok(Self {
            events,
            base_url,
            server_handle,
            server_thread: Some(server_thread),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Next acknowledged webhook event; `None` once the server is gone.
    pub async fn next_event(&mut self) -> Option<LifecycleEvent> {
        self.events.recv().await
    }
}

impl Drop for CollaboratorServer {
    fn drop(&mut self) {
        let _ = self.server_handle.stop(true);
        if let Some(thread) = self.server_thread.take() {
            let _ = thread.join();
        }
    }
}

fn webhook_failed() -> HttpResponse {
    HttpResponse::InternalServerError().json(json!({ "error": "Webhook processing failed" }))
}

fn paymaster_failed() -> HttpResponse {
    HttpResponse::InternalServerError().json(json!({ "error": "Paymaster request failed" }))
}

/// Acknowledges before anyone looks at the event; a full buffer drops it.
async fn handle_webhook(
    sender: web::Data<mpsc::Sender<LifecycleEvent>>,
    body: web::Bytes,
) -> HttpResponse {
    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => {
            warn!(body = %other, "webhook body is not a JSON object");
            return webhook_failed();
        }
        Err(error) => {
            warn!(%error, "webhook body is not JSON");
            return webhook_failed();
        }
    };
    let event = LifecycleEvent::from_body(parsed);
    match &event.kind {
        LifecycleKind::Unknown(name) => info!(event = %name, "unknown webhook event"),
        kind => info!(?kind, fid = ?event.fid, "webhook event received"),
    }
    match sender.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            warn!(kind = ?event.kind, "webhook event buffer full; dropping event")
        }
        Err(TrySendError::Closed(_)) => debug!("no webhook consumer; dropping event"),
    }
    HttpResponse::Ok().json(json!({ "success": true }))
}

async fn webhook_health() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "message": "Webhook endpoint is running",
    }))
}

async fn handle_paymaster(paymaster: web::Data<Paymaster>, body: web::Bytes) -> HttpResponse {
    let request: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(error) => {
            warn!(%error, "paymaster request is not JSON");
            return paymaster_failed();
        }
    };
    let Some(upstream) = paymaster.upstream.clone() else {
        error!("paymaster upstream not configured");
        return HttpResponse::InternalServerError()
            .json(json!({ "error": "Paymaster not configured" }));
    };

    let response = match paymaster.http.post(upstream).json(&request).send().await {
        Ok(response) => response,
        Err(error) => {
            error!(%error, "paymaster upstream unreachable");
            return paymaster_failed();
        }
    };
    let status = response.status().as_u16();
    if !response.status().is_success() {
        let details = response.text().await.unwrap_or_default();
        error!(status, %details, "paymaster upstream rejected request");
        let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
        return HttpResponse::build(code).json(json!({
            "error": "Paymaster request failed",
            "details": details,
        }));
    }
    match response.json::<Value>().await {
        Ok(data) => HttpResponse::Ok().json(data),
        Err(error) => {
            error!(%error, "paymaster upstream returned invalid JSON");
            paymaster_failed()
        }
    }
}

async fn paymaster_health(paymaster: web::Data<Paymaster>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "message": "Paymaster proxy is running",
        "configured": paymaster.upstream.is_some(),
    }))
}

async fn handle_manifest(manifest: web::Data<Option<Value>>) -> HttpResponse {
    match manifest.get_ref() {
        Some(document) => HttpResponse::Ok().json(document),
        None => HttpResponse::NotFound().json(json!({ "error": "Manifest not configured" })),
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn server(config: ServerConfig) -> CollaboratorServer {
        CollaboratorServer::new(config).unwrap()
    }

    async fn post(url: String, body: &str) -> (u16, Value) {
        let response = reqwest::Client::new()
            .post(url)
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn get(url: String) -> (u16, Value) {
        let response = reqwest::get(url).await.unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    #[tokio::test]
    async fn webhook__acknowledges_and_hands_event_over() {
        // given
        let mut sut = server(ServerConfig::default());
        let url = format!("{}{WEBHOOK_PATH}", sut.base_url());

        // when
        let (status, body) = post(url, r#"{"event":"frame_added","fid":42}"#).await;
        let event = sut.next_event().await.unwrap();

        // then
        assert_eq!(status, 200);
        assert_eq!(body, json!({ "success": true }));
        assert_eq!(event.kind, LifecycleKind::Added);
        assert_eq!(event.fid, Some(42));
    }

    #[tokio::test]
    async fn webhook__accepts_both_event_spellings() {
        // given
        let mut sut = server(ServerConfig::default());
        let url = format!("{}{WEBHOOK_PATH}", sut.base_url());

        // when
        post(url.clone(), r#"{"event":"removed","fid":1}"#).await;
        post(url.clone(), r#"{"event":"frame_removed","fid":2}"#).await;
        post(url.clone(), r#"{"event":"notifications_disabled"}"#).await;
        post(url, r#"{"event":"something_new"}"#).await;

        // then
        let mut kinds = Vec::new();
        for _ in 0..4 {
            kinds.push(sut.next_event().await.unwrap().kind);
        }
        assert_eq!(
            kinds,
            vec![
                LifecycleKind::Removed,
                LifecycleKind::Removed,
                LifecycleKind::NotificationsDisabled,
                LifecycleKind::Unknown("something_new".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn webhook__full_buffer_still_acknowledges() {
        // given
        let mut sut = server(ServerConfig {
            event_buffer: 1,
            ..ServerConfig::default()
        });
        let url = format!("{}{WEBHOOK_PATH}", sut.base_url());

        // when
        let mut statuses = Vec::new();
        for fid in 0..3 {
            let body = format!(r#"{{"event":"notifications_enabled","fid":{fid}}}"#);
            statuses.push(post(url.clone(), &body).await.0);
        }

        // then
        assert_eq!(statuses, vec![200, 200, 200]);
        assert_eq!(sut.next_event().await.unwrap().fid, Some(0));
        let nothing_more = tokio::time::timeout(Duration::from_millis(100), sut.next_event()).await;
        assert!(nothing_more.is_err());
    }

    #[tokio::test]
    async fn webhook__malformed_body_is_server_error() {
        let sut = server(ServerConfig::default());
        let url = format!("{}{WEBHOOK_PATH}", sut.base_url());

        let (status, body) = post(url, "not json").await;

        assert_eq!(status, 500);
        assert_eq!(body, json!({ "error": "Webhook processing failed" }));
    }

    #[tokio::test]
    async fn paymaster__unconfigured_upstream_is_reported() {
        // given
        let sut = server(ServerConfig::default());
        let url = format!("{}{PAYMASTER_PATH}", sut.base_url());

        // when
        let (status, body) = post(url.clone(), r#"{"method":"pm_sponsor"}"#).await;
        let (health_status, health) = get(url).await;

        // then
        assert_eq!(status, 500);
        assert_eq!(body, json!({ "error": "Paymaster not configured" }));
        assert_eq!(health_status, 200);
        assert_eq!(health["configured"], json!(false));
    }

    #[tokio::test]
    async fn paymaster__forwards_body_to_upstream() {
        // given
        let mut upstream = server(ServerConfig::default());
        let upstream_url = Url::parse(&format!("{}{WEBHOOK_PATH}", upstream.base_url())).unwrap();
        let sut = server(ServerConfig {
            paymaster_url: Some(upstream_url),
            ..ServerConfig::default()
        });
        let url = format!("{}{PAYMASTER_PATH}", sut.base_url());

        // when
        let (status, body) = post(url.clone(), r#"{"event":"frame_added","fid":7}"#).await;

        // then
        assert_eq!(status, 200);
        assert_eq!(body, json!({ "success": true }));
        let forwarded = upstream.next_event().await.unwrap();
        assert_eq!(forwarded.fid, Some(7));
        assert_eq!(get(url).await.1["configured"], json!(true));
    }

    #[tokio::test]
    async fn paymaster__mirrors_upstream_failure_status() {
        // given
        let upstream = server(ServerConfig::default());
        let upstream_url = Url::parse(&format!("{}/missing", upstream.base_url())).unwrap();
        let sut = server(ServerConfig {
            paymaster_url: Some(upstream_url),
            ..ServerConfig::default()
        });

        // when
        let (status, body) = post(
            format!("{}{PAYMASTER_PATH}", sut.base_url()),
            r#"{"method":"pm_sponsor"}"#,
        )
        .await;

        // then
        assert_eq!(status, 404);
        assert_eq!(body["error"], json!("Paymaster request failed"));
    }

    #[tokio::test]
    async fn manifest__served_when_configured_and_missing_otherwise() {
        // given
        let document = json!({ "frame": { "name": "Send $1", "version": "1" } });
        let with_manifest = server(ServerConfig {
            manifest: Some(document.clone()),
            ..ServerConfig::default()
        });
        let without_manifest = server(ServerConfig::default());

        // when
        let served = get(format!("{}{MANIFEST_PATH}", with_manifest.base_url())).await;
        let missing = get(format!("{}{MANIFEST_PATH}", without_manifest.base_url())).await;

        // then
        assert_eq!(served, (200, document));
        assert_eq!(missing.0, 404);
    }

    #[tokio::test]
    async fn manifest__default_document_points_at_public_url() {
        // given
        let public_url = Url::parse("https://send1.example/").unwrap();
        let association = AccountAssociation {
            header: "eyJmaWQiOjF9".to_string(),
            payload: "eyJkb21haW4iOiJzZW5kMS5leGFtcGxlIn0".to_string(),
            signature: "0xsig".to_string(),
        };
        let sut = server(ServerConfig {
            manifest: Some(default_manifest(&public_url, &association)),
            ..ServerConfig::default()
        });

        // when
        let (status, body) = get(format!("{}{MANIFEST_PATH}", sut.base_url())).await;

        // then
        assert_eq!(status, 200);
        assert_eq!(body["accountAssociation"]["header"], json!("eyJmaWQiOjF9"));
        assert_eq!(body["accountAssociation"]["signature"], json!("0xsig"));
        let frame = &body["frame"];
        assert_eq!(frame["version"], json!("1"));
        assert_eq!(frame["homeUrl"], json!("https://send1.example"));
        assert_eq!(frame["iconUrl"], json!("https://send1.example/icon.png"));
        assert_eq!(
            frame["webhookUrl"],
            json!("https://send1.example/api/webhook")
        );
        assert_eq!(frame["categories"], json!(["social", "gaming", "defi"]));
    }
}
