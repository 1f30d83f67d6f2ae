use crate::{
    Error,
    Result,
    address::TxHash,
    error::RelayStatus,
    relay::{
        Acceptance,
        CallPayload,
        SponsorshipRelay,
    },
};
use serde::Deserialize;
use serde_json::Value;
use std::{
    str::FromStr,
    time::Duration,
};
use url::Url;

/// Relay reached over HTTP: one POST endpoint taking a [`CallPayload`] as JSON.
#[derive(Clone)]
pub struct HttpSponsorshipRelay {
    url: Url,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct AcceptedDto {
    #[serde(rename = "txHash", alias = "hash", alias = "result")]
    tx_hash: String,
}

impl HttpSponsorshipRelay {
    /// Requests with no answer within `timeout` fail as unreachable.
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::RelayRejection {
                status: RelayStatus::Unreachable,
                detail: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { url, http })
    }
}

impl SponsorshipRelay for HttpSponsorshipRelay {
    async fn forward(&self, payload: &CallPayload) -> Result<Acceptance> {
        tracing::debug!(to = %payload.to, value = payload.value, "forwarding action to relay");
        let res = self
            .http
            .post(self.url.clone())
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::RelayRejection {
                status: RelayStatus::Unreachable,
                detail: e.to_string(),
            })?;
        let status = res.status();
        let bytes = res.bytes().await.map_err(|e| Error::RelayRejection {
            status: RelayStatus::Http(status.as_u16()),
            detail: format!("failed to read relay response body: {e}"),
        })?;
        interpret_response(status.as_u16(), &bytes)
    }
}

/// Maps a relay HTTP response onto acceptance or the write-path error taxonomy.
pub(crate) fn interpret_response(status: u16, body: &[u8]) -> Result<Acceptance> {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    if let Some(err) = parsed.as_ref().and_then(|v| v.get("error"))
        && let Some(reason) = revert_reason(err)
    {
        return Err(Error::LedgerRevert { reason });
    }
    let success = (200..300).contains(&status);
    if success
        && let Some(value) = parsed.clone()
        && value.get("error").is_none()
    {
        let dto: AcceptedDto =
            serde_json::from_value(value).map_err(|e| Error::RelayRejection {
                status: RelayStatus::Http(status),
                detail: format!("relay acceptance without transaction hash: {e}"),
            })?;
        let tx_hash = TxHash::from_str(&dto.tx_hash).map_err(|e| Error::RelayRejection {
            status: RelayStatus::Http(status),
            detail: format!("relay returned invalid transaction hash: {e}"),
        })?;
        return Ok(Acceptance { tx_hash });
    }
    Err(Error::RelayRejection {
        status: RelayStatus::Http(status),
        detail: rejection_detail(parsed.as_ref(), body),
    })
}

/// JSON-RPC style `{code: 3, message: "execution reverted: ..."}` errors come from the
/// ledger's own rules, not from the relay.
fn revert_reason(err: &Value) -> Option<String> {
    let message = err
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| err.as_str())?;
    let code = err.get("code").and_then(Value::as_i64);
    if code == Some(3) || message.starts_with("execution reverted") {
        return Some(message.to_string());
    }
    None
}

fn rejection_detail(parsed: Option<&Value>, body: &[u8]) -> String {
    let Some(value) = parsed else {
        return String::from_utf8_lossy(body).trim().to_string();
    };
    let error = match value.get("error") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Object(obj)) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    };
    let details = value
        .get("details")
        .and_then(Value::as_str)
        .map(str::to_string);
    match (error, details) {
        (Some(e), Some(d)) => format!("{e}: {d}"),
        (Some(e), None) => e,
        (None, Some(d)) => d,
        (None, None) => value.to_string(),
    }
}
