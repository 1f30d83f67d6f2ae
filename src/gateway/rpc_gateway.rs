use crate::{
    abi,
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
    snapshot::QUEUE_SIZE,
};
use serde::Deserialize;
use serde_json::{
    Value,
    json,
};
use std::{
    str::FromStr,
    sync::{
        Arc,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
};
use url::Url;

/// [`LedgerGateway`] over an Ethereum-style JSON-RPC endpoint.
#[derive(Clone)]
pub struct RpcLedgerGateway {
    rpc_url: Url,
    contract: Address,
    http: reqwest::Client,
    next_id: Arc<AtomicU64>,
}

#[derive(Deserialize)]
struct RpcResponseDto {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorDto>,
}

#[derive(Deserialize)]
struct RpcErrorDto {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptDto {
    transaction_hash: String,
    block_number: Option<String>,
    status: Option<String>,
}

impl RpcLedgerGateway {
    pub fn new(rpc_url: Url, contract: Address) -> ReadResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ReadError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            rpc_url,
            contract,
            http,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    async fn rpc(&self, method: &str, params: Value) -> ReadResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let res = self
            .http
            .post(self.rpc_url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| ReadError::Transport(e.to_string()))?;
        let status = res.status();
        let bytes = res
            .bytes()
            .await
            .map_err(|e| ReadError::Transport(e.to_string()))?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            return Err(ReadError::Transport(format!(
                "rpc responded with {status} to {method}: {body}"
            )));
        }
        let dto: RpcResponseDto = serde_json::from_slice(&bytes)
            .map_err(|e| ReadError::Malformed(format!("invalid {method} payload: {e}")))?;
        if let Some(err) = dto.error {
            return Err(ReadError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(dto.result.unwrap_or(Value::Null))
    }

    async fn call_view(&self, signature: &'static str) -> ReadResult<Vec<u8>> {
        let data = format!("0x{}", hex::encode(abi::encode_call(signature)));
        let params = json!([{ "to": self.contract.to_string(), "data": data }, "latest"]);
        let result = self.rpc("eth_call", params).await?;
        let raw = result.as_str().ok_or_else(|| {
            ReadError::Malformed(format!("{signature} returned non-string result"))
        })?;
        decode_hex_bytes(raw)
    }

    async fn call_word(&self, signature: &'static str) -> ReadResult<Vec<u8>> {
        let data = self.call_view(signature).await?;
        if !abi::has_words(&data, 1) {
            tracing::warn!(
                view = signature,
                len = data.len(),
                "unexpected return data length; decoding leniently"
            );
        }
        Ok(data)
    }
}

impl LedgerGateway for RpcLedgerGateway {
    async fn time_remaining(&self) -> ReadResult<u64> {
        let data = self.call_word(abi::GET_TIME_REMAINING).await?;
        Ok(abi::decode_u64(&data))
    }

    async fn queue(&self) -> ReadResult<Vec<Address>> {
        let data = self.call_view(abi::GET_CURRENT_QUEUE_POSITIONS).await?;
        if !abi::has_words(&data, QUEUE_SIZE) {
            tracing::warn!(
                len = data.len(),
                "queue view returned unexpected length; padding with empty slots"
            );
        }
        Ok(abi::decode_address_array(&data, QUEUE_SIZE))
    }

    async fn pot_value(&self) -> ReadResult<Wei> {
        let data = self.call_word(abi::TOTAL_POT_VALUE).await?;
        Ok(abi::decode_uint(&data))
    }

    async fn total_entries(&self) -> ReadResult<u64> {
        let data = self.call_word(abi::TOTAL_ENTRIES).await?;
        Ok(abi::decode_u64(&data))
    }

    async fn estimated_payout(&self) -> ReadResult<Wei> {
        let data = self.call_word(abi::GET_ESTIMATED_PAYOUT).await?;
        Ok(abi::decode_uint(&data))
    }

    async fn can_end_game(&self) -> ReadResult<bool> {
        let data = self.call_word(abi::CAN_END_GAME).await?;
        Ok(abi::decode_bool(&data))
    }

    async fn game_ended(&self) -> ReadResult<bool> {
        let data = self.call_word(abi::GAME_ENDED).await?;
        Ok(abi::decode_bool(&data))
    }

    async fn game_active(&self) -> ReadResult<bool> {
        let data = self.call_word(abi::GAME_ACTIVE).await?;
        Ok(abi::decode_bool(&data))
    }

    async fn receipt(&self, tx_hash: TxHash) -> ReadResult<Option<Receipt>> {
        let result = self
            .rpc("eth_getTransactionReceipt", json!([tx_hash.to_string()]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let dto: ReceiptDto = serde_json::from_value(result)
            .map_err(|e| ReadError::Malformed(format!("invalid receipt payload: {e}")))?;
        receipt_from_dto(dto)
    }

    async fn block_number(&self) -> ReadResult<u64> {
        let result = self.rpc("eth_blockNumber", json!([])).await?;
        let raw = result
            .as_str()
            .ok_or_else(|| ReadError::Malformed("non-string block number".to_string()))?;
        parse_quantity(raw)
    }
}

/// Pending receipts (no block number yet) read as not included.
fn receipt_from_dto(dto: ReceiptDto) -> ReadResult<Option<Receipt>> {
    let Some(block_number) = dto.block_number.as_deref() else {
        return Ok(None);
    };
    let tx_hash = TxHash::from_str(&dto.transaction_hash)
        .map_err(|e| ReadError::Malformed(format!("receipt hash: {e}")))?;
    let succeeded = match dto.status.as_deref() {
        Some(status) => parse_quantity(status)? == 1,
        None => true,
    };
    Ok(Some(Receipt {
        tx_hash,
        block_number: parse_quantity(block_number)?,
        succeeded,
    }))
}

pub(crate) fn decode_hex_bytes(raw: &str) -> ReadResult<Vec<u8>> {
    let digits = raw.trim_start_matches("0x");
    hex::decode(digits).map_err(|e| ReadError::Malformed(format!("invalid hex data: {e}")))
}

pub(crate) fn parse_quantity(raw: &str) -> ReadResult<u64> {
    let digits = raw.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| ReadError::Malformed(format!("invalid quantity {raw}: {e}")))
}
