use crate::{
    Result,
    address::{
        Address,
        TxHash,
        Wei,
    },
};
use serde::{
    Deserialize,
    Serialize,
};
use std::future::Future;

pub mod http_relay;

/// Serialized write action handed to the sponsorship relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallPayload {
    /// Account on whose behalf the relay submits; `None` lets the relay decide.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from: Option<Address>,
    pub to: Address,
    #[serde(with = "hex_data")]
    pub data: Vec<u8>,
    #[serde(with = "hex_quantity")]
    pub value: Wei,
}

/// The relay forwarded the action and the ledger accepted it into its pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acceptance {
    pub tx_hash: TxHash,
}

/// Pays fees on the caller's behalf. Implementations must not retry on their own.
pub trait SponsorshipRelay: Send + Sync + 'static {
    /// Errors are [`crate::Error::RelayRejection`] or [`crate::Error::LedgerRevert`].
    fn forward(&self, payload: &CallPayload)
    -> impl Future<Output = Result<Acceptance>> + Send;
}

mod hex_data {
    use serde::{
        Deserialize,
        Deserializer,
        Serializer,
    };

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(data)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

mod hex_quantity {
    use crate::address::Wei;
    use serde::{
        Deserialize,
        Deserializer,
        Serializer,
    };

    pub fn serialize<S: Serializer>(value: &Wei, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{value:#x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Wei, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let digits = raw.trim_start_matches("0x");
        if digits.is_empty() {
            return Ok(0);
        }
        Wei::from_str_radix(digits, 16).map_err(serde::de::Error::custom)
    }
}
