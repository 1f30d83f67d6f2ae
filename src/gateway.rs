use crate::{
    address::{
        Address,
        TxHash,
        Wei,
    },
    error::ReadError,
};
use std::future::Future;

pub mod rpc_gateway;

pub type ReadResult<T> = std::result::Result<T, ReadError>;

/// Outcome of an accepted write as recorded by the ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub succeeded: bool,
}

/// Typed read access to the game contract.
pub trait LedgerGateway: Send + Sync + 'static {
    fn time_remaining(&self) -> impl Future<Output = ReadResult<u64>> + Send;

    /// Raw queue slots, oldest first; empty slots are [`Address::ZERO`].
    fn queue(&self) -> impl Future<Output = ReadResult<Vec<Address>>> + Send;

    fn pot_value(&self) -> impl Future<Output = ReadResult<Wei>> + Send;

    fn total_entries(&self) -> impl Future<Output = ReadResult<u64>> + Send;

    fn estimated_payout(&self) -> impl Future<Output = ReadResult<Wei>> + Send;

    fn can_end_game(&self) -> impl Future<Output = ReadResult<bool>> + Send;

    fn game_ended(&self) -> impl Future<Output = ReadResult<bool>> + Send;

    fn game_active(&self) -> impl Future<Output = ReadResult<bool>> + Send;

    /// `None` while the transaction is not yet included.
    fn receipt(
        &self,
        tx_hash: TxHash,
    ) -> impl Future<Output = ReadResult<Option<Receipt>>> + Send;

    fn block_number(&self) -> impl Future<Output = ReadResult<u64>> + Send;
}
