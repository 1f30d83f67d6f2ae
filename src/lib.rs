pub mod abi;

pub mod address;

pub mod config;

pub mod context;

pub mod derived;

pub mod error;

pub mod gateway;

pub mod orchestrator;

pub mod poller;

pub mod queue;

pub mod relay;

pub mod server;

pub mod snapshot;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use context::ClientContext;
pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;
