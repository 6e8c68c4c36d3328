pub mod amount;
pub mod auth;
pub mod config;
pub mod engine;
pub mod http;
pub mod journal;
pub mod ledger;
pub mod model;
pub mod store;

pub use amount::Amount;
pub use engine::Engine;
pub use model::{Account, AccountNumber, LedgerEntry, LedgerStatus, RequestId, TransferRequest};
