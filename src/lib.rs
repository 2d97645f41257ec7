pub mod audit;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod server;
pub mod store;

pub use error::{LedgerError, LedgerResult};
