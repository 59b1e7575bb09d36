pub mod cache;
pub mod ch;
pub mod cmd;
pub mod config;
pub mod evm;
pub mod indexer;
pub mod pchain;
pub mod retry;
pub mod shutdown;
