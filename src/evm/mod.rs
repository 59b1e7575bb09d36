pub mod models;
pub mod rpc;
pub mod sink;
pub mod syncer;
