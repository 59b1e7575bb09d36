pub mod models;
pub mod rpc;
pub mod syncer;
pub mod validators;
