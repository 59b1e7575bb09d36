pub mod granular;
pub mod incremental;
pub mod runner;
pub mod sqlfile;
pub mod watermarks;

pub use runner::IndexRunner;
