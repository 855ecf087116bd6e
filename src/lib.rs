pub mod batch;
pub mod batchctl;
pub mod bootstrap;
pub mod clock;
pub mod keys;
pub mod ledger;
pub mod metrics;
pub mod settings;
pub mod store;
pub mod supervisor;
pub mod trace;

pub use batch::{BatchError, Batcher};
pub use batchq_macros::test;
