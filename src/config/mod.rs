//! Configuration structures for the job manager.

mod manager;

pub use manager::JobManagerConfig;
