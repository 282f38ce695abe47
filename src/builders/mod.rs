//! Builders for assembling managers from configuration.

mod manager_builder;

pub use manager_builder::JobManagerBuilder;
