pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod freshness;
pub mod master;
pub mod normalize;
pub mod oracle;
pub mod orchestrator;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;
