//! Command implementations for Kiln CLI

pub mod inspect;
pub mod list;
pub mod purge;
pub mod simulate;

use anyhow::Result;
use async_trait::async_trait;

/// Trait for CLI command execution
#[async_trait]
pub trait Command {
    /// Execute the command
    async fn execute(&self, config: &crate::config::Config, json_output: bool) -> Result<()>;
}
