//! Purge command implementation

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, ValueEnum};
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

use crate::commands::Command;
use crate::config::Config;
use crate::utils::{print_json, print_success};

use kiln_core::store::{remove_by_extension, CacheKind};

/// Which cache files to delete
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PurgeKind {
    Engine,
    Profile,
    All,
}

impl PurgeKind {
    fn kinds(self) -> &'static [CacheKind] {
        match self {
            Self::Engine => &[CacheKind::Engine],
            Self::Profile => &[CacheKind::Profile],
            Self::All => &[CacheKind::Engine, CacheKind::Profile],
        }
    }
}

#[derive(Args, Debug)]
pub struct PurgeCommand {
    /// Cache directory (defaults to the configured one)
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Kind of cache files to delete
    #[arg(long, value_enum, default_value = "all")]
    pub kind: PurgeKind,
}

#[async_trait]
impl Command for PurgeCommand {
    async fn execute(&self, config: &Config, json_output: bool) -> Result<()> {
        let dir = config.cache_dir(self.dir.as_deref());

        let mut removed = 0;
        for kind in self.kind.kinds() {
            let count = remove_by_extension(&dir, kind.extension()).with_context(|| {
                format!("Failed to remove {} files from {}", kind.extension(), dir.display())
            })?;
            info!("Removed {} {} files from {}", count, kind.extension(), dir.display());
            removed += count;
        }

        if json_output {
            print_json(&json!({ "dir": dir, "removed": removed }))
        } else {
            print_success(&format!("Removed {} cache files from {}", removed, dir.display()));
            Ok(())
        }
    }
}
