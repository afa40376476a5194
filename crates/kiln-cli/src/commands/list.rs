//! List command implementation

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use serde_json::json;
use std::path::PathBuf;
use tabled::{settings::Style, Table, Tabled};
use tracing::debug;

use crate::commands::Command;
use crate::config::Config;
use crate::utils::{format_bytes, print_heading, print_json};

use kiln_core::store::{self, CacheFile, CacheKind};

#[derive(Args, Debug)]
pub struct ListCommand {
    /// Cache directory (defaults to the configured one)
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

#[derive(Tabled)]
struct CacheFileRow {
    kind: String,
    graph: String,
    file: String,
    size: String,
    modified: String,
}

impl From<&CacheFile> for CacheFileRow {
    fn from(file: &CacheFile) -> Self {
        Self {
            kind: format!("{:?}", file.kind).to_lowercase(),
            graph: graph_stem(file).to_string(),
            file: file
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size: format_bytes(file.size),
            modified: file
                .modified
                .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// Graph part of a cache file name; engine files carry a `_<signature>` suffix
fn graph_stem(file: &CacheFile) -> &str {
    match file.kind {
        CacheKind::Engine => file
            .stem
            .rsplit_once('_')
            .filter(|(_, sig)| sig.len() == 16 && sig.chars().all(|c| c.is_ascii_hexdigit()))
            .map(|(graph, _)| graph)
            .unwrap_or(file.stem.as_str()),
        CacheKind::Profile => file.stem.as_str(),
    }
}

#[async_trait]
impl Command for ListCommand {
    async fn execute(&self, config: &Config, json_output: bool) -> Result<()> {
        let dir = config.cache_dir(self.dir.as_deref());
        debug!("Listing cache directory {}", dir.display());

        let files = store::scan(&dir)
            .with_context(|| format!("Failed to scan cache directory: {}", dir.display()))?;

        if json_output {
            return print_json(&json!({
                "dir": dir,
                "files": files,
            }));
        }

        print_heading(&format!("Engine cache at {}", dir.display()));
        if files.is_empty() {
            println!("No cache files found");
            return Ok(());
        }

        let rows: Vec<CacheFileRow> = files.iter().map(CacheFileRow::from).collect();
        println!("{}", Table::new(rows).with(Style::rounded()));
        let total: u64 = files.iter().map(|f| f.size).sum();
        println!("{} files, {}", files.len(), format_bytes(total));
        Ok(())
    }
}
