//! Inspect command implementation
//!
//! Decodes a `.profile` file and prints the dimension ranges of every binding.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use tabled::{settings::Style, Table, Tabled};
use tracing::info;

use crate::commands::Command;
use crate::config::Config;
use crate::utils::{print_heading, print_json};

use kiln_core::profile_format;

#[derive(Args, Debug)]
pub struct InspectCommand {
    /// Path to the profile file
    pub profile: PathBuf,
}

#[derive(Tabled)]
struct RangeRow {
    binding: String,
    dim: usize,
    min: i64,
    max: i64,
}

#[async_trait]
impl Command for InspectCommand {
    async fn execute(&self, _config: &Config, json_output: bool) -> Result<()> {
        info!("Inspecting profile {}", self.profile.display());
        let bytes = std::fs::read(&self.profile)
            .with_context(|| format!("Failed to read profile: {}", self.profile.display()))?;
        let profile = profile_format::deserialize(&bytes)
            .with_context(|| format!("Failed to decode profile: {}", self.profile.display()))?;
        let signature = format!("{:016x}", profile_format::signature(&profile));

        if json_output {
            let mut bindings = Map::new();
            for (name, range) in profile.iter() {
                let dims: Map<String, Value> = range
                    .iter()
                    .map(|(index, dim)| (index.to_string(), json!([dim.min, dim.max])))
                    .collect();
                bindings.insert(name.to_string(), Value::Object(dims));
            }
            return print_json(&json!({
                "path": self.profile,
                "signature": signature,
                "bindings": bindings,
            }));
        }

        print_heading(&format!("Profile {}", self.profile.display()));
        println!("signature: {}", signature);
        let rows: Vec<RangeRow> = profile
            .iter()
            .flat_map(|(name, range)| {
                range.iter().map(move |(dim, r)| RangeRow {
                    binding: name.to_string(),
                    dim,
                    min: r.min,
                    max: r.max,
                })
            })
            .collect();
        if rows.is_empty() {
            println!("No dynamic dimensions recorded");
        } else {
            println!("{}", Table::new(rows).with(Style::rounded()));
        }
        Ok(())
    }
}
