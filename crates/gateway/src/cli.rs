//! Command-line interface and config loading.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use af_domain::config::Config;

#[derive(Parser)]
#[command(name = "astraforge", about = "AstraForge sandbox-backed agent orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Path to the config file (default: ./astraforge.toml, then
    /// ~/.config/astraforge/astraforge.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the gateway server (the default).
    Serve,
    /// Config inspection.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the resolved config and report issues.
    Validate,
    /// Dump the resolved config as TOML.
    Show,
}

/// Resolve the config: file (if present), then env overrides.
pub fn load_config(explicit: Option<&PathBuf>) -> anyhow::Result<(Arc<Config>, Option<PathBuf>)> {
    let candidates: Vec<PathBuf> = match explicit {
        Some(path) => vec![path.clone()],
        None => {
            let mut paths = vec![PathBuf::from("astraforge.toml")];
            if let Some(config_dir) = dirs::config_dir() {
                paths.push(config_dir.join("astraforge/astraforge.toml"));
            }
            paths
        }
    };

    let mut config = Config::default();
    let mut source = None;
    for candidate in candidates {
        if candidate.exists() {
            let text = std::fs::read_to_string(&candidate)?;
            config = Config::from_toml(&text)
                .map_err(|e| anyhow::anyhow!("{}: {e}", candidate.display()))?;
            source = Some(candidate);
            break;
        }
    }

    config.apply_env();
    Ok((Arc::new(config), source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let missing = PathBuf::from("/definitely/not/here.toml");
        // An explicit-but-missing path falls through to defaults.
        let (config, source) = load_config(Some(&missing)).unwrap();
        assert_eq!(config.server.port, 8040);
        assert!(source.is_none());
    }

    #[test]
    fn explicit_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("astraforge.toml");
        std::fs::write(&path, "[server]\nport = 9999\n").unwrap();
        let (config, source) = load_config(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(source.unwrap(), path);
    }
}
