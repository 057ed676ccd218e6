//! Attack configuration, loaded from `~/.config/mgfn-attack/config.ini`.
//!
//! Mirrors the teacher's `storage.rs` `Config`/`Storage` split: a plain data
//! struct with a `default_for`/`load_from_ini`/`save_to_ini` trio, plus a
//! thin wrapper that resolves the config directory and ensures it exists.

use anyhow::{Context, Result};
use configparser::ini::Ini;
use std::fs;
use std::path::{Path, PathBuf};

/// Tunables for one attack run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker thread count for dataset generation, analysis, and search.
    pub threads: usize,
    /// Where the (P, C) dataset is read from / written to.
    pub dataset_path: PathBuf,
    /// log2 of the number of pairs the dataset should contain.
    pub target_pairs_log2: u32,
}

impl Config {
    /// Build the default config, rooted at the given config directory.
    pub fn default_for(config_dir: &Path) -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            dataset_path: config_dir.join("dataset.bin"),
            target_pairs_log2: 33,
        }
    }

    /// Load config from an INI file, falling back to defaults for missing
    /// or unparsable keys.
    pub fn load_from_ini(path: &Path, config_dir: &Path) -> Result<Self> {
        let mut ini = Ini::new();
        ini.load(path)
            .map_err(|e| anyhow::anyhow!("failed to load config: {e}"))?;

        let defaults = Config::default_for(config_dir);

        let threads = ini
            .getuint("attack", "threads")
            .ok()
            .flatten()
            .map(|v| v as usize)
            .unwrap_or(defaults.threads);

        let dataset_path = ini
            .get("attack", "dataset_path")
            .map(|s| expand_tilde(&s))
            .unwrap_or(defaults.dataset_path);

        let target_pairs_log2 = ini
            .getuint("attack", "target_pairs_log2")
            .ok()
            .flatten()
            .map(|v| v as u32)
            .unwrap_or(defaults.target_pairs_log2);

        Ok(Self {
            threads,
            dataset_path,
            target_pairs_log2,
        })
    }

    /// Write a commented INI file describing each field.
    pub fn save_to_ini(&self, path: &Path) -> Result<()> {
        let content = format!(
            r#"; mgfn-attack configuration
; Location: {path}

[attack]
; Worker thread count used for dataset generation, analysis, and search.
threads = {threads}

; Dataset file of (plaintext, ciphertext) pairs. Supports ~ for home directory.
dataset_path = {dataset_path}

; log2 of the number of (P, C) pairs the dataset should contain.
; The worst analyzer stage needs 2^33 pairs.
target_pairs_log2 = {pairs_log2}
"#,
            path = path.display(),
            threads = self.threads,
            dataset_path = self.dataset_path.to_string_lossy(),
            pairs_log2 = self.target_pairs_log2,
        );

        fs::write(path, content).with_context(|| format!("failed to write config to {path:?}"))?;
        Ok(())
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

/// Resolve `~/.config/mgfn-attack/` regardless of OS.
pub fn resolve_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join("mgfn-attack"))
}

/// Loads or creates the config directory and `config.ini`.
pub struct Storage {
    config_dir: PathBuf,
    pub config: Config,
}

impl Storage {
    pub fn new() -> Result<Self> {
        let config_dir =
            resolve_config_dir().context("could not determine home directory (is $HOME set?)")?;
        let config_path = config_dir.join("config.ini");

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("failed to create config dir: {config_dir:?}"))?;
            tracing::info!("created config directory: {:?}", config_dir);
        }

        let config = if config_path.exists() {
            tracing::info!("loading config from {:?}", config_path);
            match Config::load_from_ini(&config_path, &config_dir) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!("failed to parse config.ini, using defaults: {e}");
                    Config::default_for(&config_dir)
                }
            }
        } else {
            tracing::info!("no config.ini found, creating default at {:?}", config_path);
            let config = Config::default_for(&config_dir);
            if let Err(e) = config.save_to_ini(&config_path) {
                tracing::warn!("could not write default config.ini: {e}");
            }
            config
        };

        Ok(Self { config_dir, config })
    }

    pub fn save_config(&self) -> Result<()> {
        let config_path = self.config_dir.join("config.ini");
        self.config.save_to_ini(&config_path)?;
        tracing::info!("saved config to {:?}", config_path);
        Ok(())
    }

    pub fn config_dir(&self) -> &PathBuf {
        &self.config_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!(
            "mgfn-attack-config-test-{}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.ini");

        let mut cfg = Config::default_for(&dir);
        cfg.threads = 7;
        cfg.target_pairs_log2 = 20;
        cfg.save_to_ini(&path).unwrap();

        let loaded = Config::load_from_ini(&path, &dir).unwrap();
        assert_eq!(loaded.threads, 7);
        assert_eq!(loaded.target_pairs_log2, 20);
        assert_eq!(loaded.dataset_path, cfg.dataset_path);

        let _ = fs::remove_dir_all(&dir);
    }
}
