//! Configuration loading and defaults

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::kdb3::error::Result;
use crate::kdb3::format::KDB3_DEFAULT_KEY_ROUNDS;

/// Byte encoding of the master password fed into key derivation.
///
/// KeePass 1.x hashes the password in a single byte Western encoding, so
/// `Latin1` is the default. Characters outside ISO-8859-1 become `?`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PasswordEncoding {
    #[default]
    Latin1,
    Utf8,
}

pub const DEFAULT_SEARCH_RESULTS: usize = 50;
pub const MAX_SEARCH_RESULTS: usize = 200;

/// Which fields a search looks at and how many hits it returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    pub max_results: usize,
    pub include_backup: bool,
    pub title: bool,
    pub username: bool,
    pub url: bool,
    pub notes: bool,
    pub binary_description: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            max_results: DEFAULT_SEARCH_RESULTS,
            include_backup: true,
            title: true,
            username: true,
            url: true,
            notes: true,
            binary_description: false,
        }
    }
}

impl SearchOptions {
    pub fn result_limit(&self) -> usize {
        self.max_results.clamp(1, MAX_SEARCH_RESULTS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub password_encoding: PasswordEncoding,
    #[serde(default = "default_key_rounds")]
    pub key_rounds: u32,
    #[serde(default = "default_chunk_size")]
    pub key_file_chunk_size: usize,
    #[serde(default = "default_true")]
    pub obfuscate_secrets: bool,
    #[serde(default)]
    pub search: SearchOptions,
}

fn default_key_rounds() -> u32 {
    KDB3_DEFAULT_KEY_ROUNDS
}

fn default_chunk_size() -> usize {
    2048
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Config {
            password_encoding: PasswordEncoding::default(),
            key_rounds: default_key_rounds(),
            key_file_chunk_size: default_chunk_size(),
            obfuscate_secrets: true,
            search: SearchOptions::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }
}
