//! Knobs recognized by the proxy. `Config` is assembled from CLI flags in
//! `main.rs`; loading it from a file on disk is out of scope.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
pub enum DohProvider {
    Cloudflare,
    Google,
    Quad9,
}

impl DohProvider {
    pub fn url(self) -> &'static str {
        match self {
            DohProvider::Cloudflare => "https://cloudflare-dns.com/dns-query",
            DohProvider::Google => "https://dns.google/resolve",
            DohProvider::Quad9 => "https://dns.quad9.net:5053/dns-query",
        }
    }
}

impl Default for DohProvider {
    fn default() -> Self {
        DohProvider::Cloudflare
    }
}

/// Traffic-shaping knobs. All zero-valued knobs are disabled.
#[derive(Debug, Clone, Default)]
pub struct ShapingProfile {
    pub fragment_size: u32,
    pub min_delay_ms: u32,
    pub max_delay_ms: u32,
    pub padding_size: u32,
    pub ttl: u8,
}

/// Header mutation knobs.
#[derive(Debug, Clone, Default)]
pub struct RewriteProfile {
    pub custom_headers: HashMap<String, String>,
    pub rotate_ua: bool,
    pub front_domain: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub cert_dir: PathBuf,
    pub shaping: ShapingProfile,
    pub rewrite: RewriteProfile,
    pub use_doh: bool,
    pub doh_provider: DohProvider,
    pub privacy_mode: bool,
    pub mock_rules_path: Option<PathBuf>,
    pub save_requests_dir: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("min_delay_ms ({min}) must be <= max_delay_ms ({max})")]
    DelayRangeInverted { min: u32, max: u32 },
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.shaping;
        if s.max_delay_ms > 0 && s.min_delay_ms > s.max_delay_ms {
            return Err(ConfigError::DelayRangeInverted {
                min: s.min_delay_ms,
                max: s.max_delay_ms,
            });
        }
        Ok(())
    }
}
