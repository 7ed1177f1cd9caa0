//! Subcommand implementations

pub mod profile;
pub mod scan;

use anyhow::Context;
use std::path::Path;
use ureflect_engine::LayoutProfile;

/// Parse an address given as decimal or `0x`-prefixed hex
pub fn parse_address(text: &str) -> Result<usize, String> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(&hex.replace('_', ""), 16),
        None => text.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", text, e))
}

/// Load and validate a profile, naming the file on failure
pub fn load_profile(path: &Path) -> anyhow::Result<LayoutProfile> {
    LayoutProfile::from_file(path)
        .with_context(|| format!("failed to load layout profile {}", path.display()))
}
