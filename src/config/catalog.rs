//! Capability catalog files
//! A catalog is an ordered JSON list of
//! `{ "service": uuid, "characteristics": { uuid: bitmask } }` entries.

use std::path::Path;

use anyhow::{anyhow, Result};
use log::info;
use tokio::fs;

use crate::core::bluetooth::CapabilityCatalog;

pub fn parse_catalog(json: &str) -> Result<CapabilityCatalog> {
    let catalog: CapabilityCatalog = serde_json::from_str(json)?;
    if catalog.is_empty() {
        return Err(anyhow!("Capability catalog declares no services"));
    }
    Ok(catalog)
}

pub async fn load_catalog(path: impl AsRef<Path>) -> Result<CapabilityCatalog> {
    let path = path.as_ref();
    let json = fs::read_to_string(path)
        .await
        .map_err(|e| anyhow!("Failed to read catalog {:?}: {}", path, e))?;
    let catalog = parse_catalog(&json)?;
    info!("Loaded capability catalog with {} services from {:?}", catalog.services().len(), path);
    Ok(catalog)
}
