//! Manifest loading for `simulate`.
//!
//! A manifest is one or more YAML documents. A document with an `apiVersion`
//! is read as a `ReplicaGroup` object; anything else as a bare DesiredState.

use std::path::Path;

use anyhow::{bail, Context, Result};
use replicon_core::DesiredState;
use replicon_kubehub::ReplicaGroup;
use serde::Deserialize;

pub fn load(path: &Path) -> Result<Vec<DesiredState>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse(text: &str) -> Result<Vec<DesiredState>> {
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_yaml::Value::deserialize(doc).with_context(|| format!("document {}", i + 1))?;
        if value.is_null() {
            continue;
        }
        let ds = if value.get("apiVersion").is_some() {
            let rg: ReplicaGroup = serde_yaml::from_value(value).with_context(|| format!("document {}: ReplicaGroup", i + 1))?;
            rg.to_desired()
        } else {
            serde_yaml::from_value(value).with_context(|| format!("document {}: DesiredState", i + 1))?
        };
        out.push(ds);
    }
    if out.is_empty() {
        bail!("manifest holds no desired states");
    }
    Ok(out)
}
