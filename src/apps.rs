//! Installed application discovery.
//!
//! Scans an Applications folder for `.app` bundles, or loads a JSON list
//! prepared elsewhere.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// An installed application as seen by the rest of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstalledApp {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl InstalledApp {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl<N: Into<String>, V: Into<String>> From<(N, V)> for InstalledApp {
    fn from((name, version): (N, V)) -> Self {
        Self::new(name, version)
    }
}

/// List `*.app` bundles directly under `dir`, sorted by name.
pub fn scan_applications(dir: &Path) -> Result<Vec<InstalledApp>> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut apps = Vec::new();
    for entry in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("Failed to read {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("app") {
            continue;
        }
        let Some(name) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
            continue;
        };
        // Skip hidden bundles
        if name.starts_with('.') {
            continue;
        }
        let version = read_bundle_version(path).unwrap_or_default();
        apps.push(InstalledApp { name, version });
    }

    apps.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    Ok(apps)
}

/// Read `CFBundleShortVersionString` from an XML `Info.plist`.
fn read_bundle_version(bundle: &Path) -> Option<String> {
    let plist = fs::read_to_string(bundle.join("Contents/Info.plist")).ok()?;
    plist_string_value(&plist, "CFBundleShortVersionString")
        .or_else(|| plist_string_value(&plist, "CFBundleVersion"))
}

fn plist_string_value(plist: &str, key: &str) -> Option<String> {
    let marker = format!("<key>{}</key>", key);
    let rest = &plist[plist.find(&marker)? + marker.len()..];
    let start = rest.find("<string>")? + "<string>".len();
    let end = rest[start..].find("</string>")? + start;
    // The value must belong to this key, not a later one
    if rest[..start].contains("<key>") {
        return None;
    }
    Some(rest[start..end].trim().to_string())
}

/// Load `[{"name": ..., "version": ...}]` from a JSON file.
pub fn load_apps_file(path: &Path) -> Result<Vec<InstalledApp>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read apps file: {}", path.display()))?;
    let apps: Vec<InstalledApp> = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse apps file: {}", path.display()))?;
    Ok(apps)
}
