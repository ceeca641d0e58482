// ============================================
// RTA Builder - catalog.rs
// ============================================
// The list of tools a build can add to the image (tools_config.json).
//
// Format - a JSON array:
//   [
//     { "name": "Nmap", "description": "Network scanner",
//       "category": "Reconnaissance", "selected": true },
//     ...
//   ]
//
// If the file doesn't exist yet it is created with the built-in list, so
// users have something to edit.
// ============================================

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "uncategorized")]
    pub category: String,
    /// Selected by default
    #[serde(default)]
    pub selected: bool,
}

fn uncategorized() -> String {
    "Uncategorized".to_string()
}

impl ToolEntry {
    fn new(name: &str, description: &str, category: &str, selected: bool) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            selected,
        }
    }
}

/// The built-in catalog
pub fn default_catalog() -> Vec<ToolEntry> {
    vec![
        ToolEntry::new("Nmap", "Network scanner", "Reconnaissance", true),
        ToolEntry::new("Metasploit", "Penetration testing framework", "Exploitation", true),
        ToolEntry::new("Wireshark", "Network protocol analyzer", "Packet Analysis", true),
        ToolEntry::new("Burp Suite", "Web vulnerability scanner", "Web Application", true),
        ToolEntry::new("John the Ripper", "Password cracker", "Password Attacks", false),
        ToolEntry::new("Hydra", "Login cracker", "Password Attacks", false),
        ToolEntry::new("Aircrack-ng", "Wireless security tools", "Wireless", false),
        ToolEntry::new("SQLmap", "SQL injection tool", "Web Application", false),
        ToolEntry::new("Responder", "LLMNR/NBT-NS/mDNS poisoner", "Network Attacks", false),
        ToolEntry::new("CrackMapExec", "Post-exploitation tool", "Post Exploitation", false),
    ]
}

/// Read the catalog, writing the built-in one first if the file is missing
pub fn load_or_create(path: &Path) -> Result<Vec<ToolEntry>> {
    if !path.exists() {
        let catalog = default_catalog();
        let json = serde_json::to_string_pretty(&catalog)?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Created default tool catalog at {}", path.display());
        return Ok(catalog);
    }

    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let catalog: Vec<ToolEntry> =
        serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(catalog)
}

/// Group entries by category, categories in first-seen order
pub fn by_category(catalog: &[ToolEntry]) -> Vec<(&str, Vec<&ToolEntry>)> {
    let mut groups: Vec<(&str, Vec<&ToolEntry>)> = Vec::new();
    for entry in catalog {
        match groups.iter_mut().find(|(category, _)| *category == entry.category) {
            Some((_, entries)) => entries.push(entry),
            None => groups.push((entry.category.as_str(), vec![entry])),
        }
    }
    groups
}

/// Names of the entries selected by default
pub fn selected_names(catalog: &[ToolEntry]) -> Vec<String> {
    catalog
        .iter()
        .filter(|entry| entry.selected)
        .map(|entry| entry.name.clone())
        .collect()
}

/// Case-insensitive lookup by name
pub fn find<'a>(catalog: &'a [ToolEntry], name: &str) -> Option<&'a ToolEntry> {
    catalog.iter().find(|entry| entry.name.eq_ignore_ascii_case(name.trim()))
}
