use linch_core::{ExtensionId, LinchError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::extension::{Capabilities, Entries, ExtensionMetadata};

/// File name of an extension's package descriptor.
pub const MANIFEST_FILE: &str = "package.json";

/// The `linchkit` object inside `package.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinchkitSection {
    pub display_name: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub permissions: Vec<String>,
    pub capabilities: Capabilities,
    pub entries: Entries,
    pub dependencies: Vec<String>,
    /// BLAKE3 hash of the hooks entry file for integrity verification.
    pub checksum: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PackageJson {
    name: String,
    version: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    linchkit: Option<LinchkitSection>,
}

/// Parsed extension package descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionManifest {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub linchkit: LinchkitSection,
}

impl ExtensionManifest {
    /// Parse a `package.json` document. `source` only labels errors.
    pub fn from_package_json(raw: &str, source: &str) -> Result<Self> {
        let package: PackageJson = serde_json::from_str(raw)?;
        let linchkit = package.linchkit.ok_or_else(|| {
            LinchError::ManifestNotFound(format!("{}: no linchkit section", source))
        })?;
        Ok(Self {
            name: package.name,
            version: package.version,
            description: package.description,
            linchkit,
        })
    }

    /// Read `<dir>/package.json`.
    pub async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LinchError::ManifestNotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_package_json(&raw, &path.display().to_string())
    }

    pub fn to_metadata(&self) -> ExtensionMetadata {
        let section = &self.linchkit;
        let mut metadata = ExtensionMetadata::new(self.name.as_str(), self.version.as_str());
        metadata.description = self.description.clone();
        metadata.display_name = section.display_name.clone();
        metadata.category = section.category.clone();
        metadata.tags = section.tags.clone();
        metadata.permissions = section.permissions.iter().cloned().collect();
        metadata.dependencies = section
            .dependencies
            .iter()
            .map(|d| ExtensionId::from(d.as_str()))
            .collect();
        metadata.capabilities = section.capabilities.clone();
        metadata.entries = section.entries.clone();
        metadata
    }

    pub fn hooks_entry(&self) -> Option<&str> {
        self.linchkit.entries.hooks.as_deref()
    }

    /// Verify the hooks entry file integrity. No checksum means no verification.
    pub fn verify_checksum(&self, bytes: &[u8]) -> bool {
        match &self.linchkit.checksum {
            Some(expected) => blake3::hash(bytes).to_hex().as_str() == expected.as_str(),
            None => true,
        }
    }
}
