use crate::error::ManifestError;
use crate::identity::{AssetIdentity, AssetKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Raw shape of a pack `manifest.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackManifest {
    #[serde(default)]
    pub pack_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub assets: BTreeMap<String, AssetDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub variants: BTreeMap<String, AssetVariant>,
}

/// File names of one variant, relative to the pack's `models/` and `icons/` folders.
///
/// Older manifests spell the fields `model` and `icon`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetVariant {
    #[serde(default, alias = "model", skip_serializing_if = "Option::is_none")]
    pub model_file: Option<String>,
    #[serde(default, alias = "icon", skip_serializing_if = "Option::is_none")]
    pub icon_file: Option<String>,
}

impl AssetVariant {
    pub fn file(&self, kind: AssetKind) -> Option<&str> {
        match kind {
            AssetKind::Model => self.model_file.as_deref(),
            AssetKind::Icon => self.icon_file.as_deref(),
        }
    }
}

/// A validated pack. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPack {
    pub pack_id: String,
    pub display_name: String,
    pub version: Option<String>,
    /// Directory holding `models/` and `icons/`; `None` for remote-only packs.
    pub base_path: Option<PathBuf>,
    /// URL prefix holding `models/` and `icons/`; `None` for local-only packs.
    pub base_url: Option<String>,
    pub assets: BTreeMap<String, AssetDescriptor>,
}

impl AssetPack {
    /// Parses and validates manifest JSON.
    pub fn parse(json: &str, base_path: Option<PathBuf>) -> Result<Self, ManifestError> {
        let manifest: PackManifest = serde_json::from_str(json)?;
        Self::from_manifest(manifest, base_path)
    }

    pub fn from_manifest(
        manifest: PackManifest,
        base_path: Option<PathBuf>,
    ) -> Result<Self, ManifestError> {
        let pack_id = manifest.pack_id.trim().to_string();
        if pack_id.is_empty() {
            return Err(ManifestError::MissingPackId);
        }
        check_id("pack", &pack_id)?;
        for (asset_id, descriptor) in &manifest.assets {
            check_id("asset", asset_id)?;
            for variant_id in descriptor.variants.keys() {
                check_id("variant", variant_id)?;
            }
        }

        let display_name = if manifest.display_name.is_empty() {
            pack_id.clone()
        } else {
            manifest.display_name
        };

        Ok(Self {
            pack_id,
            display_name,
            version: manifest.version,
            base_path,
            base_url: manifest.base_url.filter(|u| !u.trim().is_empty()),
            assets: manifest.assets,
        })
    }

    pub fn variant(&self, asset_id: &str, variant_id: &str) -> Option<&AssetVariant> {
        self.assets.get(asset_id)?.variants.get(variant_id)
    }

    pub fn file_name(&self, identity: &AssetIdentity) -> Option<&str> {
        if identity.pack_id != self.pack_id {
            return None;
        }
        self.variant(&identity.asset_id, &identity.variant_id)?
            .file(identity.kind)
    }

    /// Where the bundled file would live. Does not check that it exists.
    pub fn local_path(&self, identity: &AssetIdentity) -> Option<PathBuf> {
        let base = self.base_path.as_ref()?;
        let file = self.file_name(identity)?;
        if is_absolute_url(file) {
            return None;
        }
        Some(base.join(identity.kind.subdir()).join(file))
    }

    /// Download URL for the file. An absolute URL in the manifest is used as-is.
    pub fn remote_url(&self, identity: &AssetIdentity) -> Option<String> {
        let file = self.file_name(identity)?;
        if is_absolute_url(file) {
            return Some(file.to_string());
        }
        let base = self.base_url.as_deref()?;
        Some(format!(
            "{}/{}/{}",
            base.trim_end_matches('/'),
            identity.kind.subdir(),
            file
        ))
    }

    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }
}

fn is_absolute_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

fn check_id(what: &'static str, id: &str) -> Result<(), ManifestError> {
    if id.is_empty() || id.contains('/') || id == "." || id == ".." {
        return Err(ManifestError::InvalidId {
            what,
            id: id.to_string(),
        });
    }
    Ok(())
}
