use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two kinds of file a variant can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Model,
    Icon,
}

impl AssetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AssetKind::Model => "model",
            AssetKind::Icon => "icon",
        }
    }

    /// Subdirectory of a pack holding files of this kind.
    pub fn subdir(self) -> &'static str {
        match self {
            AssetKind::Model => "models",
            AssetKind::Icon => "icons",
        }
    }

    /// Extension used for cache files when the source name carries none.
    pub fn default_extension(self) -> &'static str {
        match self {
            AssetKind::Model => "glb",
            AssetKind::Icon => "png",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetKind {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model" => Ok(AssetKind::Model),
            "icon" => Ok(AssetKind::Icon),
            other => Err(IdentityParseError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityParseError {
    #[error("asset key must have four '/'-separated parts, got '{0}'")]
    WrongArity(String),
    #[error("asset key has an empty component: '{0}'")]
    EmptyComponent(String),
    #[error("unknown asset kind '{0}'")]
    UnknownKind(String),
}

/// Names one cacheable file: `(pack, asset, variant, kind)`.
///
/// Equality is structural. [`AssetIdentity::key`] gives the `pack/asset/variant/kind`
/// string every component uses as its map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetIdentity {
    pub pack_id: String,
    pub asset_id: String,
    pub variant_id: String,
    pub kind: AssetKind,
}

impl AssetIdentity {
    pub fn new(
        pack_id: impl Into<String>,
        asset_id: impl Into<String>,
        variant_id: impl Into<String>,
        kind: AssetKind,
    ) -> Self {
        Self {
            pack_id: pack_id.into(),
            asset_id: asset_id.into(),
            variant_id: variant_id.into(),
            kind,
        }
    }

    pub fn model(
        pack_id: impl Into<String>,
        asset_id: impl Into<String>,
        variant_id: impl Into<String>,
    ) -> Self {
        Self::new(pack_id, asset_id, variant_id, AssetKind::Model)
    }

    pub fn icon(
        pack_id: impl Into<String>,
        asset_id: impl Into<String>,
        variant_id: impl Into<String>,
    ) -> Self {
        Self::new(pack_id, asset_id, variant_id, AssetKind::Icon)
    }

    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.pack_id, self.asset_id, self.variant_id, self.kind
        )
    }

    /// Same asset and variant, other kind.
    pub fn with_kind(&self, kind: AssetKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }
}

impl fmt::Display for AssetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for AssetIdentity {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let [pack, asset, variant, kind] = parts.as_slice() else {
            return Err(IdentityParseError::WrongArity(s.to_string()));
        };
        if pack.is_empty() || asset.is_empty() || variant.is_empty() {
            return Err(IdentityParseError::EmptyComponent(s.to_string()));
        }
        Ok(Self::new(*pack, *asset, *variant, kind.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_slash_joined() {
        let id = AssetIdentity::model("pokemon", "025", "default");
        assert_eq!(id.key(), "pokemon/025/default/model");
        assert_eq!(id.with_kind(AssetKind::Icon).key(), "pokemon/025/default/icon");
    }

    #[test]
    fn key_parses_back() {
        let id: AssetIdentity = "pokemon/025/shiny/icon".parse().unwrap();
        assert_eq!(id, AssetIdentity::icon("pokemon", "025", "shiny"));
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!(matches!(
            "pokemon/025/model".parse::<AssetIdentity>(),
            Err(IdentityParseError::WrongArity(_))
        ));
        assert!(matches!(
            "pokemon//default/model".parse::<AssetIdentity>(),
            Err(IdentityParseError::EmptyComponent(_))
        ));
        assert!(matches!(
            "pokemon/025/default/sound".parse::<AssetIdentity>(),
            Err(IdentityParseError::UnknownKind(_))
        ));
    }
}
