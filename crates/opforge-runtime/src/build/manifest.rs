//! Persisted build manifest.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use opforge_core::{IdCode, OpforgeError, Result};

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 2;

/// Build state of one source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManifest {
    /// Format version.
    pub version: u32,
    /// Id of the current artifacts. Never decreases.
    pub build_id: u64,
    /// SHA-256 of the source at the last successful build.
    #[serde(default)]
    pub source_fingerprint: String,
    /// Non-template signatures present in the current artifacts.
    #[serde(default)]
    pub ordinary_functions: BTreeSet<IdCode>,
    /// Template instantiations present in the current artifacts, with their generated code.
    #[serde(default)]
    pub template_functions: BTreeMap<IdCode, String>,
}

impl Default for BuildManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            build_id: 0,
            source_fingerprint: String::new(),
            ordinary_functions: BTreeSet::new(),
            template_functions: BTreeMap::new(),
        }
    }
}

impl BuildManifest {
    /// Decode manifest text.
    ///
    /// Empty text yields a fresh manifest. A version newer than
    /// [`MANIFEST_VERSION`] is an error. An older version yields an empty
    /// manifest that keeps the build id, flagged stale by the second value.
    pub fn decode(text: &str) -> Result<(Self, bool)> {
        if text.trim().is_empty() {
            return Ok((Self::default(), false));
        }
        let raw: Value =
            serde_json::from_str(text).map_err(|e| OpforgeError::Manifest(e.to_string()))?;
        let version = raw
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| OpforgeError::Manifest("missing `version`".to_string()))?;

        if version > u64::from(MANIFEST_VERSION) {
            return Err(OpforgeError::Version {
                found: u32::try_from(version).unwrap_or(u32::MAX),
                supported: MANIFEST_VERSION,
            });
        }
        if version < u64::from(MANIFEST_VERSION) {
            let build_id = raw.get("build_id").and_then(Value::as_u64).unwrap_or(0);
            return Ok((
                Self {
                    build_id,
                    ..Self::default()
                },
                true,
            ));
        }

        let manifest =
            serde_json::from_value(raw).map_err(|e| OpforgeError::Manifest(e.to_string()))?;
        Ok((manifest, false))
    }

    /// Encode as pretty JSON.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| OpforgeError::Manifest(e.to_string()))
    }

    /// Whether `idcode` is compiled into the current artifacts.
    pub fn contains(&self, idcode: &IdCode, is_template: bool) -> bool {
        if is_template {
            self.template_functions.contains_key(idcode)
        } else {
            self.ordinary_functions.contains(idcode)
        }
    }

    /// Every signature in the current artifacts, ordinary ones first.
    pub fn entries(&self) -> Vec<IdCode> {
        self.ordinary_functions
            .iter()
            .chain(self.template_functions.keys())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(text: &str) -> IdCode {
        IdCode::parse(text).unwrap()
    }

    #[test]
    fn test_empty_is_fresh() {
        let (manifest, stale) = BuildManifest::decode("  \n").unwrap();
        assert_eq!(manifest, BuildManifest::default());
        assert!(!stale);
    }

    #[test]
    fn test_encode_decode() {
        let mut manifest = BuildManifest {
            build_id: 3,
            source_fingerprint: "abc".to_string(),
            ..Default::default()
        };
        manifest.ordinary_functions.insert(id("add:int"));
        manifest
            .template_functions
            .insert(id("scale:float*"), "// code".to_string());

        let text = manifest.encode().unwrap();
        assert!(text.contains("\"version\": 2"));
        let (back, stale) = BuildManifest::decode(&text).unwrap();
        assert_eq!(back, manifest);
        assert!(!stale);
        assert_eq!(back.entries(), vec![id("add:int"), id("scale:float*")]);
        assert!(back.contains(&id("scale:float*"), true));
        assert!(!back.contains(&id("scale:float*"), false));
    }

    #[test]
    fn test_newer_version_rejected() {
        let err = BuildManifest::decode(r#"{"version": 99, "build_id": 1, "future": {}}"#).unwrap_err();
        assert!(matches!(
            err,
            OpforgeError::Version {
                found: 99,
                supported: MANIFEST_VERSION
            }
        ));
    }

    #[test]
    fn test_older_version_is_stale() {
        let text = r#"{"version": 1, "build_id": 7, "ordinary_functions": ["f:int"], "template_functions": {}}"#;
        let (manifest, stale) = BuildManifest::decode(text).unwrap();
        assert!(stale);
        assert_eq!(manifest.version, MANIFEST_VERSION);
        assert_eq!(manifest.build_id, 7);
        assert!(manifest.ordinary_functions.is_empty());
    }

    #[test]
    fn test_garbage_is_manifest_error() {
        assert!(matches!(
            BuildManifest::decode("{not json"),
            Err(OpforgeError::Manifest(_))
        ));
        assert!(matches!(
            BuildManifest::decode("{}"),
            Err(OpforgeError::Manifest(_))
        ));
    }
}
