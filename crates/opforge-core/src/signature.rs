//! Signature encoding.
//!
//! An [`IdCode`] is the canonical text form of a function name plus its
//! concrete argument types, e.g. `add:const float*,float*,int`. Its
//! [`symbol`](IdCode::symbol) is a short, linker-safe name built from a
//! SHA-256 digest of the part after the name.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::DType;

/// Number of hex digits of the digest kept in a hashed symbol.
pub const SYMBOL_HASH_LEN: usize = 8;

/// Canonical identifier of a function signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdCode(String);

impl IdCode {
    /// Build the IdCode for `name` called with `types`.
    pub fn new(name: &str, types: &[DType]) -> Self {
        let types = types
            .iter()
            .map(DType::cname)
            .collect::<Vec<_>>()
            .join(",");
        Self(format!("{}:{}", name, types))
    }

    /// Wrap a persisted IdCode string.
    ///
    /// Returns `None` when the text has no `name:` prefix.
    pub fn parse(text: &str) -> Option<Self> {
        match text.split_once(':') {
            Some((name, _)) if !name.is_empty() => Some(Self(text.to_string())),
            _ => None,
        }
    }

    /// The canonical string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Function name part.
    pub fn function_name(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(name, _)| name)
    }

    /// Comma-joined type list part.
    pub fn type_list(&self) -> &str {
        self.0.split_once(':').map_or("", |(_, types)| types)
    }

    /// Hashed, linkable symbol name: `<name>_<8 hex digits>`.
    pub fn symbol(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.type_list().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        format!("{}_{}", self.function_name(), &digest[..SYMBOL_HASH_LEN])
    }
}

impl fmt::Display for IdCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScalarType;

    fn add_types(elem: ScalarType) -> Vec<DType> {
        vec![
            DType::const_pointer(elem),
            DType::const_pointer(elem),
            DType::pointer(elem),
            DType::scalar(ScalarType::I32),
        ]
    }

    #[test]
    fn test_idcode_format() {
        let id = IdCode::new("add", &add_types(ScalarType::I32));
        assert_eq!(id.as_str(), "add:const int*,const int*,int*,int");
        assert_eq!(id.function_name(), "add");
        assert_eq!(id.type_list(), "const int*,const int*,int*,int");
    }

    #[test]
    fn test_idcode_equality_tracks_qualifiers() {
        let a = IdCode::new("f", &[DType::const_pointer(ScalarType::F32)]);
        let b = IdCode::new("f", &[DType::pointer(ScalarType::F32)]);
        let c = IdCode::new("f", &[DType::scalar(ScalarType::F32)]);
        let d = IdCode::new("f", &[DType::const_pointer(ScalarType::F32)]);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        assert_eq!(a, d);
        assert_eq!(a.symbol(), d.symbol());
    }

    #[test]
    fn test_symbol_shape_and_determinism() {
        let int_id = IdCode::new("add", &add_types(ScalarType::I32));
        let float_id = IdCode::new("add", &add_types(ScalarType::F32));
        let sym = int_id.symbol();
        assert!(sym.starts_with("add_"));
        assert_eq!(sym.len(), "add_".len() + SYMBOL_HASH_LEN);
        assert!(sym["add_".len()..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sym, int_id.symbol());
        assert_ne!(sym, float_id.symbol());
    }

    #[test]
    fn test_symbol_hashes_only_type_list() {
        let types = add_types(ScalarType::F64);
        let a = IdCode::new("alpha", &types).symbol();
        let b = IdCode::new("beta", &types).symbol();
        assert_eq!(a["alpha_".len()..], b["beta_".len()..]);
    }

    #[test]
    fn test_parse_and_serde() {
        assert!(IdCode::parse("no_colon").is_none());
        let id = IdCode::parse("f:int").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"f:int\"");
        let back: IdCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_empty_parameter_list() {
        let id = IdCode::new("noop", &[]);
        assert_eq!(id.as_str(), "noop:");
        assert!(id.symbol().starts_with("noop_"));
    }
}
