//! Typed field descriptors consumed by the executors.
//!
//! A field's kind decides how it is laid out in each backend: the column type
//! and byte width in PostgreSQL, the mapping type in OpenSearch. Fields are
//! immutable once a collection has been created with them; changing a vector's
//! `dimensions` means creating a new collection.

use serde::{Deserialize, Serialize};

/// A single field of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Field {
    /// Dense float vector used for nearest-neighbor search.
    Vector {
        name: String,
        dimensions: u32,
        #[serde(default)]
        indexed: bool,
    },
    /// 64-bit integer.
    Bigint {
        name: String,
        #[serde(default)]
        indexed: bool,
    },
    /// Text searched by exact prefix.
    Prefix {
        name: String,
        #[serde(default)]
        indexed: bool,
    },
    /// Exact-match text.
    Keyword {
        name: String,
        #[serde(default)]
        indexed: bool,
    },
    /// Free text.
    Text {
        name: String,
        #[serde(default)]
        indexed: bool,
    },
}

impl Field {
    pub fn vector(name: impl Into<String>, dimensions: u32, indexed: bool) -> Self {
        Field::Vector {
            name: name.into(),
            dimensions,
            indexed,
        }
    }

    pub fn bigint(name: impl Into<String>, indexed: bool) -> Self {
        Field::Bigint {
            name: name.into(),
            indexed,
        }
    }

    pub fn prefix(name: impl Into<String>, indexed: bool) -> Self {
        Field::Prefix {
            name: name.into(),
            indexed,
        }
    }

    pub fn keyword(name: impl Into<String>, indexed: bool) -> Self {
        Field::Keyword {
            name: name.into(),
            indexed,
        }
    }

    pub fn text(name: impl Into<String>, indexed: bool) -> Self {
        Field::Text {
            name: name.into(),
            indexed,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Field::Vector { name, .. }
            | Field::Bigint { name, .. }
            | Field::Prefix { name, .. }
            | Field::Keyword { name, .. }
            | Field::Text { name, .. } => name,
        }
    }

    pub fn indexed(&self) -> bool {
        match self {
            Field::Vector { indexed, .. }
            | Field::Bigint { indexed, .. }
            | Field::Prefix { indexed, .. }
            | Field::Keyword { indexed, .. }
            | Field::Text { indexed, .. } => *indexed,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Field::Vector { .. } => "vector",
            Field::Bigint { .. } => "bigint",
            Field::Prefix { .. } => "prefix",
            Field::Keyword { .. } => "keyword",
            Field::Text { .. } => "text",
        }
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, Field::Vector { .. })
    }

    /// Storage width in bytes for fixed-width kinds, `None` for variable-width.
    ///
    /// pgvector stores each dimension as a 4-byte float.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            Field::Vector { dimensions, .. } => Some(*dimensions as usize * 4),
            Field::Bigint { .. } => Some(8),
            Field::Prefix { .. } | Field::Keyword { .. } | Field::Text { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width() {
        assert_eq!(Field::vector("embedding", 768, true).fixed_width(), Some(3072));
        assert_eq!(Field::bigint("project_id", true).fixed_width(), Some(8));
        assert_eq!(Field::prefix("path", true).fixed_width(), None);
        assert_eq!(Field::text("content", false).fixed_width(), None);
    }

    #[test]
    fn test_accessors() {
        let field = Field::keyword("status", true);
        assert_eq!(field.name(), "status");
        assert!(field.indexed());
        assert_eq!(field.kind_name(), "keyword");
        assert!(!field.is_vector());
        assert!(Field::vector("v", 3, false).is_vector());
    }

    #[test]
    fn test_deserialize_from_toml() {
        let field: Field = toml::from_str(
            r#"
            kind = "vector"
            name = "embedding"
            dimensions = 768
            indexed = true
            "#,
        )
        .unwrap();
        assert_eq!(field, Field::vector("embedding", 768, true));

        let field: Field = toml::from_str("kind = \"bigint\"\nname = \"project_id\"").unwrap();
        assert_eq!(field, Field::bigint("project_id", false));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let err = toml::from_str::<Field>("kind = \"geo_point\"\nname = \"loc\"").unwrap_err();
        assert!(err.to_string().contains("geo_point"));
    }
}
