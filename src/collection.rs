//! Collection definitions and the partition strategy.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::field::Field;
use crate::opensearch::executor::{REF_ID_FIELD, REF_VERSION_FIELD};
use crate::postgres::executor::{ID_COLUMN, PARTITION_COLUMN};
use crate::postgres::processor::DISTANCE_COLUMN;

/// PostgreSQL silently truncates identifiers longer than this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Names the backends use for their own columns and bookkeeping fields.
const RESERVED_FIELD_NAMES: [&str; 5] = [
    ID_COLUMN,
    PARTITION_COLUMN,
    DISTANCE_COLUMN,
    REF_ID_FIELD,
    REF_VERSION_FIELD,
];

fn default_partitions() -> u32 {
    1
}

fn default_partition_key() -> String {
    "id".to_string()
}

/// Model and field used to turn knn `content` into a query vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingPreset {
    pub model: String,
    pub field: String,
}

/// A named logical dataset.
///
/// In PostgreSQL it is a parent table partitioned into `partitions` child
/// tables; in OpenSearch it is a single index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    pub fields: Vec<Field>,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    /// Record field whose value selects the partition.
    #[serde(default = "default_partition_key")]
    pub partition_key: String,
    #[serde(default)]
    pub embedding: Option<EmbeddingPreset>,
}

impl Collection {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            name: name.into(),
            fields,
            partitions: default_partitions(),
            partition_key: default_partition_key(),
            embedding: None,
        }
    }

    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = key.into();
        self
    }

    pub fn with_embedding(mut self, model: impl Into<String>, field: impl Into<String>) -> Self {
        self.embedding = Some(EmbeddingPreset {
            model: model.into(),
            field: field.into(),
        });
        self
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name() == name)
    }

    pub fn has_vector_fields(&self) -> bool {
        self.fields.iter().any(Field::is_vector)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("collection name must not be empty".into()));
        }
        if self.partitions == 0 {
            return Err(Error::Config(format!(
                "collection `{}` needs at least one partition",
                self.name
            )));
        }
        // the last partition has the longest suffix
        let last = self.partitions - 1;
        check_identifier(&self.partition_name(last))?;

        let mut seen = HashSet::with_capacity(self.fields.len());
        for field in &self.fields {
            let name = field.name();
            if name.is_empty() {
                return Err(Error::Config(format!(
                    "collection `{}` has a field without a name",
                    self.name
                )));
            }
            if RESERVED_FIELD_NAMES.contains(&name) {
                return Err(Error::Config(format!(
                    "field name `{}` of `{}` is reserved",
                    name, self.name
                )));
            }
            if !seen.insert(name) {
                return Err(Error::Config(format!(
                    "field `{}` is defined twice in `{}`",
                    name, self.name
                )));
            }
            if let Field::Vector { dimensions: 0, .. } = field {
                return Err(Error::Config(format!(
                    "vector field `{}` of `{}` needs dimensions > 0",
                    name, self.name
                )));
            }
            check_identifier(name)?;
            if field.indexed() {
                check_identifier(&self.index_name(last, name))?;
            }
        }
        if let Some(preset) = &self.embedding {
            match self.field(&preset.field) {
                Some(f) if f.is_vector() => {}
                _ => {
                    return Err(Error::Config(format!(
                        "embedding field `{}` of `{}` is not a vector field",
                        preset.field, self.name
                    )))
                }
            }
        }
        Ok(())
    }

    /// Name of the child table holding partition `index`.
    pub fn partition_name(&self, index: u32) -> String {
        format!("{}_{}", self.name, index)
    }

    /// Name of the index on `field` in partition `index`.
    pub fn index_name(&self, index: u32, field: &str) -> String {
        format!("{}_{}_idx", self.partition_name(index), field)
    }

    pub fn partition_names(&self) -> Vec<String> {
        (0..self.partitions).map(|i| self.partition_name(i)).collect()
    }

    /// Partition a record lands in, from the value of its partition key.
    ///
    /// Integers map by remainder; anything else by the CRC32 of its string
    /// form, so the mapping is stable across processes.
    pub fn partition_for(&self, key: &Value) -> u32 {
        let n = u64::from(self.partitions.max(1));
        let bucket = match key {
            Value::Number(num) => match (num.as_u64(), num.as_i64()) {
                (Some(u), _) => u % n,
                (None, Some(i)) => i.rem_euclid(n as i64) as u64,
                _ => u64::from(crc32fast::hash(num.to_string().as_bytes())) % n,
            },
            Value::String(s) => u64::from(crc32fast::hash(s.as_bytes())) % n,
            other => u64::from(crc32fast::hash(other.to_string().as_bytes())) % n,
        };
        bucket as u32
    }

    /// Partition for a record, read from its partition key field.
    pub fn partition_for_record(&self, record: &serde_json::Map<String, Value>) -> Result<u32> {
        record
            .get(&self.partition_key)
            .filter(|v| !v.is_null())
            .map(|v| self.partition_for(v))
            .ok_or_else(|| {
                Error::InvalidOperation(format!(
                    "record for `{}` is missing partition key `{}`",
                    self.name, self.partition_key
                ))
            })
    }
}

fn check_identifier(name: &str) -> Result<()> {
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::Config(format!(
            "`{}` is {} bytes long; identifiers are limited to {}",
            name,
            name.len(),
            MAX_IDENTIFIER_LEN
        )));
    }
    Ok(())
}

/// Collection definitions by name, used to route bulk operations.
#[derive(Debug, Clone, Default)]
pub struct CollectionRegistry {
    collections: HashMap<String, Collection>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, collection: Collection) -> Result<()> {
        collection.validate()?;
        self.collections.insert(collection.name.clone(), collection);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Collection> {
        self.collections
            .get(name)
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.collections.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

impl TryFrom<Vec<Collection>> for CollectionRegistry {
    type Error = Error;

    fn try_from(collections: Vec<Collection>) -> Result<Self> {
        let mut registry = Self::new();
        for collection in collections {
            registry.register(collection)?;
        }
        Ok(registry)
    }
}
