//! Type catalog: kind registration with codec hooks and static index
//! descriptors, built once at startup.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Error, Storable};

/// Declares a secondary index on one field of a storable type. The extractor
/// returns the rendered index value for an object, or `None` to leave the
/// object out of the index.
#[derive(Clone)]
pub struct IndexDescriptor {
    pub field: &'static str,
    pub extract: fn(&dyn Storable) -> Option<String>,
}

/// Registration record for one kind: whether it is versioned, how to encode
/// and decode it, and which fields are indexed. Encode/decode are captured as
/// monomorphized function pointers at registration time, so the store never
/// needs to know concrete types.
#[derive(Clone)]
pub struct TypeInfo {
    pub kind: &'static str,
    pub versioned: bool,
    pub indexes: Vec<IndexDescriptor>,
    encode: fn(&dyn Storable) -> Result<Vec<u8>, Error>,
    decode: fn(&[u8]) -> Result<Box<dyn Storable>, Error>,
}

impl TypeInfo {
    pub fn new<T>(kind: &'static str, versioned: bool) -> Self
    where
        T: Storable + Serialize + DeserializeOwned,
    {
        fn encode_impl<T: Storable + Serialize>(obj: &dyn Storable) -> Result<Vec<u8>, Error> {
            let typed = obj
                .as_any()
                .downcast_ref::<T>()
                .ok_or_else(|| Error::Contract(format!("object is not of kind '{}'", obj.kind())))?;
            let text = serde_yaml::to_string(typed).map_err(|e| Error::Codec(e.to_string()))?;
            Ok(text.into_bytes())
        }

        fn decode_impl<T: Storable + DeserializeOwned>(
            bytes: &[u8],
        ) -> Result<Box<dyn Storable>, Error> {
            let typed: T = serde_yaml::from_slice(bytes).map_err(|e| Error::Codec(e.to_string()))?;
            Ok(Box::new(typed))
        }

        TypeInfo {
            kind,
            versioned,
            indexes: Vec::new(),
            encode: encode_impl::<T>,
            decode: decode_impl::<T>,
        }
    }

    pub fn with_index(mut self, index: IndexDescriptor) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn encode(&self, obj: &dyn Storable) -> Result<Vec<u8>, Error> {
        (self.encode)(obj)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Storable>, Error> {
        (self.decode)(bytes)
    }
}

/// Kind registry. Registration mistakes (empty kind, duplicates) and lookups
/// of unregistered kinds are deployment errors and panic.
#[derive(Default)]
pub struct Catalog {
    kinds: HashMap<&'static str, TypeInfo>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, info: TypeInfo) {
        if info.kind.is_empty() {
            panic!("kind can't be empty");
        }
        if self.kinds.contains_key(info.kind) {
            panic!("kind can't be duplicated: {}", info.kind);
        }
        self.kinds.insert(info.kind, info);
    }

    pub fn get(&self, kind: &str) -> &TypeInfo {
        match self.kinds.get(kind) {
            Some(info) => info,
            None => panic!("kind '{}' isn't registered", kind),
        }
    }

    pub fn lookup(&self, kind: &str) -> Option<&TypeInfo> {
        self.kinds.get(kind)
    }
}
