//! Materialized policy: the object graph resolved from a `PolicyData`
//! manifest, with every referenced snapshot fetched from the store.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{Error, Storable};

/// Fully-materialized policy object graph: namespace -> kind -> name -> object.
/// The policy language itself is opaque here; objects are held as `dyn Storable`.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    objects: BTreeMap<String, BTreeMap<String, BTreeMap<String, Arc<dyn Storable>>>>,
}

impl Policy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_object(&mut self, obj: Arc<dyn Storable>) -> Result<(), Error> {
        let by_kind = self.objects.entry(obj.namespace().to_string()).or_default();
        let by_name = by_kind.entry(obj.kind().to_string()).or_default();
        let name = obj.name();
        if by_name.contains_key(&name) {
            return Err(Error::Contract(format!(
                "duplicate object in policy: {}:{}:{}",
                obj.namespace(),
                obj.kind(),
                name
            )));
        }
        by_name.insert(name, obj);
        Ok(())
    }

    pub fn get_object(&self, namespace: &str, kind: &str, name: &str) -> Option<&Arc<dyn Storable>> {
        self.objects.get(namespace)?.get(kind)?.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Storable>> {
        self.objects
            .values()
            .flat_map(|by_kind| by_kind.values())
            .flat_map(|by_name| by_name.values())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.values().all(|k| k.values().all(|n| n.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ComponentInstance, ComponentKey};

    fn obj(name: &str) -> Arc<dyn Storable> {
        Arc::new(ComponentInstance::new(
            ComponentKey::new("main", "web", name, "prod"),
            None,
            serde_json::Value::Null,
        ))
    }

    #[test]
    fn add_and_get() {
        let mut policy = Policy::new();
        let a = obj("a");
        let name = a.name();
        policy.add_object(a).unwrap();
        assert_eq!(policy.len(), 1);
        assert!(policy.get_object("system", "component-instance", &name).is_some());
    }

    #[test]
    fn duplicate_object_is_error() {
        let mut policy = Policy::new();
        policy.add_object(obj("a")).unwrap();
        let err = policy.add_object(obj("a")).unwrap_err();
        assert!(err.to_string().contains("duplicate object"));
    }
}
