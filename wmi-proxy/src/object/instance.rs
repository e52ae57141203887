use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{fold, CimValue};

/// Property bag with case-insensitive names.
///
/// The spelling used on first insert is kept for display and serialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, CimValue>",
    into = "BTreeMap<String, CimValue>"
)]
pub struct PropertyMap {
    entries: BTreeMap<String, (String, CimValue)>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, value: impl Into<CimValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<CimValue>) -> Option<CimValue> {
        let value = value.into();
        match self.entries.get_mut(&fold(name)) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries
                    .insert(fold(name), (name.to_string(), value));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&CimValue> {
        self.entries.get(&fold(name)).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&fold(name))
    }

    pub fn remove(&mut self, name: &str) -> Option<CimValue> {
        self.entries.remove(&fold(name)).map(|(_, v)| v)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CimValue)> {
        self.entries.values().map(|(n, v)| (n.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|(n, _)| n.as_str())
    }

    /// Overwrite entries from `other`, keeping everything else.
    pub fn merge(&mut self, other: &PropertyMap) {
        for (name, value) in other.iter() {
            self.insert(name, value.clone());
        }
    }
}

impl From<BTreeMap<String, CimValue>> for PropertyMap {
    fn from(map: BTreeMap<String, CimValue>) -> Self {
        map.into_iter().collect()
    }
}

impl From<PropertyMap> for BTreeMap<String, CimValue> {
    fn from(map: PropertyMap) -> Self {
        map.entries.into_values().collect()
    }
}

impl<S: AsRef<str>> FromIterator<(S, CimValue)> for PropertyMap {
    fn from_iter<I: IntoIterator<Item = (S, CimValue)>>(iter: I) -> Self {
        let mut map = PropertyMap::new();
        for (name, value) in iter {
            map.insert(name.as_ref(), value);
        }
        map
    }
}

/// A fetched CIM instance: class name, key property names and property values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CimInstance {
    class_name: String,
    #[serde(default)]
    key_names: Vec<String>,
    #[serde(default)]
    properties: PropertyMap,
}

impl CimInstance {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            key_names: Vec::new(),
            properties: PropertyMap::new(),
        }
    }

    /// Add a key-qualified property.
    pub fn with_key(mut self, name: &str, value: impl Into<CimValue>) -> Self {
        if !self.is_key(name) {
            self.key_names.push(name.to_string());
        }
        self.properties.insert(name, value);
        self
    }

    pub fn with_property(mut self, name: &str, value: impl Into<CimValue>) -> Self {
        self.properties.insert(name, value);
        self
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn key_names(&self) -> &[String] {
        &self.key_names
    }

    pub fn is_key(&self, name: &str) -> bool {
        self.key_names.iter().any(|k| k.eq_ignore_ascii_case(name))
    }

    pub fn property(&self, name: &str) -> Option<&CimValue> {
        self.properties.get(name)
    }

    pub fn set_property(&mut self, name: &str, value: impl Into<CimValue>) {
        self.properties.insert(name, value);
    }

    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut PropertyMap {
        &mut self.properties
    }

    pub fn into_properties(self) -> PropertyMap {
        self.properties
    }
}
