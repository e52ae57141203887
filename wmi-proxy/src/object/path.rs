//! WMI object paths: `\\server\namespace:Class.Key="value",Other=5`.

use core::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{fold, CimValue};
use crate::error::{Error, Result};

/// Value of a key property inside an object path.
#[derive(Debug, Clone)]
pub enum KeyValue {
    String(String),
    Integer(i64),
    Boolean(bool),
}

impl KeyValue {
    /// Map a property value onto a key value; `None` for unmappable types.
    pub fn from_cim(value: &CimValue) -> Option<Self> {
        match value {
            CimValue::String(s) => Some(KeyValue::String(s.clone())),
            CimValue::SInt(v) => Some(KeyValue::Integer(*v)),
            CimValue::UInt(v) => i64::try_from(*v).ok().map(KeyValue::Integer),
            CimValue::Bool(b) => Some(KeyValue::Boolean(*b)),
            CimValue::Reference(p) => Some(KeyValue::String(p.to_string())),
            _ => None,
        }
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (KeyValue::String(a), KeyValue::String(b)) => a.to_lowercase() == b.to_lowercase(),
            (KeyValue::Integer(a), KeyValue::Integer(b)) => a == b,
            (KeyValue::Boolean(a), KeyValue::Boolean(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for KeyValue {}

impl Hash for KeyValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            KeyValue::String(s) => {
                0u8.hash(state);
                s.to_lowercase().hash(state);
            }
            KeyValue::Integer(v) => {
                1u8.hash(state);
                v.hash(state);
            }
            KeyValue::Boolean(b) => {
                2u8.hash(state);
                b.hash(state);
            }
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::String(s) => {
                f.write_str("\"")?;
                for c in s.chars() {
                    if c == '"' || c == '\\' {
                        f.write_str("\\")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str("\"")
            }
            KeyValue::Integer(v) => write!(f, "{v}"),
            KeyValue::Boolean(true) => f.write_str("TRUE"),
            KeyValue::Boolean(false) => f.write_str("FALSE"),
        }
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::String(v.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::String(v)
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Integer(v)
    }
}

impl From<i32> for KeyValue {
    fn from(v: i32) -> Self {
        KeyValue::Integer(i64::from(v))
    }
}

impl From<u32> for KeyValue {
    fn from(v: u32) -> Self {
        KeyValue::Integer(i64::from(v))
    }
}

impl From<u16> for KeyValue {
    fn from(v: u16) -> Self {
        KeyValue::Integer(i64::from(v))
    }
}

impl From<bool> for KeyValue {
    fn from(v: bool) -> Self {
        KeyValue::Boolean(v)
    }
}

/// Address of a remote object.
///
/// Server, namespace, class and key names compare case-insensitively, as do
/// string key values. Keys are held sorted by name so equal paths render the
/// same text.
#[derive(Debug, Clone)]
pub struct WmiObjectPath {
    server: String,
    namespace: String,
    class_name: String,
    keys: Vec<(String, KeyValue)>,
}

impl WmiObjectPath {
    pub fn new(
        server: impl Into<String>,
        namespace: impl Into<String>,
        class_name: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            namespace: namespace.into().replace('/', "\\"),
            class_name: class_name.into(),
            keys: Vec::new(),
        }
    }

    /// Add or replace a key value.
    pub fn with_key(mut self, name: &str, value: impl Into<KeyValue>) -> Self {
        let value = value.into();
        let folded = fold(name);
        match self
            .keys
            .binary_search_by(|(existing, _)| fold(existing).cmp(&folded))
        {
            Ok(i) => self.keys[i].1 = value,
            Err(i) => self.keys.insert(i, (name.to_string(), value)),
        }
        self
    }

    /// Same object on another server (used to anchor relative paths).
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = server.into();
        self
    }

    /// Same key values under another class, e.g. a concrete subclass.
    pub fn with_class(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = class_name.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into().replace('/', "\\");
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn keys(&self) -> impl Iterator<Item = (&str, &KeyValue)> {
        self.keys.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn key(&self, name: &str) -> Option<&KeyValue> {
        self.keys
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn key_names(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|(n, _)| n.as_str())
    }

    /// A path with no key values addresses the class itself.
    pub fn is_class_path(&self) -> bool {
        self.keys.is_empty()
    }

    /// `Class.Key="value"` without server and namespace.
    pub fn relative_path(&self) -> String {
        let mut out = self.class_name.clone();
        for (i, (name, value)) in self.keys.iter().enumerate() {
            out.push(if i == 0 { '.' } else { ',' });
            out.push_str(name);
            out.push('=');
            out.push_str(&value.to_string());
        }
        out
    }

    /// Parse a relative path and anchor it to `server` and `namespace`.
    ///
    /// Absolute input keeps its own server and namespace.
    pub fn parse_relative(server: &str, namespace: &str, input: &str) -> Result<Self> {
        let mut path: WmiObjectPath = input.parse()?;
        if path.server.is_empty() {
            path.server = server.to_string();
        }
        if path.namespace.is_empty() {
            path.namespace = namespace.replace('/', "\\");
        }
        Ok(path)
    }
}

impl PartialEq for WmiObjectPath {
    fn eq(&self, other: &Self) -> bool {
        self.server.eq_ignore_ascii_case(&other.server)
            && self.namespace.eq_ignore_ascii_case(&other.namespace)
            && self.class_name.eq_ignore_ascii_case(&other.class_name)
            && self.keys.len() == other.keys.len()
            && self
                .keys
                .iter()
                .zip(&other.keys)
                .all(|((an, av), (bn, bv))| an.eq_ignore_ascii_case(bn) && av == bv)
    }
}

impl Eq for WmiObjectPath {}

impl Hash for WmiObjectPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        fold(&self.server).hash(state);
        fold(&self.namespace).hash(state);
        fold(&self.class_name).hash(state);
        for (name, value) in &self.keys {
            fold(name).hash(state);
            value.hash(state);
        }
    }
}

impl fmt::Display for WmiObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.server.is_empty() {
            write!(f, "\\\\{}\\", self.server)?;
        }
        if !self.namespace.is_empty() {
            write!(f, "{}:", self.namespace)?;
        }
        f.write_str(&self.relative_path())
    }
}

impl FromStr for WmiObjectPath {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let invalid = |msg: &str| Error::invalid_path(trimmed, msg);

        // Separators are only normalized ahead of the first key value.
        let boundary = trimmed.find(&['"', '='][..]).unwrap_or(trimmed.len());
        let head = trimmed[..boundary].replace('/', "\\");
        let tail = &trimmed[boundary..];

        let (server, rest) = match head.strip_prefix("\\\\") {
            Some(stripped) => {
                let idx = stripped
                    .find('\\')
                    .ok_or_else(|| invalid("missing namespace after server name"))?;
                (stripped[..idx].to_string(), &stripped[idx + 1..])
            }
            None => (String::new(), head.as_str()),
        };
        let (namespace, class_part) = match rest.rfind(':') {
            Some(idx) => (rest[..idx].to_string(), &rest[idx + 1..]),
            None => (String::new(), rest),
        };
        if !server.is_empty() && namespace.is_empty() {
            return Err(invalid("missing namespace after server name"));
        }

        let object = format!("{class_part}{tail}");
        let (class_name, key_text) = match object.find('.') {
            Some(idx) => (&object[..idx], Some(&object[idx + 1..])),
            None => match object.strip_suffix("=@") {
                Some(singleton) => (singleton, None),
                None => (object.as_str(), None),
            },
        };
        if class_name.is_empty()
            || !class_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(invalid("missing or malformed class name"));
        }

        let mut path = WmiObjectPath::new(server, namespace, class_name);
        if let Some(text) = key_text {
            for (name, value) in parse_keys(text).map_err(|msg| invalid(&msg))? {
                if path.key(&name).is_some() {
                    return Err(invalid(&format!("duplicate key '{name}'")));
                }
                path = path.with_key(&name, value);
            }
        }
        Ok(path)
    }
}

fn parse_keys(text: &str) -> core::result::Result<Vec<(String, KeyValue)>, String> {
    let mut keys = Vec::new();
    let mut chars = text.chars().peekable();
    loop {
        let mut name = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            name.push(c);
        }
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err("empty key name".to_string());
        }

        let value = if chars.peek() == Some(&'"') {
            chars.next();
            let mut s = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some(e @ ('"' | '\\')) => s.push(e),
                        Some(other) => {
                            s.push('\\');
                            s.push(other);
                        }
                        None => return Err("unterminated escape".to_string()),
                    },
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => s.push(other),
                }
            }
            if !closed {
                return Err(format!("unterminated string value for key '{name}'"));
            }
            KeyValue::String(s)
        } else {
            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                token.push(c);
                chars.next();
            }
            let token = token.trim();
            if let Ok(v) = token.parse::<i64>() {
                KeyValue::Integer(v)
            } else if token.eq_ignore_ascii_case("true") {
                KeyValue::Boolean(true)
            } else if token.eq_ignore_ascii_case("false") {
                KeyValue::Boolean(false)
            } else {
                return Err(format!("unsupported value '{token}' for key '{name}'"));
            }
        };
        keys.push((name, value));

        match chars.next() {
            None => return Ok(keys),
            Some(',') => continue,
            Some(c) => return Err(format!("unexpected '{c}' after key value")),
        }
    }
}

impl Serialize for WmiObjectPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WmiObjectPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(p: &WmiObjectPath) -> u64 {
        let mut h = DefaultHasher::new();
        p.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_parse_absolute_path() {
        let path: WmiObjectPath = r#"\\HOST1\root\virtualization\v2:Msvm_ComputerSystem.CreationClassName="Msvm_ComputerSystem",Name="4764334D-E001-4176-82EE-5594EC9B530E""#
            .parse()
            .unwrap();
        assert_eq!(path.server(), "HOST1");
        assert_eq!(path.namespace(), r"root\virtualization\v2");
        assert_eq!(path.class_name(), "Msvm_ComputerSystem");
        assert_eq!(
            path.key("name"),
            Some(&KeyValue::from("4764334D-E001-4176-82EE-5594EC9B530E"))
        );
    }

    #[test]
    fn test_display_round_trip() {
        let path = WmiObjectPath::new("HOST1", r"root\virtualization\v2", "Msvm_Job")
            .with_key("InstanceID", r#"a "quoted" \ value"#)
            .with_key("Index", 5i64)
            .with_key("Enabled", true);
        let text = path.to_string();
        assert_eq!(
            text,
            r#"\\HOST1\root\virtualization\v2:Msvm_Job.Enabled=TRUE,Index=5,InstanceID="a \"quoted\" \\ value""#
        );
        let back: WmiObjectPath = text.parse().unwrap();
        assert_eq!(back, path);
    }

    #[test]
    fn test_forward_slashes_normalized_before_keys() {
        let path: WmiObjectPath = r#"//host/root/cimv2:Win32_Directory.Name="c:/temp""#.parse().unwrap();
        assert_eq!(path.server(), "host");
        assert_eq!(path.namespace(), r"root\cimv2");
        assert_eq!(path.key("Name"), Some(&KeyValue::from("c:/temp")));
    }

    #[test]
    fn test_equality_is_case_insensitive() {
        let a = WmiObjectPath::new("HOST1", r"root\virtualization\v2", "Msvm_ComputerSystem")
            .with_key("Name", "ABC")
            .with_key("CreationClassName", "Msvm_ComputerSystem");
        let b = WmiObjectPath::new("host1", r"ROOT\Virtualization\V2", "msvm_computersystem")
            .with_key("creationclassname", "MSVM_COMPUTERSYSTEM")
            .with_key("NAME", "abc");
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_integer_and_string_keys_differ() {
        let a = WmiObjectPath::new("h", "ns", "C").with_key("Id", 5i64);
        let b = WmiObjectPath::new("h", "ns", "C").with_key("Id", "5");
        assert_ne!(a, b);
    }

    #[test]
    fn test_relative_paths() {
        let path = WmiObjectPath::parse_relative("HOST2", r"root\cimv2", r#"Win32_Service.Name="vmms""#)
            .unwrap();
        assert_eq!(path.server(), "HOST2");
        assert_eq!(path.namespace(), r"root\cimv2");
        assert_eq!(path.relative_path(), r#"Win32_Service.Name="vmms""#);

        let singleton: WmiObjectPath = "Msvm_Singleton=@".parse().unwrap();
        assert!(singleton.is_class_path());
        assert_eq!(singleton.class_name(), "Msvm_Singleton");
    }

    #[test]
    fn test_malformed_paths() {
        for bad in [
            r"\\HOST1",
            r#"\\HOST1\root:.Name="x""#,
            r#"Msvm_Job.InstanceID="open"#,
            "Msvm_Job.Id=abc",
            r#"Msvm_Job.Id=1,Id=2"#,
            r#"Msvm_Job.="x""#,
        ] {
            let err = bad.parse::<WmiObjectPath>().unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::InvalidPath, "{bad}");
        }
    }

    #[test]
    fn test_key_value_from_cim() {
        assert_eq!(
            KeyValue::from_cim(&CimValue::UInt(7)),
            Some(KeyValue::Integer(7))
        );
        assert_eq!(KeyValue::from_cim(&CimValue::UInt(u64::MAX)), None);
        assert_eq!(KeyValue::from_cim(&CimValue::Real(1.5)), None);
        assert_eq!(KeyValue::from_cim(&CimValue::Null), None);
    }
}
