//! Web IDL interface database: maps observed receiver/member pairs back
//! to the interface that defines the member, so polymorphic receivers
//! aggregate under one feature name.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use vv8_post_trace::record::RecordOp;

/// Top-level names the engine reports for plain JS globals, which no IDL
/// file will ever define.
pub const GLOBAL_JS_OBJECTS: &[&str] = &[
    // Non-standard properties
    "Console",
    "Save",
    "hasOwnProperty",
    "setImmediate",
    "setTimeout",
    "clearImmediate",
    // Standard properties
    "globalThis",
    "Infinity",
    "NaN",
    "undefined",
    "eval",
    "isFinite",
    "isNaN",
    "parseFloat",
    "parseInt",
    "decodeURI",
    "decodeURIComponent",
    "encodeURI",
    "encodeURIComponent",
    "escape",
    "unescape",
    "Object",
    "Function",
    "Boolean",
    "Symbol",
    "Error",
    "AggregateError",
    "EvalError",
    "RangeError",
    "ReferenceError",
    "SyntaxError",
    "TypeError",
    "URIError",
    "InternalError",
    "Number",
    "BigInt",
    "Math",
    "Date",
    "Array",
    "Int8Array",
    "Uint8Array",
    "Uint8ClampedArray",
    "Int16Array",
    "Uint16Array",
    "Int32Array",
    "Uint32Array",
    "BigInt64Array",
    "BigUint64Array",
    "Float32Array",
    "Float64Array",
    "String",
    "RegExp",
    "Map",
    "Set",
    "WeakMap",
    "WeakSet",
    "ArrayBuffer",
    "SharedArrayBuffer",
    "DataView",
    "Atomics",
    "JSON",
    "Iterator",
    "AsyncIterator",
    "Promise",
    "GeneratorFunction",
    "AsyncGeneratorFunction",
    "Generator",
    "AsyncGenerator",
    "AsyncFunction",
    "WeakRef",
    "FinalizationRegistry",
    "Intl",
    "Reflect",
    "Proxy",
];

#[derive(Debug, Default, Clone, Deserialize)]
pub struct IdlInterface {
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default, rename = "aliasFor")]
    pub alias_for: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub properties: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    Property,
    Method,
    Constructor,
}

#[derive(Debug, Clone)]
pub struct IdlInfo {
    pub base_interface: String,
    pub role: MemberRole,
}

#[derive(Debug, Error)]
pub enum IdlError {
    #[error("no such interface name '{0}'")]
    UnknownInterface(String),
    #[error("interface '{interface}' has no such member name '{member}'")]
    UnknownMember { interface: String, member: String },
    #[error("alias/parent cycle at interface '{0}'")]
    Cycle(String),
}

/// Read-only interface tree, immutable after load and shared by
/// reference across aggregators.
#[derive(Debug, Default)]
pub struct IdlTree {
    interfaces: HashMap<String, IdlInterface>,
}

// Alias/parent chains in real IDL data are shallow; anything deeper than
// this is a cycle in the database.
const MAX_CHAIN_DEPTH: usize = 64;

impl IdlTree {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> anyhow::Result<Self> {
        let mut interfaces: HashMap<String, IdlInterface> = serde_json::from_str(data)?;
        // Member lists are binary-searched; sort once up front.
        for iface in interfaces.values_mut() {
            iface.properties.sort_unstable();
            iface.methods.sort_unstable();
        }
        Ok(Self { interfaces })
    }

    pub fn get(&self, name: &str) -> Option<&IdlInterface> {
        self.interfaces.get(name)
    }

    /// Walk the alias/parent chain from `class` until an interface is
    /// found that defines `member` as a property or method.
    pub fn lookup_info(&self, class: &str, member: &str) -> Result<IdlInfo, IdlError> {
        let mut name = class.to_string();
        let mut iface = self
            .interfaces
            .get(&name)
            .ok_or_else(|| IdlError::UnknownInterface(name.clone()))?;
        for _ in 0..MAX_CHAIN_DEPTH {
            if let Some(alias_for) = &iface.alias_for {
                name = alias_for.clone();
                iface = self
                    .interfaces
                    .get(&name)
                    .ok_or_else(|| IdlError::UnknownInterface(name.clone()))?;
            } else if iface.properties.binary_search_by(|p| p.as_str().cmp(member)).is_ok() {
                return Ok(IdlInfo { base_interface: name, role: MemberRole::Property });
            } else if iface.methods.binary_search_by(|m| m.as_str().cmp(member)).is_ok() {
                return Ok(IdlInfo { base_interface: name, role: MemberRole::Method });
            } else if let Some(parent) = &iface.parent {
                name = parent.clone();
                iface = self
                    .interfaces
                    .get(&name)
                    .ok_or_else(|| IdlError::UnknownInterface(name.clone()))?;
            } else if member.is_empty() {
                // Constructor use of the interface object itself.
                return Ok(IdlInfo { base_interface: name, role: MemberRole::Constructor });
            } else {
                return Err(IdlError::UnknownMember {
                    interface: name,
                    member: member.to_string(),
                });
            }
        }
        Err(IdlError::Cycle(name))
    }

    /// `"<defining_interface>.<member>"` for a receiver/member pair.
    /// Callers fall back to the raw `class.member` on error.
    pub fn normalize_member(&self, class: &str, member: &str) -> Result<String, IdlError> {
        let info = self.lookup_info(class, member)?;
        Ok(format!("{}.{}", info.base_interface, member))
    }

    /// Is this (op, class, member) observation something the IDL database
    /// (or the built-in JS globals list) knows about?
    pub fn is_api_in_idl_file(&self, op: RecordOp, class: &str, member: &str) -> bool {
        match op {
            RecordOp::New => return self.interfaces.contains_key(member),
            RecordOp::Call | RecordOp::Get => {
                // Likely a constructor initialization miscategorized as a
                // call/get on the global object.
                if self.interfaces.contains_key(member)
                    || GLOBAL_JS_OBJECTS.contains(&member)
                {
                    return true;
                }
            }
            RecordOp::Set => {}
        }
        self.walk_membership(class, member, 0)
    }

    fn walk_membership(&self, class: &str, member: &str, depth: usize) -> bool {
        if depth >= MAX_CHAIN_DEPTH {
            return false;
        }
        let Some(iface) = self.interfaces.get(class) else {
            return false;
        };
        if iface.members.iter().any(|m| m == member)
            || iface.methods.iter().any(|m| m == member)
            || iface.properties.iter().any(|p| p == member)
        {
            return true;
        }
        if let Some(parent) = &iface.parent {
            if self.walk_membership(parent, member, depth + 1) {
                return true;
            }
        }
        iface
            .aliases
            .iter()
            .any(|alias| self.walk_membership(alias, member, depth + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> IdlTree {
        IdlTree::from_json(
            r#"{
                "EventTarget": { "methods": ["addEventListener", "removeEventListener"] },
                "Node": { "parent": "EventTarget", "properties": ["parentNode", "textContent"] },
                "Element": { "parent": "Node", "properties": ["innerHTML"] },
                "HTMLElement": { "parent": "Element" },
                "HTMLFormElement": { "parent": "HTMLElement", "properties": ["action"] },
                "Window": { "properties": ["name"], "methods": ["fetch"] },
                "webkitURL": { "aliasFor": "URL", "aliases": ["URL"] },
                "URL": { "methods": ["toJSON"], "members": ["createObjectURL"] }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn normalizes_to_defining_interface() {
        let t = tree();
        assert_eq!(
            t.normalize_member("HTMLFormElement", "parentNode").unwrap(),
            "Node.parentNode"
        );
        assert_eq!(
            t.normalize_member("HTMLFormElement", "addEventListener").unwrap(),
            "EventTarget.addEventListener"
        );
        assert_eq!(t.normalize_member("HTMLFormElement", "action").unwrap(), "HTMLFormElement.action");
    }

    #[test]
    fn defining_interface_is_identity() {
        let t = tree();
        assert_eq!(t.normalize_member("Window", "fetch").unwrap(), "Window.fetch");
    }

    #[test]
    fn follows_aliases() {
        let t = tree();
        assert_eq!(t.normalize_member("webkitURL", "toJSON").unwrap(), "URL.toJSON");
    }

    #[test]
    fn unknown_names_error_for_fallback() {
        let t = tree();
        assert!(matches!(
            t.normalize_member("Window", "noSuchThing"),
            Err(IdlError::UnknownMember { .. })
        ));
        assert!(matches!(
            t.normalize_member("NoSuchInterface", "x"),
            Err(IdlError::UnknownInterface(_))
        ));
    }

    #[test]
    fn empty_member_is_constructor_use() {
        let t = tree();
        let info = t.lookup_info("Window", "").unwrap();
        assert_eq!(info.role, MemberRole::Constructor);
    }

    #[test]
    fn membership_checks_cover_globals_and_chains() {
        let t = tree();
        assert!(t.is_api_in_idl_file(RecordOp::New, "", "Window"));
        assert!(!t.is_api_in_idl_file(RecordOp::New, "", "NotAThing"));
        assert!(t.is_api_in_idl_file(RecordOp::Get, "Window", "Promise"));
        assert!(t.is_api_in_idl_file(RecordOp::Call, "HTMLFormElement", "addEventListener"));
        assert!(t.is_api_in_idl_file(RecordOp::Set, "HTMLFormElement", "innerHTML"));
        assert!(t.is_api_in_idl_file(RecordOp::Get, "webkitURL", "createObjectURL"));
        assert!(!t.is_api_in_idl_file(RecordOp::Set, "Window", "Promise"));
    }

    #[test]
    fn loads_from_disk() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{ "Window": { "properties": ["name"] } }"#).unwrap();
        let t = IdlTree::load(file.path()).unwrap();
        assert_eq!(t.normalize_member("Window", "name").unwrap(), "Window.name");
    }

    #[test]
    fn alias_cycles_are_contained() {
        let t = IdlTree::from_json(
            r#"{
                "A": { "aliasFor": "B", "aliases": ["B"] },
                "B": { "aliasFor": "A", "aliases": ["A"] }
            }"#,
        )
        .unwrap();
        assert!(matches!(t.lookup_info("A", "x"), Err(IdlError::Cycle(_))));
        assert!(!t.is_api_in_idl_file(RecordOp::Set, "A", "x"));
    }
}
