//! Capability-type resolution
//!
//! The host declares its introspectable capability types in a
//! [`TypeRegistry`]; the [`CapabilityResolver`] scans a plugin module's
//! exported names for the first class table implementing a requested
//! capability and caches the outcome, positive or negative, per
//! (module, capability) pair. Resolution is a read-only query: it
//! discovers types, it never registers or mutates them.

use std::collections::HashMap;
use std::sync::Arc;

use mlua::{Lua, RegistryKey, Table, Value};
use tracing::debug;

use crate::error::BridgeError;
use crate::failure::Fault;
use crate::modules::ModuleHandle;

/// Handle to a resolved plugin class table
#[derive(Debug, Clone)]
pub struct TypeHandle {
    key: Arc<RegistryKey>,
    type_name: String,
}

impl TypeHandle {
    /// Declared type name of the resolved class
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The class table, valid while `lua` is borrowed
    pub(crate) fn table<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Table<'lua>> {
        lua.registry_value(&self.key)
    }
}

impl PartialEq for TypeHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.key, &other.key)
    }
}

impl Eq for TypeHandle {}

/// Host type system: named capability types with single inheritance
pub struct TypeRegistry {
    parents: HashMap<String, Option<String>>,
}

impl TypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            parents: HashMap::new(),
        }
    }

    /// Declare a capability type, optionally deriving from a previously
    /// registered parent
    pub fn register(&mut self, name: &str, parent: Option<&str>) -> Result<(), BridgeError> {
        if let Some(parent) = parent {
            if !self.parents.contains_key(parent) {
                return Err(BridgeError::UnknownParent {
                    name: name.to_string(),
                    parent: parent.to_string(),
                });
            }
        }
        self.parents
            .insert(name.to_string(), parent.map(str::to_string));
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.parents.contains_key(name)
    }

    /// Subtype relation: walks the parent chain from `child` up
    #[must_use]
    pub fn is_a(&self, child: &str, ancestor: &str) -> bool {
        let mut current = Some(child);
        while let Some(name) = current {
            if name == ancestor {
                return self.parents.contains_key(name);
            }
            current = match self.parents.get(name) {
                Some(parent) => parent.as_deref(),
                None => return false,
            };
        }
        false
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-module cache of capability lookups
pub struct CapabilityResolver {
    cache: HashMap<usize, HashMap<String, Option<TypeHandle>>>,
}

impl CapabilityResolver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
        }
    }

    /// Associate a fresh, empty cache set with a newly loaded module
    pub fn register_module(&mut self, module: &ModuleHandle) {
        self.cache.entry(module.id()).or_default();
    }

    /// Find the first exported class implementing `capability`.
    ///
    /// `Ok(None)` is the cached NotFound outcome, not an error. The
    /// module is scanned at most once per capability.
    pub(crate) fn resolve(
        &mut self,
        lua: &Lua,
        registry: &TypeRegistry,
        module: &ModuleHandle,
        capability: &str,
    ) -> Result<Option<TypeHandle>, Fault> {
        let entries = self.cache.entry(module.id()).or_default();
        if let Some(cached) = entries.get(capability) {
            return Ok(cached.clone());
        }

        let resolved = scan(lua, registry, module, capability)?;
        match &resolved {
            Some(handle) => debug!(
                capability,
                class = handle.type_name(),
                "capability resolved"
            ),
            None => debug!(capability, "capability not found in module"),
        }

        self.cache
            .entry(module.id())
            .or_default()
            .insert(capability.to_string(), resolved.clone());
        Ok(resolved)
    }
}

impl Default for CapabilityResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Enumerate the module's exported names in a stable order.
///
/// A declared `exports` list is scanned in declared order. Without one,
/// string-keyed top-level entries are scanned in lexicographic order: a
/// Lua table cannot reproduce declaration order, so the fallback must be
/// explicit rather than whatever the hash seed produced.
fn export_names(table: &Table) -> mlua::Result<Vec<String>> {
    let declared: Option<Table> = table.get("exports")?;
    if let Some(list) = declared {
        let mut names = Vec::new();
        for name in list.sequence_values::<String>() {
            names.push(name?);
        }
        return Ok(names);
    }

    let mut names = Vec::new();
    for pair in table.clone().pairs::<Value, Value>() {
        let (key, _) = pair?;
        if let Value::String(s) = key {
            names.push(s.to_str()?.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn scan(
    lua: &Lua,
    registry: &TypeRegistry,
    module: &ModuleHandle,
    capability: &str,
) -> Result<Option<TypeHandle>, Fault> {
    let table = module.table(lua)?;

    for name in export_names(&table)? {
        let value: Value = table.get(name.as_str())?;
        let Value::Table(class) = value else {
            continue;
        };

        // "No declared type metadata" is a skip, not an error.
        let declared: Option<String> = match class.get("__type") {
            Ok(declared) => declared,
            Err(_) => continue,
        };
        let Some(declared) = declared else {
            continue;
        };

        if registry.is_a(&declared, capability) {
            let key = lua.create_registry_value(class)?;
            return Ok(Some(TypeHandle {
                key: Arc::new(key),
                type_name: declared,
            }));
        }
    }

    Ok(None)
}
