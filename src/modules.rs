//! Module cache
//!
//! Maps a plugin's source file path to its imported Lua module table and
//! enforces at-most-one import per logical module name across the whole
//! process. Results are permanent: a path resolves to the same handle
//! (or replays the same failure) for the process lifetime, and a module
//! is never imported twice.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mlua::{Function, Lua, RegistryKey, Table, Value};
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::failure::{self, Fault};

/// Handle to an imported plugin module.
///
/// Cheap to clone; two handles compare equal exactly when they refer to
/// the same import (the cache returns the identical handle for repeated
/// loads of one path).
#[derive(Debug, Clone)]
pub struct ModuleHandle {
    key: Arc<RegistryKey>,
}

impl ModuleHandle {
    pub(crate) fn from_registry(key: RegistryKey) -> Self {
        Self { key: Arc::new(key) }
    }

    /// Registry key of the module's table
    pub(crate) fn key(&self) -> &RegistryKey {
        &self.key
    }

    /// Stable identity for cache keying
    #[must_use]
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.key) as usize
    }

    /// The module's table, valid while `lua` is borrowed
    pub(crate) fn table<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Table<'lua>> {
        lua.registry_value(&self.key)
    }
}

impl PartialEq for ModuleHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.key, &other.key)
    }
}

impl Eq for ModuleHandle {}

/// Outcome remembered for a path; never replaced once inserted
#[derive(Debug, Clone)]
enum ModuleRecord {
    Loaded(ModuleHandle),
    Failed(BridgeError),
}

/// Process-scoped table of imported plugin modules
pub struct ModuleCache {
    by_path: HashMap<PathBuf, ModuleRecord>,
    names: HashMap<String, PathBuf>,
    search_dirs: HashSet<PathBuf>,
}

impl ModuleCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_path: HashMap::new(),
            names: HashMap::new(),
            search_dirs: HashSet::new(),
        }
    }

    /// Import the plugin module at `path` under `logical_name`.
    ///
    /// `search_dir` is appended to the interpreter's module search path
    /// the first time it is seen; the mutation is process-wide and
    /// permanent. Both successes and failures are cached against `path`
    /// so repeated calls are cheap and consistent.
    pub(crate) fn load(
        &mut self,
        lua: &Lua,
        path: &Path,
        search_dir: &Path,
        logical_name: &str,
    ) -> Result<ModuleHandle, Fault> {
        if let Some(record) = self.by_path.get(path) {
            return match record {
                ModuleRecord::Loaded(handle) => Ok(handle.clone()),
                ModuleRecord::Failed(err) => Err(Fault::Signal(err.clone())),
            };
        }

        if let Some(existing) = self.bound_path(lua, logical_name)? {
            let err = BridgeError::NameCollision {
                name: logical_name.to_string(),
                existing,
                requested: path.to_path_buf(),
            };
            self.by_path
                .insert(path.to_path_buf(), ModuleRecord::Failed(err.clone()));
            return Err(Fault::Signal(err));
        }

        self.add_search_path(lua, search_dir)?;

        match import(lua, logical_name) {
            Ok(key) => {
                let handle = ModuleHandle::from_registry(key);
                debug!(name = logical_name, path = %path.display(), "plugin module imported");
                self.by_path.insert(
                    path.to_path_buf(),
                    ModuleRecord::Loaded(handle.clone()),
                );
                self.names
                    .insert(logical_name.to_string(), path.to_path_buf());
                Ok(handle)
            }
            Err(err) => {
                let err = BridgeError::ImportFailure {
                    path: path.to_path_buf(),
                    trace: failure::format_trace(&err),
                };
                warn!(name = logical_name, "plugin import failed");
                self.by_path
                    .insert(path.to_path_buf(), ModuleRecord::Failed(err.clone()));
                Err(Fault::Signal(err))
            }
        }
    }

    /// Path currently bound to `name`, either by this cache or by
    /// anything already sitting in the interpreter's loaded-module table
    fn bound_path(&self, lua: &Lua, name: &str) -> mlua::Result<Option<PathBuf>> {
        if let Some(path) = self.names.get(name) {
            return Ok(Some(path.clone()));
        }

        // Plugin code may have populated package.loaded behind our back;
        // a stdlib name like "string" collides too.
        let package: Table = lua.globals().get("package")?;
        let loaded: Table = package.get("loaded")?;
        if loaded.contains_key(name)? {
            return Ok(Some(PathBuf::from(format!("<interpreter:{name}>"))));
        }

        Ok(None)
    }

    /// Append `";<dir>/?.lua;<dir>/?/init.lua"` to package.path once
    fn add_search_path(&mut self, lua: &Lua, dir: &Path) -> mlua::Result<()> {
        if self.search_dirs.contains(dir) {
            return Ok(());
        }

        let package: Table = lua.globals().get("package")?;
        let current: String = package.get("path")?;
        let dir_str = dir.display().to_string();
        let addition = format!("{dir_str}/?.lua;{dir_str}/?/init.lua");
        package.set("path", format!("{current};{addition}"))?;

        self.search_dirs.insert(dir.to_path_buf());
        debug!(dir = %dir.display(), "search path extended");
        Ok(())
    }
}

impl Default for ModuleCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the interpreter's own `require` and pin the module table in the
/// registry. A module value that is not a table is rejected, matching
/// the loader's contract that a plugin module is a table of exports.
fn import(lua: &Lua, name: &str) -> mlua::Result<RegistryKey> {
    let require: Function = lua.globals().get("require")?;
    let value: Value = require.call(name)?;

    match value {
        Value::Table(table) => lua.create_registry_value(table),
        other => Err(mlua::Error::RuntimeError(format!(
            "module '{name}' did not return a table (got {})",
            other.type_name()
        ))),
    }
}
