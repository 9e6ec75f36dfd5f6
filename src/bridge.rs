//! Bridge facade
//!
//! Owns the embedded Lua state together with the module cache, the
//! capability resolver, the GC coordinator and the profiler, and exposes
//! every host-invoked entry point. The interpreter runs one operation at
//! a time: all state sits behind a single mutex, which is exactly the
//! discipline the caches rely on, while the host may call in from any
//! number of native threads.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use mlua::{Lua, Table};
use tracing::{debug, warn};

use crate::capability::{CapabilityResolver, TypeHandle, TypeRegistry};
use crate::error::BridgeResult;
use crate::failure::{self, Fault};
use crate::gc::GcCoordinator;
use crate::host::{IdleScheduler, Sink};
use crate::interpreter::{Completion, Execution, Interpreter};
use crate::modules::{ModuleCache, ModuleHandle};
use crate::profile::Profiler;

struct Engine {
    lua: Lua,
    modules: ModuleCache,
    types: TypeRegistry,
    resolver: CapabilityResolver,
    console: Interpreter,
}

impl Engine {
    fn load(
        &mut self,
        path: &Path,
        search_dir: &Path,
        logical_name: &str,
    ) -> Result<ModuleHandle, Fault> {
        let handle = self
            .modules
            .load(&self.lua, path, search_dir, logical_name)?;
        self.resolver.register_module(&handle);
        Ok(handle)
    }
}

struct Shared {
    engine: Mutex<Engine>,
    gc: GcCoordinator,
    profiler: Profiler,
}

/// Embedded-interpreter bridge between the host plugin framework and
/// Lua plugin modules. Cheap to clone; clones share one interpreter.
#[derive(Clone)]
pub struct Bridge {
    shared: Arc<Shared>,
}

impl Bridge {
    /// Build a bridge around a fresh interpreter state.
    ///
    /// `program` becomes the single entry of the interpreter-visible
    /// argument vector; `scheduler` is the host's idle facility for
    /// deferred collections; the sinks receive console output and
    /// console error reports.
    pub fn new(
        program: &str,
        scheduler: Arc<dyn IdleScheduler>,
        out: Sink,
        err: Sink,
    ) -> BridgeResult<Self> {
        failure::guard("initialize", || {
            let lua = Lua::new();
            bootstrap(&lua, program)?;

            let console = Interpreter::new(&lua, out, err)?;
            let engine = Engine {
                lua,
                modules: ModuleCache::new(),
                types: TypeRegistry::new(),
                resolver: CapabilityResolver::new(),
                console,
            };

            debug!(program, "bridge initialized");
            Ok(Self {
                shared: Arc::new(Shared {
                    engine: Mutex::new(engine),
                    gc: GcCoordinator::new(scheduler),
                    profiler: Profiler::from_env(),
                }),
            })
        })
    }

    fn engine(&self) -> MutexGuard<'_, Engine> {
        match self.shared.engine.lock() {
            Ok(engine) => engine,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Declare a host capability type, optionally derived from a parent
    pub fn register_capability(&self, name: &str, parent: Option<&str>) -> BridgeResult<()> {
        failure::guard("register_capability", || {
            self.engine().types.register(name, parent)?;
            Ok(())
        })
    }

    /// Import the plugin module at `path` under `logical_name`
    pub fn load(
        &self,
        path: &Path,
        search_dir: &Path,
        logical_name: &str,
    ) -> BridgeResult<ModuleHandle> {
        self.shared.profiler.on_thread_start();
        failure::guard("load", || {
            let mut engine = self.engine();
            let started = Instant::now();
            let result = engine.load(path, search_dir, logical_name);
            self.shared
                .profiler
                .record(&format!("load:{logical_name}"), started.elapsed());
            result
        })
    }

    /// Find the exported class implementing `capability`; `Ok(None)` is
    /// the cached NotFound outcome
    pub fn resolve_capability(
        &self,
        module: &ModuleHandle,
        capability: &str,
    ) -> BridgeResult<Option<TypeHandle>> {
        self.shared.profiler.on_thread_start();
        failure::guard("resolve_capability", || {
            let mut engine = self.engine();
            let Engine {
                lua,
                types,
                resolver,
                ..
            } = &mut *engine;
            resolver.resolve(lua, types, module, capability)
        })
    }

    /// Immediate collection plus one coalesced idle-scheduled follow-up
    pub fn collect(&self) -> BridgeResult<()> {
        self.shared.profiler.on_thread_start();
        failure::guard("collect", || {
            let engine = self.engine();
            let weak = Arc::downgrade(&self.shared);
            self.shared.gc.collect_deferred(&engine.lua, move || {
                Box::new(move || {
                    let Some(shared) = weak.upgrade() else {
                        return;
                    };
                    let engine = match shared.engine.lock() {
                        Ok(engine) => engine,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if let Err(err) = shared.gc.deferred_pass(&engine.lua) {
                        warn!("deferred collection failed: {err}");
                    }
                })
            })?;
            Ok(())
        })
    }

    /// Synchronous full collection, nothing scheduled
    pub fn collect_now(&self) -> BridgeResult<()> {
        failure::guard("collect", || {
            let engine = self.engine();
            self.shared.gc.collect_now(&engine.lua)?;
            Ok(())
        })
    }

    /// Host notification that the last plugin was torn down; flushes the
    /// profiling report when diagnostic mode is on
    pub fn all_plugins_unloaded(&self) -> BridgeResult<()> {
        self.shared.profiler.on_thread_start();
        self.shared.profiler.all_plugins_unloaded();
        Ok(())
    }

    /// Cancel pending deferred work, run a final collection, stop
    /// profiling
    pub fn shutdown(&self) -> BridgeResult<()> {
        failure::guard("shutdown", || {
            let engine = self.engine();
            self.shared.gc.shutdown(&engine.lua)?;
            self.shared.profiler.exit();
            Ok(())
        })
    }

    /// True while a deferred collection is scheduled
    #[must_use]
    pub fn gc_pending(&self) -> bool {
        self.shared.gc.deferred_pending()
    }

    /// Profiler handle (report rows, merge counters) for diagnostics
    #[must_use]
    pub fn profiler(&self) -> &Profiler {
        &self.shared.profiler
    }

    // Console plumbing

    /// Prompt for the console's next line
    #[must_use]
    pub fn prompt(&self) -> String {
        self.engine().console.prompt().to_string()
    }

    /// Feed one console line
    pub fn execute(&self, line: &str) -> BridgeResult<Execution> {
        self.shared.profiler.on_thread_start();
        failure::guard("execute", || {
            let mut engine = self.engine();
            let Engine { lua, console, .. } = &mut *engine;
            let started = Instant::now();
            let result = console.execute(lua, line);
            self.shared
                .profiler
                .record("console:execute", started.elapsed());
            Ok(result?)
        })
    }

    /// Complete the trailing word of `text`; never fails
    #[must_use]
    pub fn complete(&self, text: &str) -> Vec<Completion> {
        let engine = self.engine();
        engine.console.complete(&engine.lua, text)
    }

    /// Discard console state and rebuild its namespace
    pub fn reset_console(&self) -> BridgeResult<()> {
        failure::guard("reset", || {
            let mut engine = self.engine();
            let Engine { lua, console, .. } = &mut *engine;
            console.reset(lua)?;
            Ok(())
        })
    }

    /// Replace the console's original namespace with a freshly seeded
    /// table; triggers a reset onto a copy of it
    pub fn set_console_namespace(
        &self,
        seed: impl FnOnce(&Lua, &Table) -> mlua::Result<()>,
    ) -> BridgeResult<()> {
        failure::guard("set_namespace", || {
            let mut engine = self.engine();
            let Engine { lua, console, .. } = &mut *engine;
            let namespace = lua.create_table()?;
            seed(lua, &namespace)?;
            console.set_namespace(lua, Some(namespace))?;
            Ok(())
        })
    }

    /// Read access to the console's original namespace
    pub fn with_console_namespace<T>(
        &self,
        read: impl FnOnce(&Lua, &Table) -> mlua::Result<T>,
    ) -> BridgeResult<T> {
        failure::guard("get_namespace", || {
            let engine = self.engine();
            let namespace = engine.console.namespace(&engine.lua)?;
            Ok(read(&engine.lua, &namespace)?)
        })
    }

    /// Run `read` against a resolved class table, converting the result
    /// through the usual typed conversions
    pub fn with_class<T>(
        &self,
        handle: &TypeHandle,
        read: impl FnOnce(&Lua, &Table) -> mlua::Result<T>,
    ) -> BridgeResult<T> {
        failure::guard("with_class", || {
            let engine = self.engine();
            let class = handle.table(&engine.lua)?;
            Ok(read(&engine.lua, &class)?)
        })
    }
}

/// Interpreter-visible argument vector: a single program-name entry,
/// rewritten before any plugin code runs
fn bootstrap(lua: &Lua, program: &str) -> mlua::Result<()> {
    let arg = lua.create_table()?;
    arg.set(0, program)?;
    lua.globals().set("arg", arg)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::host::QueueScheduler;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    fn sink() -> Sink {
        Arc::new(|_: &str| {})
    }

    fn capture() -> (Sink, Arc<StdMutex<Vec<String>>>) {
        let lines: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let captured = Arc::clone(&lines);
        (
            Arc::new(move |text: &str| captured.lock().unwrap().push(text.to_string())),
            lines,
        )
    }

    fn bridge_with_scheduler() -> (Bridge, Arc<QueueScheduler>) {
        let scheduler = Arc::new(QueueScheduler::new());
        let bridge = Bridge::new(
            "crucible-test",
            Arc::clone(&scheduler) as Arc<dyn IdleScheduler>,
            sink(),
            sink(),
        )
        .unwrap();
        (bridge, scheduler)
    }

    fn write_plugin(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(format!("{name}.lua"));
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_bootstrap_rewrites_argument_vector() {
        let (bridge, _) = bridge_with_scheduler();
        let engine = bridge.engine();
        let arg: Table = engine.lua.globals().get("arg").unwrap();
        let program: String = arg.get(0).unwrap();
        assert_eq!(program, "crucible-test");
        assert_eq!(arg.raw_len(), 0);
    }

    #[test]
    fn test_load_and_resolve_through_bridge() {
        let (bridge, _) = bridge_with_scheduler();
        bridge.register_capability("Activatable", None).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = write_plugin(
            dir.path(),
            "hello",
            r#"return {
                exports = { "HelloPlugin" },
                HelloPlugin = { __type = "Activatable", greeting = "hi" },
            }"#,
        );

        let module = bridge.load(&path, dir.path(), "hello").unwrap();
        let handle = bridge
            .resolve_capability(&module, "Activatable")
            .unwrap()
            .unwrap();
        assert_eq!(handle.type_name(), "Activatable");

        let greeting: String = bridge
            .with_class(&handle, |_, class| class.get("greeting"))
            .unwrap();
        assert_eq!(greeting, "hi");
    }

    #[test]
    fn test_import_failure_signal_passes_guard_unchanged() {
        let (bridge, _) = bridge_with_scheduler();
        let dir = tempfile::tempdir().unwrap();
        let path = write_plugin(dir.path(), "broken", "not lua (");

        let err = bridge.load(&path, dir.path(), "broken").unwrap_err();
        assert!(matches!(err, BridgeError::ImportFailure { .. }));
    }

    #[test]
    fn test_uncontrolled_errors_become_host_failures() {
        let (bridge, _) = bridge_with_scheduler();
        bridge.register_capability("Activatable", None).unwrap();

        let dir = tempfile::tempdir().unwrap();
        // The module's metatable raises on any lookup, so the capability
        // scan hits a raw interpreter error rather than a bridge signal.
        let path = write_plugin(
            dir.path(),
            "hostile",
            r#"return setmetatable({}, {
                __index = function() error("hostile lookup") end,
            })"#,
        );

        let module = bridge.load(&path, dir.path(), "hostile").unwrap();
        let err = bridge
            .resolve_capability(&module, "Activatable")
            .unwrap_err();
        match err {
            BridgeError::HostFailure { operation, trace } => {
                assert_eq!(operation, "resolve_capability");
                assert!(trace.contains("hostile lookup"));
            }
            other => panic!("expected HostFailure, got {other:?}"),
        }
    }

    #[test]
    fn test_collect_coalesces_and_fires_through_scheduler() {
        let (bridge, scheduler) = bridge_with_scheduler();

        for _ in 0..4 {
            bridge.collect().unwrap();
        }
        assert_eq!(scheduler.pending(), 1);
        assert!(bridge.gc_pending());

        scheduler.drain();
        assert!(!bridge.gc_pending());

        // Ticket released: a new request schedules again.
        bridge.collect().unwrap();
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn test_shutdown_leaves_no_dangling_work() {
        let (bridge, scheduler) = bridge_with_scheduler();

        bridge.collect().unwrap();
        bridge.shutdown().unwrap();

        assert!(!bridge.gc_pending());
        assert_eq!(scheduler.pending(), 0);
        // Draining after shutdown runs nothing.
        scheduler.drain();
    }

    #[test]
    fn test_console_roundtrip_through_bridge() {
        let scheduler = Arc::new(QueueScheduler::new());
        let (out, out_lines) = capture();
        let bridge = Bridge::new(
            "crucible-test",
            scheduler as Arc<dyn IdleScheduler>,
            out,
            sink(),
        )
        .unwrap();

        assert_eq!(bridge.prompt(), ">>> ");
        let result = bridge.execute("6 * 7").unwrap();
        assert_eq!(result, Execution::Complete { success: true });
        assert_eq!(out_lines.lock().unwrap().as_slice(), ["42\n"]);
    }

    #[test]
    fn test_seeded_console_namespace() {
        let (bridge, _) = bridge_with_scheduler();
        bridge
            .set_console_namespace(|_, ns| ns.set("answer", 42))
            .unwrap();

        let seeded: i64 = bridge
            .with_console_namespace(|_, ns| ns.get("answer"))
            .unwrap();
        assert_eq!(seeded, 42);

        let result = bridge.execute("answer + 0").unwrap();
        assert_eq!(result, Execution::Complete { success: true });
    }
}
