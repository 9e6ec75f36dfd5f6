use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crucible::bridge::Bridge;
use crucible::error::BridgeError;
use crucible::host::{IdleScheduler, QueueScheduler, Sink};
use crucible::interpreter::Execution;

fn null_sink() -> Sink {
    Arc::new(|_: &str| {})
}

fn capture_sink() -> (Sink, Arc<Mutex<Vec<String>>>) {
    let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&lines);
    (
        Arc::new(move |text: &str| captured.lock().unwrap().push(text.to_string())),
        lines,
    )
}

fn new_bridge() -> (Bridge, Arc<QueueScheduler>) {
    let scheduler = Arc::new(QueueScheduler::new());
    let bridge = Bridge::new(
        "crucible-test",
        Arc::clone(&scheduler) as Arc<dyn IdleScheduler>,
        null_sink(),
        null_sink(),
    )
    .unwrap();
    (bridge, scheduler)
}

fn write_plugin(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(format!("{name}.lua"));
    fs::write(&path, body).unwrap();
    path
}

mod module_cache_tests {
    use super::*;

    #[test]
    fn test_same_path_loads_to_identical_handle_without_reimport() {
        let scheduler = Arc::new(QueueScheduler::new());
        let (out, out_lines) = capture_sink();
        let bridge = Bridge::new(
            "crucible-test",
            scheduler as Arc<dyn IdleScheduler>,
            out,
            null_sink(),
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = write_plugin(
            dir.path(),
            "tracked",
            "tracked_loads = (tracked_loads or 0) + 1\nreturn { }",
        );

        let first = bridge.load(&path, dir.path(), "tracked").unwrap();
        let second = bridge.load(&path, dir.path(), "tracked").unwrap();
        assert_eq!(first, second);

        // The module body ran exactly once: the counter it bumps on each
        // import still reads 1 from the console.
        let result = bridge.execute("tracked_loads").unwrap();
        assert_eq!(result, Execution::Complete { success: true });
        assert_eq!(out_lines.lock().unwrap().as_slice(), ["1\n"]);
    }

    #[test]
    fn test_distinct_paths_with_same_name_collide_consistently() {
        let (bridge, _) = new_bridge();
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let path_a = write_plugin(dir_a.path(), "dup", "return { origin = 'a' }");
        let path_b = write_plugin(dir_b.path(), "dup", "return { origin = 'b' }");

        bridge.load(&path_a, dir_a.path(), "dup").unwrap();

        let first = bridge.load(&path_b, dir_b.path(), "dup").unwrap_err();
        let second = bridge.load(&path_b, dir_b.path(), "dup").unwrap_err();

        for err in [&first, &second] {
            assert!(matches!(err, BridgeError::NameCollision { .. }));
        }
        // Retried failure replays with the identical message.
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn test_import_failure_replays_without_reimporting() {
        let (bridge, _) = new_bridge();
        let dir = tempfile::tempdir().unwrap();
        let path = write_plugin(dir.path(), "faulty", "error('top level failure')");

        let first = bridge.load(&path, dir.path(), "faulty").unwrap_err();

        // Even after the file is fixed on disk, the tombstone stands: a
        // path resolves to one outcome for the process lifetime.
        write_plugin(dir.path(), "faulty", "return { }");
        let second = bridge.load(&path, dir.path(), "faulty").unwrap_err();

        assert!(matches!(first, BridgeError::ImportFailure { .. }));
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn test_import_failure_trace_has_no_bridge_frames() {
        let (bridge, _) = new_bridge();
        let dir = tempfile::tempdir().unwrap();
        let path = write_plugin(dir.path(), "tracey", "error('visible to author')");

        let err = bridge.load(&path, dir.path(), "tracey").unwrap_err();
        match err {
            BridgeError::ImportFailure { trace, .. } => {
                assert!(trace.contains("visible to author"));
                assert!(!trace.contains("[crucible]"));
            }
            other => panic!("expected ImportFailure, got {other:?}"),
        }
    }
}

mod capability_tests {
    use super::*;

    #[test]
    fn test_resolution_is_idempotent_across_calls() {
        let (bridge, _) = new_bridge();
        bridge.register_capability("Activatable", None).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = write_plugin(
            dir.path(),
            "widget",
            r#"return {
                exports = { "Widget" },
                Widget = { __type = "Activatable" },
            }"#,
        );
        let module = bridge.load(&path, dir.path(), "widget").unwrap();

        let first = bridge
            .resolve_capability(&module, "Activatable")
            .unwrap()
            .unwrap();
        let second = bridge
            .resolve_capability(&module, "Activatable")
            .unwrap()
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_not_found_is_a_valid_cached_outcome() {
        let (bridge, _) = new_bridge();
        bridge.register_capability("Activatable", None).unwrap();
        bridge.register_capability("Configurable", None).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = write_plugin(
            dir.path(),
            "plain",
            r#"return { helper = { __type = "Activatable" } }"#,
        );
        let module = bridge.load(&path, dir.path(), "plain").unwrap();

        assert!(bridge
            .resolve_capability(&module, "Configurable")
            .unwrap()
            .is_none());
        assert!(bridge
            .resolve_capability(&module, "Configurable")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_subtype_satisfies_requested_capability() {
        let (bridge, _) = new_bridge();
        bridge.register_capability("Activatable", None).unwrap();
        bridge
            .register_capability("WindowActivatable", Some("Activatable"))
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = write_plugin(
            dir.path(),
            "windowed",
            r#"return {
                exports = { "WindowPlugin" },
                WindowPlugin = { __type = "WindowActivatable" },
            }"#,
        );
        let module = bridge.load(&path, dir.path(), "windowed").unwrap();

        let handle = bridge
            .resolve_capability(&module, "Activatable")
            .unwrap()
            .unwrap();
        assert_eq!(handle.type_name(), "WindowActivatable");
    }

    #[test]
    fn test_demo_plugin_resolves() {
        let (bridge, _) = new_bridge();
        bridge.register_capability("Activatable", None).unwrap();

        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/plugins/hello");
        let path = dir.join("hello.lua");

        let module = bridge.load(&path, &dir, "hello").unwrap();
        let handle = bridge
            .resolve_capability(&module, "Activatable")
            .unwrap()
            .unwrap();

        let greeting: String = bridge
            .with_class(&handle, |_, class| class.get("greeting"))
            .unwrap();
        assert!(greeting.contains("hello plugin"));
    }
}

mod gc_tests {
    use super::*;

    #[test]
    fn test_rapid_collect_requests_schedule_one_ticket() {
        let (bridge, scheduler) = new_bridge();

        for _ in 0..10 {
            bridge.collect().unwrap();
        }
        assert_eq!(scheduler.pending(), 1);

        scheduler.drain();
        assert!(!bridge.gc_pending());
    }

    #[test]
    fn test_shutdown_cancels_scheduled_collection() {
        let (bridge, scheduler) = new_bridge();

        bridge.collect().unwrap();
        assert_eq!(scheduler.pending(), 1);

        bridge.shutdown().unwrap();
        assert_eq!(scheduler.pending(), 0);
        assert!(!bridge.gc_pending());
    }

    #[test]
    fn test_deferred_pass_reclaims_plugin_garbage() {
        let (bridge, scheduler) = new_bridge();
        let dir = tempfile::tempdir().unwrap();
        let path = write_plugin(
            dir.path(),
            "wasteful",
            "local junk = {}\nfor i = 1, 10000 do junk[i] = { i } end\nreturn { }",
        );
        bridge.load(&path, dir.path(), "wasteful").unwrap();

        bridge.collect().unwrap();
        scheduler.drain();

        // Ticket slot is free again after the pass ran.
        bridge.collect().unwrap();
        assert_eq!(scheduler.pending(), 1);
    }
}

mod profiler_tests {
    use super::*;
    use crucible::profile::Profiler;
    use std::time::Duration;

    #[test]
    fn test_bridge_profiling_defaults_off_and_inert() {
        // CRUCIBLE_LUA_PROFILE is unset in the test environment.
        let (bridge, _) = new_bridge();
        assert!(!bridge.profiler().enabled());
        assert!(bridge.profiler().report_rows().is_none());

        // Entry points stay no-ops all the way through a workload.
        bridge.execute("1 + 1").unwrap();
        bridge.all_plugins_unloaded().unwrap();
        assert!(bridge.profiler().report_rows().is_none());
    }

    #[test]
    fn test_worker_samples_all_merge() {
        let profiler = Arc::new(Profiler::with_toggle(Some("time")));
        let workers: u64 = 3;
        let per_worker: u64 = 5;

        let handles: Vec<_> = (0..workers)
            .map(|i| {
                let profiler = Arc::clone(&profiler);
                std::thread::spawn(move || {
                    profiler.on_thread_start();
                    for _ in 0..per_worker {
                        profiler.record(&format!("op:{i}"), Duration::from_micros(50));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(profiler.merged_sample_count(), Some(workers * per_worker));
    }
}

mod console_tests {
    use super::*;

    fn console_bridge() -> (Bridge, Arc<Mutex<Vec<String>>>, Arc<Mutex<Vec<String>>>) {
        let scheduler = Arc::new(QueueScheduler::new());
        let (out, out_lines) = capture_sink();
        let (err, err_lines) = capture_sink();
        let bridge = Bridge::new(
            "crucible-test",
            scheduler as Arc<dyn IdleScheduler>,
            out,
            err,
        )
        .unwrap();
        (bridge, out_lines, err_lines)
    }

    #[test]
    fn test_block_accumulates_until_second_blank_line() {
        let (bridge, out, _) = console_bridge();

        assert_eq!(bridge.execute("if true then").unwrap(), Execution::AwaitingMore);
        assert_eq!(bridge.prompt(), "... ");
        assert_eq!(
            bridge.execute("print('ran')").unwrap(),
            Execution::AwaitingMore
        );
        assert_eq!(bridge.execute("end").unwrap(), Execution::AwaitingMore);
        assert_eq!(bridge.execute("").unwrap(), Execution::AwaitingMore);
        assert!(out.lock().unwrap().is_empty());

        let result = bridge.execute("").unwrap();
        assert_eq!(result, Execution::Complete { success: true });
        assert_eq!(out.lock().unwrap().as_slice(), ["ran\n"]);
        assert_eq!(bridge.prompt(), ">>> ");
    }

    #[test]
    fn test_expression_displays_value() {
        let (bridge, out, _) = console_bridge();

        let result = bridge.execute("1 + 1").unwrap();
        assert_eq!(result, Execution::Complete { success: true });
        assert_eq!(out.lock().unwrap().as_slice(), ["2\n"]);
    }

    #[test]
    fn test_runtime_error_reports_once_and_fails() {
        let (bridge, _, err) = console_bridge();

        let result = bridge.execute("error('kaput')").unwrap();
        assert_eq!(result, Execution::Complete { success: false });

        let written = err.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert!(written[0].contains("kaput"));
    }

    #[test]
    fn test_reset_discards_open_block() {
        let (bridge, _, _) = console_bridge();

        bridge.execute("if true then").unwrap();
        assert_eq!(bridge.prompt(), "... ");

        bridge.reset_console().unwrap();
        assert_eq!(bridge.prompt(), ">>> ");

        let result = bridge.execute("2 + 2").unwrap();
        assert_eq!(result, Execution::Complete { success: true });
    }

    #[test]
    fn test_completion_preserves_prefix_through_dotted_path() {
        let (bridge, _, _) = console_bridge();

        bridge
            .execute("foo = { bar = true, baz = true, nope = true }")
            .unwrap();

        let completions = bridge.complete("foo.ba");
        let inserted: Vec<String> = completions.iter().map(|c| c.inserted.clone()).collect();
        assert_eq!(inserted, vec!["foo.bar", "foo.baz"]);
    }

    #[test]
    fn test_console_errors_never_cross_as_host_failures() {
        let (bridge, _, err) = console_bridge();

        // A failing evaluation is an Ok(Complete { success: false }),
        // never a BridgeError.
        let result = bridge.execute("error('contained')");
        assert!(result.is_ok());
        assert_eq!(err.lock().unwrap().len(), 1);
    }
}

mod concurrency_tests {
    use super::*;

    #[test]
    fn test_bridge_serves_multiple_native_threads() {
        let (bridge, _) = new_bridge();
        bridge.register_capability("Activatable", None).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = write_plugin(
            dir.path(),
            "shared_mod",
            r#"return {
                exports = { "Widget" },
                Widget = { __type = "Activatable" },
            }"#,
        );
        let dir_path = dir.path().to_path_buf();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bridge = bridge.clone();
                let path = path.clone();
                let dir_path = dir_path.clone();
                std::thread::spawn(move || {
                    let module = bridge.load(&path, &dir_path, "shared_mod").unwrap();
                    let resolved = bridge
                        .resolve_capability(&module, "Activatable")
                        .unwrap()
                        .unwrap();
                    bridge.collect().unwrap();
                    (module, resolved)
                })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.join().unwrap());
        }

        // Every thread observed the identical module and class handles.
        let (first_module, first_class) = &results[0];
        for (module, class) in &results[1..] {
            assert_eq!(module, first_module);
            assert_eq!(class, first_class);
        }
    }
}
