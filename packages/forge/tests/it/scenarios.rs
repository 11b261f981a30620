//! End-to-end build scenarios.

use std::sync::Arc;

use pretty_assertions::assert_eq as pretty_assert_eq;

use forge::{
    config::{CacheConfig, ExecConfig, RemoteConfig},
    driver::Build,
    error::GraphError,
    events::ChannelSink,
    label::Label,
    target::{Language, Target, TargetType},
};

use crate::{c_target, engine, engine_with, fixture, host_has_cc, script_target, write_source};

fn upper_lib() -> Target {
    script_target(
        "//a:lib",
        &["a.c"],
        &[],
        "tr 'a-z' 'A-Z' < a.c > liba.txt",
        "liba.txt",
    )
}

fn cat_app() -> Target {
    script_target(
        "//b:app",
        &["b.c"],
        &["//a:lib"],
        "cat liba.txt b.c > app.txt",
        "app.txt",
    )
}

#[test_log::test]
fn s1_first_build_runs_everything() {
    let (workspace, cache) = fixture();
    write_source(workspace.path(), "a.c", "alpha\n");
    write_source(workspace.path(), "b.c", "beta\n");

    let build = engine(workspace.path(), cache.path());
    let summary = build.run(vec![upper_lib(), cat_app()]).unwrap();

    assert!(summary.ok(), "errors: {:?}", summary.errors);
    pretty_assert_eq!(summary.succeeded, 2);
    pretty_assert_eq!(summary.cached, 0);
    pretty_assert_eq!(summary.report.executed, 2);
    pretty_assert_eq!(summary.report.cache_hits, 0);
    pretty_assert_eq!(summary.exit_code(), 0);

    pretty_assert_eq!(
        std::fs::read_to_string(workspace.path().join("app.txt")).unwrap(),
        "ALPHA\nbeta\n"
    );
}

#[test]
fn s2_unchanged_rebuild_is_fully_cached() {
    let (workspace, cache) = fixture();
    write_source(workspace.path(), "a.c", "alpha\n");
    write_source(workspace.path(), "b.c", "beta\n");

    let build = engine(workspace.path(), cache.path());
    build.run(vec![upper_lib(), cat_app()]).unwrap();

    // A fresh engine over the same cache: everything is satisfied from
    // the target tier, nothing is even lowered.
    std::fs::remove_file(workspace.path().join("app.txt")).unwrap();
    let build = engine(workspace.path(), cache.path());
    let summary = build.run(vec![upper_lib(), cat_app()]).unwrap();

    assert!(summary.ok());
    pretty_assert_eq!(summary.cached, 2);
    pretty_assert_eq!(summary.succeeded, 0);
    pretty_assert_eq!(summary.report.executed, 0);

    // Outputs restored from the cache.
    pretty_assert_eq!(
        std::fs::read_to_string(workspace.path().join("app.txt")).unwrap(),
        "ALPHA\nbeta\n"
    );
}

#[test_log::test]
fn s3_partial_invalidation_rebuilds_only_what_changed() {
    if !host_has_cc() {
        eprintln!("skipping: host has no C toolchain");
        return;
    }

    let (workspace, cache) = fixture();
    write_source(workspace.path(), "a.c", "int a(void) { return 1; }\n");
    write_source(workspace.path(), "b.c", "int main(void) { return 0; }\n");

    let lib = || c_target("//a:lib", TargetType::Library, &["a.c"], &[]);
    let app = || c_target("//b:app", TargetType::Executable, &["b.c"], &["//a:lib"]);

    let build = engine(workspace.path(), cache.path());
    let summary = build.run(vec![lib(), app()]).unwrap();
    assert!(summary.ok(), "errors: {:?}", summary.errors);
    // Two compiles, one archive, one link.
    pretty_assert_eq!(summary.report.executed, 4);

    // Touch only a.c's content.
    write_source(workspace.path(), "a.c", "int a(void) { return 2; }\n");

    let build = engine(workspace.path(), cache.path());
    let summary = build.run(vec![lib(), app()]).unwrap();
    assert!(summary.ok(), "errors: {:?}", summary.errors);
    pretty_assert_eq!(summary.succeeded, 2);

    // b.c did not change, so its compile action hits the action cache;
    // a's compile, a's archive, and the link (whose consumed inputs
    // changed) re-run.
    pretty_assert_eq!(summary.report.cache_hits, 1);
    pretty_assert_eq!(summary.report.executed, 3);
}

#[test]
fn s4_cycles_abort_before_dispatch() {
    let (workspace, cache) = fixture();
    let build = engine(workspace.path(), cache.path());

    let x = script_target("//x:x", &[], &["//y:y"], "true", "x.out");
    let y = script_target("//y:y", &[], &["//x:x"], "true", "y.out");

    let err = build.run(vec![x, y]).unwrap_err();
    let cycle = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<GraphError>())
        .expect("cycle error in chain");
    match cycle {
        GraphError::Cycle { path } => {
            pretty_assert_eq!(path.len(), 3);
            pretty_assert_eq!(path.first(), path.last());
        }
        other => panic!("expected cycle, got {other:?}"),
    }

    // Nothing ran: the workspace has no outputs.
    assert!(!workspace.path().join("x.out").exists());
    assert!(!workspace.path().join("y.out").exists());
}

#[test]
fn s5_timeout_retries_then_fails_with_cached_failure() {
    let (workspace, cache) = fixture();

    let mut slow = script_target("//t:x", &[], &[], "sleep 10", "never.txt");
    slow.config
        .insert("timeout_secs".to_string(), serde_json::json!(1));
    slow.config
        .insert("max_retries".to_string(), serde_json::json!(2));

    let build = engine(workspace.path(), cache.path());
    let summary = build.run(vec![slow.clone()]).unwrap();

    pretty_assert_eq!(summary.failed, 1);
    pretty_assert_eq!(
        summary.report.failure_categories,
        vec![forge::error::ErrorCategory::Process]
    );
    let (label, error) = &summary.errors[0];
    pretty_assert_eq!(label, &Label::must("//t:x"));
    assert!(error.contains("timeout"), "error: {error}");
    assert!(error.contains("3 attempt"), "error: {error}");
    pretty_assert_eq!(
        summary.exit_code(),
        forge::error::ErrorCategory::Process.exit_code()
    );

    // The failure was recorded in the action cache with a short TTL: an
    // identical re-run short-circuits without executing anything.
    let build = engine(workspace.path(), cache.path());
    let summary = build.run(vec![slow]).unwrap();
    pretty_assert_eq!(summary.failed, 1);
    pretty_assert_eq!(summary.report.executed, 0);
    pretty_assert_eq!(summary.report.cache_hits, 1);
}

#[test_log::test]
fn s6_remote_hit_promotes_to_local() {
    let stub = crate::relay_stub::RelayStub::start();
    let remote = |compress: bool| {
        RemoteConfig::builder()
            .url(stub.url.clone())
            .compress(compress)
            .build()
    };

    // "Machine one": build and push.
    let (workspace_a, cache_a) = fixture();
    write_source(workspace_a.path(), "a.c", "alpha\n");
    write_source(workspace_a.path(), "b.c", "beta\n");
    let build = engine_with(workspace_a.path(), cache_a.path(), |config| CacheConfig {
        remote: Some(remote(false)),
        ..config
    });
    let summary = build.run(vec![upper_lib(), cat_app()]).unwrap();
    assert!(summary.ok(), "errors: {:?}", summary.errors);
    assert!(stub.target_count() >= 2, "pushes drained to the stub");
    assert!(stub.blob_count() > 0);

    // "Machine two": empty local cache, same sources.
    let (workspace_b, cache_b) = fixture();
    write_source(workspace_b.path(), "a.c", "alpha\n");
    write_source(workspace_b.path(), "b.c", "beta\n");
    let build = engine_with(workspace_b.path(), cache_b.path(), |config| CacheConfig {
        remote: Some(remote(false)),
        ..config
    });
    let summary = build.run(vec![upper_lib(), cat_app()]).unwrap();

    assert!(summary.ok(), "errors: {:?}", summary.errors);
    pretty_assert_eq!(summary.cached, 2);
    pretty_assert_eq!(summary.report.executed, 0);
    pretty_assert_eq!(
        std::fs::read_to_string(workspace_b.path().join("app.txt")).unwrap(),
        "ALPHA\nbeta\n"
    );

    // Promotion: the same keys are now satisfied by the local tier even
    // with the remote unreachable.
    let (workspace_c, _unused) = fixture();
    write_source(workspace_c.path(), "a.c", "alpha\n");
    write_source(workspace_c.path(), "b.c", "beta\n");
    let build = Build::builder()
        .workspace(workspace_c.path().to_path_buf())
        .cache_config(CacheConfig {
            remote: Some(
                RemoteConfig::builder()
                    .url(url::Url::parse("http://127.0.0.1:9/").unwrap())
                    .build(),
            ),
            ..CacheConfig::builder().root(cache_b.path().to_path_buf()).build()
        })
        .exec_config(ExecConfig::builder().workers(2).build())
        .build()
        .unwrap();
    let summary = build.run(vec![upper_lib(), cat_app()]).unwrap();
    assert!(summary.ok(), "errors: {:?}", summary.errors);
    pretty_assert_eq!(summary.cached, 2);
}

#[test]
fn keep_going_builds_unaffected_siblings() {
    let (workspace, cache) = fixture();

    let bad = script_target("//bad:bad", &[], &[], "echo broken >&2; exit 1", "bad.out");
    let down = script_target("//down:down", &[], &["//bad:bad"], "true", "down.out");
    let free = script_target("//free:free", &[], &[], "echo -n ok > free.out", "free.out");

    let build = engine(workspace.path(), cache.path());
    let summary = build.run(vec![bad, down, free]).unwrap();

    pretty_assert_eq!(summary.failed, 1);
    pretty_assert_eq!(summary.skipped, 1);
    pretty_assert_eq!(summary.succeeded, 1);
    assert!(workspace.path().join("free.out").exists());
    assert!(!workspace.path().join("down.out").exists());

    let (label, error) = &summary.errors[0];
    pretty_assert_eq!(label, &Label::must("//bad:bad"));
    assert!(error.contains("broken"), "error: {error}");
    pretty_assert_eq!(summary.exit_code(), 1);
}

#[test]
fn flaky_test_passes_on_a_later_attempt() {
    let (workspace, cache) = fixture();

    // Fails on the first attempt, passes once the marker exists. The
    // marker lives in the workspace so it survives sandbox teardown.
    let marker = workspace.path().join("flaked-once");
    let test = Target::builder()
        .label(Label::must("//t:flaky"))
        .target_type(TargetType::Test)
        .language(Language::Custom)
        .env(
            [(
                "MARKER".to_string(),
                marker.to_string_lossy().into_owned(),
            )]
            .into_iter()
            .collect(),
        )
        .config(
            [(
                "command".to_string(),
                serde_json::json!([
                    "sh",
                    "-c",
                    "if [ -f \"$MARKER\" ]; then exit 0; else touch \"$MARKER\"; exit 1; fi"
                ]),
            )]
            .into_iter()
            .collect(),
        )
        .build();

    let build = engine(workspace.path(), cache.path());
    let summary = build.run(vec![test]).unwrap();

    // The first failure consumed one attempt of the flakiness budget; the
    // second attempt passed, so the build is green.
    assert!(summary.ok(), "errors: {:?}", summary.errors);
    pretty_assert_eq!(summary.succeeded, 1);
    assert!(marker.exists());
}

#[test]
fn events_narrate_the_build() {
    let (workspace, cache) = fixture();
    write_source(workspace.path(), "a.c", "alpha\n");

    let (sink, rx) = ChannelSink::bounded(256);
    let build = Build::builder()
        .workspace(workspace.path().to_path_buf())
        .cache_config(CacheConfig::builder().root(cache.path().to_path_buf()).build())
        .exec_config(ExecConfig::builder().workers(2).build())
        .events(forge::events::EventBus::new(Arc::new(sink)))
        .build()
        .unwrap();

    build.run(vec![upper_lib()]).unwrap();

    let kinds = rx.try_iter().map(|event| event.event.kind()).collect::<Vec<_>>();
    for expected in ["cache_miss", "action_miss", "action_start", "action_complete", "cache_update"] {
        assert!(kinds.contains(&expected), "missing {expected} in {kinds:?}");
    }
}
