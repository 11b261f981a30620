use std::path::Path;

use tempfile::TempDir;

use forge::{
    config::{CacheConfig, ExecConfig},
    driver::Build,
    label::Label,
    target::{Language, Target, TargetType},
};

pub mod props;
pub mod relay_stub;
pub mod scenarios;

/// A fresh workspace and cache directory pair.
#[track_caller]
pub fn fixture() -> (TempDir, TempDir) {
    let workspace = TempDir::new().expect("create workspace");
    let cache = TempDir::new().expect("create cache dir");
    (workspace, cache)
}

/// Write a source file into the workspace.
#[track_caller]
pub fn write_source(workspace: &Path, rel: &str, content: &str) {
    let path = workspace.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create source dir");
    }
    std::fs::write(path, content).expect("write source");
}

/// Open an engine over the given workspace and cache root.
#[track_caller]
pub fn engine(workspace: &Path, cache: &Path) -> Build {
    engine_with(workspace, cache, |config| config)
}

/// Open an engine with a tweaked cache configuration.
#[track_caller]
pub fn engine_with(
    workspace: &Path,
    cache: &Path,
    tweak: impl FnOnce(CacheConfig) -> CacheConfig,
) -> Build {
    let cache_config = tweak(CacheConfig::builder().root(cache.to_path_buf()).build());
    Build::builder()
        .workspace(workspace.to_path_buf())
        .cache_config(cache_config)
        .exec_config(ExecConfig::builder().workers(2).keep_going(true).build())
        .build()
        .expect("open engine")
}

/// A custom target that runs `sh -c <script>` producing `output`.
pub fn script_target(
    label: &str,
    sources: &[&str],
    deps: &[&str],
    script: &str,
    output: &str,
) -> Target {
    Target::builder()
        .label(Label::must(label))
        .target_type(TargetType::Custom)
        .language(Language::Custom)
        .sources(sources.iter().map(|s| s.to_string()).collect::<Vec<_>>())
        .deps(deps.iter().map(|d| Label::must(d)).collect::<Vec<_>>())
        .config(
            [(
                "command".to_string(),
                serde_json::json!(["sh", "-c", script]),
            )]
            .into_iter()
            .collect(),
        )
        .output(output.to_string())
        .build()
}

/// A C target compiled with the host toolchain.
pub fn c_target(label: &str, target_type: TargetType, sources: &[&str], deps: &[&str]) -> Target {
    Target::builder()
        .label(Label::must(label))
        .target_type(target_type)
        .language(Language::C)
        .sources(sources.iter().map(|s| s.to_string()).collect::<Vec<_>>())
        .deps(deps.iter().map(|d| Label::must(d)).collect::<Vec<_>>())
        .build()
}

/// Whether the host has a usable C toolchain; scenarios that compile for
/// real skip without one.
pub fn host_has_cc() -> bool {
    let probe = |program: &str| {
        std::process::Command::new(program)
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    };
    probe("cc") && probe("ar")
}
