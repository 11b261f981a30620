//! Lowering targets into actions.
//!
//! Each non-cached target becomes one or more actions: per-source compile
//! actions feeding a terminal link/package/test action, with an optional
//! codegen action ahead of the compiles. Cross-target ordering is inherited
//! from the target DAG by wiring each dependency's terminal action in front
//! of the dependent's entry actions.
//!
//! Compile fingerprints deliberately cover only the target's own sources
//! and command, so an upstream rebuild that does not change a file's
//! content leaves sibling compiles cached; terminal actions consume
//! dependency outputs and resolve those digests into their fingerprints at
//! execution time.

use std::collections::HashMap;

use tracing::{debug, instrument};

use crate::{
    action::{Action, ActionType},
    analyzer::TargetAnalysis,
    error::GraphError,
    graph::{ActionGraph, BuildGraph, NodeStatus},
    label::Label,
    target::{Language, Target, TargetType},
};

/// Lower every non-cached target into the action graph.
///
/// Targets whose node status is [`NodeStatus::Cached`] are skipped: their
/// outputs were restored from the cache, and their dependents read the
/// recorded output digest from the target node instead of an action edge.
#[instrument(name = "lower", skip_all)]
pub fn lower(
    graph: &BuildGraph,
    analyses: &HashMap<Label, TargetAnalysis>,
) -> Result<ActionGraph, GraphError> {
    let mut actions = ActionGraph::new();

    for &node_id in graph.topo_order() {
        let node = graph.node(node_id);
        if node.status() == NodeStatus::Cached {
            continue;
        }
        let target = &node.target;
        let analysis = analyses.get(&target.label);

        let mut entry_actions = Vec::new();
        let mut compiles = Vec::new();

        // Optional codegen step ahead of every compile.
        let codegen = if target.config.contains_key("codegen") {
            let action = actions.add_action(
                codegen_action(target),
                node_id,
                false,
            );
            entry_actions.push(action);
            Some(action)
        } else {
            None
        };

        // Scripted targets (custom, and tests with a declared command) run
        // one action against their sources; everything else compiles
        // per-source.
        if !scripted(target) {
            for (source, digest) in sources_of(target, analysis) {
                let action = actions.add_action(
                    compile_action(target, &source, digest),
                    node_id,
                    false,
                );
                if let Some(codegen) = codegen {
                    actions.add_edge(codegen, action)?;
                } else {
                    entry_actions.push(action);
                }
                compiles.push(action);
            }
        }

        let terminal = actions.add_action(
            terminal_action(target, analysis, &compiles_outputs(target, analysis)),
            node_id,
            true,
        );
        for &compile in &compiles {
            actions.add_edge(compile, terminal)?;
        }
        if compiles.is_empty() {
            if let Some(codegen) = codegen {
                actions.add_edge(codegen, terminal)?;
            } else {
                entry_actions.push(terminal);
            }
        }

        // Inherit cross-target ordering: every dependency's terminal action
        // runs before this target's entry actions.
        for &dep in &node.deps {
            let Some(dep_terminal) = actions.terminal_of(dep) else {
                // Dependency was cached; nothing to order against.
                continue;
            };
            for &entry in &entry_actions {
                actions.add_edge(dep_terminal, entry)?;
            }
        }
    }

    actions.seal()?;
    debug!(actions = actions.len(), "lowered targets");
    Ok(actions)
}

/// Whether a target runs a declared command instead of compiling
/// per-source.
fn scripted(target: &Target) -> bool {
    matches!(target.target_type, TargetType::Custom)
        || (target.target_type == TargetType::Test && target.config.contains_key("command"))
}

/// The declared sources of a target with their content digests.
fn sources_of(
    target: &Target,
    analysis: Option<&TargetAnalysis>,
) -> Vec<(String, crate::hash::Digest)> {
    match analysis {
        Some(analysis) => analysis
            .files
            .iter()
            .map(|file| (file.path.clone(), file.digest.clone()))
            .collect(),
        None => {
            debug_assert!(
                target.sources.is_empty(),
                "target with sources was not analyzed"
            );
            Vec::new()
        }
    }
}

/// Relative path for a compile output.
fn object_path(target: &Target, source: &str) -> String {
    format!("obj/{}/{}/{source}.o", target.label.package(), target.label.name())
}

/// Relative path for the terminal output.
fn final_output_path(target: &Target) -> String {
    if let Some(output) = &target.output {
        return output.clone();
    }
    let stem = format!("bin/{}/{}", target.label.package(), target.label.name());
    match target.target_type {
        TargetType::Library => format!("{stem}.a"),
        _ => stem,
    }
}

fn compile_action(target: &Target, source: &str, digest: crate::hash::Digest) -> Action {
    let object = object_path(target, source);
    let mut command = compiler_for(target.language);
    command.extend(target.flags.iter().cloned());
    command.extend(["-c".into(), source.to_string(), "-o".into(), object.clone()]);

    Action::builder()
        .label(target.label.clone())
        .kind(ActionType::Compile)
        .sub(source)
        .command(command)
        .env(target.env.clone())
        .inputs(vec![digest])
        .sources(vec![source.to_string()])
        .outputs(vec![object])
        .build()
}

/// The codegen step declared by a target's `codegen` config key. An array
/// value is the generator command; any other value gets a no-op command,
/// keeping the ordering slot without running anything.
fn codegen_action(target: &Target) -> Action {
    let command = target
        .config
        .get("codegen")
        .and_then(|value| value.as_array())
        .map(|args| {
            args.iter()
                .filter_map(|arg| arg.as_str().map(String::from))
                .collect::<Vec<_>>()
        })
        .unwrap_or_else(|| vec!["true".to_string()]);

    Action::builder()
        .label(target.label.clone())
        .kind(ActionType::Codegen)
        .command(command)
        .env(target.env.clone())
        .build()
}

fn terminal_action(
    target: &Target,
    analysis: Option<&TargetAnalysis>,
    objects: &[String],
) -> Action {
    let output = final_output_path(target);
    let has_command = target.config.contains_key("command");
    let (kind, mut command, outputs) = match target.target_type {
        // Tests with a declared command run it directly; compiled tests
        // link a runner binary.
        TargetType::Test if has_command => (
            ActionType::Test,
            custom_command(target),
            target.output.iter().cloned().collect(),
        ),
        TargetType::Executable => {
            let mut command = linker_for(target.language);
            command.extend(objects.iter().cloned());
            command.extend(["-o".into(), output.clone()]);
            (ActionType::Link, command, vec![output])
        }
        TargetType::Library => {
            let mut command = vec!["ar".to_string(), "rcs".to_string(), output.clone()];
            command.extend(objects.iter().cloned());
            (ActionType::Package, command, vec![output])
        }
        TargetType::Test => {
            let mut command = linker_for(target.language);
            command.extend(objects.iter().cloned());
            command.extend(["-o".into(), output.clone()]);
            (ActionType::Test, command, vec![output])
        }
        TargetType::Custom => (
            ActionType::Custom,
            custom_command(target),
            target.output.iter().cloned().collect(),
        ),
    };
    command.extend(target.flags.iter().filter(|flag| flag.starts_with("-l")).cloned());

    // Scripted actions run against the declared sources directly, so
    // their source digests are static inputs; compiled targets' terminal
    // actions consume only dependency outputs, resolved at execution.
    let (sources, inputs) = if scripted(target) {
        let analyzed = sources_of(target, analysis);
        if analyzed.is_empty() {
            (target.sources.clone(), Vec::new())
        } else {
            analyzed.into_iter().unzip()
        }
    } else {
        (Vec::new(), Vec::new())
    };

    Action::builder()
        .label(target.label.clone())
        .kind(kind)
        .command(command)
        .env(target.env.clone())
        .inputs(inputs)
        .sources(sources)
        .outputs(outputs)
        .maybe_max_retries(
            target
                .config
                .get("max_retries")
                .and_then(|value| value.as_u64())
                .map(|value| value as u32),
        )
        .maybe_timeout(
            target
                .config
                .get("timeout_secs")
                .and_then(|value| value.as_u64())
                .map(std::time::Duration::from_secs),
        )
        .build()
}

fn compiles_outputs(target: &Target, analysis: Option<&TargetAnalysis>) -> Vec<String> {
    sources_of(target, analysis)
        .iter()
        .map(|(source, _)| object_path(target, source))
        .collect()
}

fn compiler_for(language: Language) -> Vec<String> {
    match language {
        Language::C => vec!["cc".into()],
        Language::Cpp => vec!["c++".into()],
        Language::Rust => vec!["rustc".into(), "--emit=obj".into()],
        Language::Go => vec!["go".into(), "tool".into(), "compile".into()],
        Language::Python => vec!["python3".into(), "-m".into(), "py_compile".into()],
        Language::JavaScript | Language::TypeScript => vec!["tsc".into()],
        Language::Custom => vec!["true".into()],
    }
}

fn linker_for(language: Language) -> Vec<String> {
    match language {
        Language::C => vec!["cc".into()],
        Language::Cpp => vec!["c++".into()],
        Language::Rust => vec!["rustc".into()],
        Language::Go => vec!["go".into(), "tool".into(), "link".into()],
        _ => vec!["cc".into()],
    }
}

/// Custom targets declare their command in the `command` config key;
/// together with `max_retries` and `timeout_secs` these are the only
/// config keys with engine-defined meaning. Everything else in the bag
/// passes through untouched.
fn custom_command(target: &Target) -> Vec<String> {
    target
        .config
        .get("command")
        .and_then(|value| value.as_array())
        .map(|args| {
            args.iter()
                .filter_map(|arg| arg.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_else(|| vec!["true".to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Digest;
    use crate::analyzer::{AnalysisMetrics, FileAnalysis};
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn analysis_for(paths: &[&str]) -> TargetAnalysis {
        TargetAnalysis {
            files: paths
                .iter()
                .map(|path| FileAnalysis {
                    path: path.to_string(),
                    digest: Digest::from_buffer(path.as_bytes()),
                    imports: Vec::new(),
                    errors: Vec::new(),
                    valid: true,
                })
                .collect(),
            imports: Vec::new(),
            metrics: AnalysisMetrics::default(),
        }
    }

    fn library(label: &str, sources: &[&str], deps: &[&str]) -> Target {
        Target::builder()
            .label(Label::must(label))
            .target_type(TargetType::Library)
            .language(Language::C)
            .sources(sources.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .deps(deps.iter().map(|d| Label::must(d)).collect::<Vec<_>>())
            .build()
    }

    #[test]
    fn library_lowers_to_compiles_plus_archive() {
        let graph = BuildGraph::build(vec![library("//lib:a", &["a.c", "b.c"], &[])]).unwrap();
        let mut analyses = HashMap::new();
        analyses.insert(Label::must("//lib:a"), analysis_for(&["a.c", "b.c"]));

        let actions = lower(&graph, &analyses).unwrap();
        pretty_assert_eq!(actions.len(), 3);

        let node = graph.lookup(&Label::must("//lib:a")).unwrap();
        let terminal = actions.terminal_of(node).unwrap();
        pretty_assert_eq!(actions.node(terminal).action.kind, ActionType::Package);
        pretty_assert_eq!(actions.node(terminal).deps.len(), 2);

        // Compiles are ready immediately, the archive waits.
        pretty_assert_eq!(actions.ready_actions().len(), 2);
    }

    #[test]
    fn cross_target_ordering_goes_through_terminals() {
        let graph = BuildGraph::build(vec![
            library("//lib:a", &["a.c"], &[]),
            library("//lib:b", &["b.c"], &["//lib:a"]),
        ])
        .unwrap();
        let mut analyses = HashMap::new();
        analyses.insert(Label::must("//lib:a"), analysis_for(&["a.c"]));
        analyses.insert(Label::must("//lib:b"), analysis_for(&["b.c"]));

        let actions = lower(&graph, &analyses).unwrap();

        let a = graph.lookup(&Label::must("//lib:a")).unwrap();
        let b = graph.lookup(&Label::must("//lib:b")).unwrap();
        let a_terminal = actions.terminal_of(a).unwrap();

        // b's compile waits on a's archive.
        let b_compile = actions
            .actions_of(b)
            .iter()
            .copied()
            .find(|&id| actions.node(id).action.kind == ActionType::Compile)
            .unwrap();
        assert!(actions.node(b_compile).deps.contains(&a_terminal));
    }

    #[test]
    fn cached_targets_are_not_lowered() {
        let graph = BuildGraph::build(vec![
            library("//lib:a", &["a.c"], &[]),
            library("//lib:b", &["b.c"], &["//lib:a"]),
        ])
        .unwrap();
        let a = graph.lookup(&Label::must("//lib:a")).unwrap();
        graph.node(a).set_status(NodeStatus::Cached);

        let mut analyses = HashMap::new();
        analyses.insert(Label::must("//lib:b"), analysis_for(&["b.c"]));

        let actions = lower(&graph, &analyses).unwrap();
        pretty_assert_eq!(actions.actions_of(a).len(), 0);
        pretty_assert_eq!(actions.actions_of(graph.lookup(&Label::must("//lib:b")).unwrap()).len(), 2);

        // With the dependency cached, b's compile is immediately ready.
        pretty_assert_eq!(actions.ready_actions().len(), 1);
    }

    #[test]
    fn custom_target_takes_command_from_config() {
        let target = Target::builder()
            .label(Label::must("//job:x"))
            .target_type(TargetType::Custom)
            .language(Language::Custom)
            .config(
                [(
                    "command".to_string(),
                    serde_json::json!(["/bin/sh", "-c", "echo hi > out.txt"]),
                )]
                .into_iter()
                .collect(),
            )
            .output("out.txt".to_string())
            .build();

        let graph = BuildGraph::build(vec![target]).unwrap();
        let actions = lower(&graph, &HashMap::new()).unwrap();
        pretty_assert_eq!(actions.len(), 1);

        let only = &actions.nodes()[0];
        pretty_assert_eq!(only.action.kind, ActionType::Custom);
        pretty_assert_eq!(
            only.action.command,
            vec!["/bin/sh", "-c", "echo hi > out.txt"]
        );
        pretty_assert_eq!(only.action.outputs, vec!["out.txt".to_string()]);
        assert!(only.terminal);
    }

    #[test]
    fn codegen_precedes_compiles() {
        let mut target = library("//gen:lib", &["a.c"], &[]);
        target.config.insert("codegen".into(), serde_json::json!(true));

        let graph = BuildGraph::build(vec![target]).unwrap();
        let mut analyses = HashMap::new();
        analyses.insert(Label::must("//gen:lib"), analysis_for(&["a.c"]));

        let actions = lower(&graph, &analyses).unwrap();
        pretty_assert_eq!(actions.len(), 3);

        // Only the codegen action is initially ready.
        let ready = actions.ready_actions();
        pretty_assert_eq!(ready.len(), 1);
        pretty_assert_eq!(actions.node(ready[0]).action.kind, ActionType::Codegen);
    }
}
