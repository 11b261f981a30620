//! Property-based invariants.

use std::sync::Arc;

use proptest::prelude::*;

use forge::{
    action::{Action, ActionType},
    cache::{TargetCache, TargetEntry},
    cas::BlobStore,
    config::CacheConfig,
    error::GraphError,
    graph::BuildGraph,
    hash::{Digest, Fingerprint},
    label::Label,
    target::{Language, Target, TargetType},
};

fn cases(n: u32) -> ProptestConfig {
    ProptestConfig {
        cases: n,
        ..ProptestConfig::default()
    }
}

proptest! {
    #![proptest_config(cases(32))]

    /// CAS round-trip: whatever goes in comes back out, under its own
    /// digest, and distinct contents get distinct digests.
    #[test]
    fn cas_collision_freedom(first in prop::collection::vec(any::<u8>(), 0..512),
                             second in prop::collection::vec(any::<u8>(), 0..512)) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let first_digest = store.put(&first).unwrap();
        let second_digest = store.put(&second).unwrap();

        prop_assert_eq!(store.get(&first_digest).unwrap(), Some(first.clone()));
        prop_assert_eq!(store.get(&second_digest).unwrap(), Some(second.clone()));
        prop_assert_eq!(first == second, first_digest == second_digest);
    }

    /// Composite hashing is prefix-safe: different splits of the same
    /// bytes produce different keys.
    #[test]
    fn composite_hash_prefix_safety(bytes in prop::collection::vec(any::<u8>(), 2..64),
                                    split_a in 1usize..63,
                                    split_b in 1usize..63) {
        let split_a = split_a.min(bytes.len() - 1);
        let split_b = split_b.min(bytes.len() - 1);
        prop_assume!(split_a != split_b);

        let key_a = Digest::from_fields([&bytes[..split_a], &bytes[split_a..]]);
        let key_b = Digest::from_fields([&bytes[..split_b], &bytes[split_b..]]);
        prop_assert_ne!(key_a, key_b);
    }

    /// Cache idempotence: a repeated identical update is indistinguishable
    /// from a single one.
    #[test]
    fn cache_update_idempotence(content in prop::collection::vec(any::<u8>(), 1..128),
                                repeat in 1usize..4) {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::builder().root(dir.path().to_path_buf()).build();
        let cas = Arc::new(BlobStore::open(dir.path()).unwrap());
        let cache = TargetCache::open_targets(config, Arc::clone(&cas)).unwrap();

        let output = cas.put(&content).unwrap();
        let entry = TargetEntry::builder()
            .output(output)
            .bytes(content.len() as u64)
            .at(jiff::Timestamp::now())
            .build();
        let fingerprint = Fingerprint::from_fields([&content]);

        for _ in 0..repeat {
            cache.update(&fingerprint, entry.clone()).unwrap();
        }
        prop_assert_eq!(cache.len(), 1);
        prop_assert_eq!(cache.lookup(&fingerprint), Some(entry));
    }

    /// Every ring of targets is rejected as a cycle, whatever its length.
    #[test]
    fn cycle_detection_completeness(len in 2usize..8) {
        let targets = (0..len)
            .map(|i| {
                Target::builder()
                    .label(Label::must(format!("//ring:n{i}")))
                    .target_type(TargetType::Library)
                    .language(Language::C)
                    .deps(vec![Label::must(format!("//ring:n{}", (i + 1) % len))])
                    .build()
            })
            .collect::<Vec<_>>();

        match BuildGraph::build(targets) {
            Err(GraphError::Cycle { path }) => prop_assert_eq!(path.len(), len + 1),
            other => prop_assert!(false, "expected cycle, got {:?}", other.is_ok()),
        }
    }

    /// Forward-only edges always build: no false cycle reports.
    #[test]
    fn forward_dags_are_accepted(edges in prop::collection::vec((0usize..8, 0usize..8), 0..16)) {
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); 8];
        for (a, b) in edges {
            // Orient every edge from the higher index to the lower one so
            // no cycle can form.
            let (from, to) = (a.max(b), a.min(b));
            if from != to && !deps[from].contains(&to) {
                deps[from].push(to);
            }
        }

        let targets = (0..8)
            .map(|i| {
                Target::builder()
                    .label(Label::must(format!("//dag:n{i}")))
                    .target_type(TargetType::Library)
                    .language(Language::C)
                    .deps(
                        deps[i]
                            .iter()
                            .map(|d| Label::must(format!("//dag:n{d}")))
                            .collect::<Vec<_>>(),
                    )
                    .build()
            })
            .collect::<Vec<_>>();

        prop_assert!(BuildGraph::build(targets).is_ok());
    }

    /// Renaming a target leaves its action fingerprints unchanged.
    #[test]
    fn fingerprint_stable_under_rename(content in prop::collection::vec(any::<u8>(), 1..64),
                                       old_name in "[a-z]{1,8}",
                                       new_name in "[a-z]{1,8}") {
        prop_assume!(old_name != new_name);
        let digest = Digest::from_buffer(&content);

        let action = |name: &str| {
            Action::builder()
                .label(Label::must(format!("//pkg:{name}")))
                .kind(ActionType::Compile)
                .sub("src/a.c")
                .command(vec![
                    "cc".into(),
                    "-c".into(),
                    "src/a.c".into(),
                    "-o".into(),
                    format!("obj/pkg/{name}/src/a.c.o"),
                ])
                .inputs(vec![digest.clone()])
                .sources(vec!["src/a.c".into()])
                .outputs(vec![format!("obj/pkg/{name}/src/a.c.o")])
                .build()
        };

        prop_assert_eq!(
            action(&old_name).fingerprint(),
            action(&new_name).fingerprint()
        );
    }

    /// GC never deletes a blob referenced by a live entry.
    #[test]
    fn gc_safety(contents in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..8),
                 live_mask in prop::collection::vec(any::<bool>(), 8)) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let digests = contents
            .iter()
            .map(|content| store.put(content).unwrap())
            .collect::<Vec<_>>();
        let live = digests
            .iter()
            .zip(live_mask.iter())
            .filter(|&(_, &keep)| keep)
            .map(|(digest, _)| digest.clone())
            .collect::<Vec<_>>();

        store.gc(live.iter(), std::time::Duration::ZERO).unwrap();
        for digest in &live {
            prop_assert!(store.has(digest).unwrap(), "live blob {digest} was swept");
        }
    }
}

/// Two-tier soundness: unchanged content is never rehashed, changed
/// content always is. (Deterministic rather than proptest: the property is
/// about the transition, not the data.)
#[test]
fn two_tier_change_detection_soundness() {
    use forge::track::FileTracker;

    let cache = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    let tracker = FileTracker::load(cache.path(), workspace.path()).unwrap();

    std::fs::write(workspace.path().join("f"), b"one").unwrap();
    let first = tracker.check("f").unwrap();

    // Unchanged: metadata tier answers, content digest stable.
    let again = tracker.check("f").unwrap();
    assert_eq!(first, again);
    assert_eq!(tracker.stats().rehashes, 1);

    // Changed content is always seen. (Different length, so the change is
    // visible to the metadata tier even on coarse-mtime filesystems.)
    std::fs::write(workspace.path().join("f"), b"twos").unwrap();
    let changed = tracker.check("f").unwrap();
    assert_ne!(first, changed);
    assert_eq!(changed, Digest::from_buffer(b"twos"));
}
