//! Tests for the layer store.
//!
//! Validates chain resolution, config inheritance, create/remove guards,
//! and pid-file semantics against a temporary store.

use podder::config::Config;
use podder::error::Error;
use podder::store::LayerStore;
use tempfile::TempDir;

fn store() -> (TempDir, LayerStore) {
    let temp = TempDir::new().unwrap();
    let store = LayerStore::open(temp.path().join("store")).unwrap();
    (temp, store)
}

// =============================================================================
// Chain Resolution
// =============================================================================

#[test]
fn test_create_with_parent_extends_the_chain() {
    let (_temp, store) = store();
    store.create("base", None, None).unwrap();
    store.create("leaf", Some("base"), None).unwrap();

    let leaf_chain: Vec<String> = store
        .chain("leaf")
        .unwrap()
        .iter()
        .map(|l| l.name().to_string())
        .collect();
    let base_chain: Vec<String> = store
        .chain("base")
        .unwrap()
        .iter()
        .map(|l| l.name().to_string())
        .collect();

    // chain(leaf) == [leaf, chain(base)...]
    let mut expected = vec!["leaf".to_string()];
    expected.extend(base_chain);
    assert_eq!(leaf_chain, expected);
}

#[test]
fn test_resolving_unknown_layers_fails_not_found() {
    let (_temp, store) = store();
    assert!(matches!(
        store.resolve("ghost"),
        Err(Error::LayerNotFound(_))
    ));
    assert!(matches!(store.chain("ghost"), Err(Error::LayerNotFound(_))));
}

#[test]
fn test_list_skips_internal_directories() {
    let (_temp, store) = store();
    store.create("visible", None, None).unwrap();
    std::fs::create_dir_all(store.blob_cache_dir()).unwrap();

    let names: Vec<String> = store
        .list()
        .unwrap()
        .iter()
        .map(|l| l.name().to_string())
        .collect();
    assert_eq!(names, vec!["visible".to_string()]);
}

// =============================================================================
// Configuration Inheritance
// =============================================================================

#[test]
fn test_effective_config_is_a_root_to_leaf_fold() {
    let (_temp, store) = store();
    let root = Config::parse(
        "[container]\ncommand = /bin/sh\nhostname = rooty\nenv = A=root\n[storage]\nephemeral = true\n",
    )
    .unwrap();
    let mid = Config::parse("[container]\nhostname = middy\n").unwrap();
    let leaf = Config::parse("[container]\nenv = B=leaf\n[storage]\nephemeral = false\n").unwrap();

    store.create("root", None, Some(&root)).unwrap();
    store.create("mid", Some("root"), Some(&mid)).unwrap();
    store.create("leaf", Some("mid"), Some(&leaf)).unwrap();

    let effective = store.effective_config("leaf").unwrap();
    // Untouched keys come from the deepest ancestor.
    assert_eq!(effective.get("container", "command"), Some("/bin/sh"));
    // Later layers override by key.
    assert_eq!(effective.get("container", "hostname"), Some("middy"));
    assert_eq!(effective.get("storage", "ephemeral"), Some("false"));
    // env accumulates along the chain.
    assert_eq!(
        effective.get_all("container", "env"),
        vec!["A=root", "B=leaf"]
    );
}

#[test]
fn test_layers_without_config_have_an_empty_effective_config() {
    let (_temp, store) = store();
    store.create("bare", None, None).unwrap();
    assert!(store.effective_config("bare").unwrap().is_empty());
}

// =============================================================================
// Removal Guards
// =============================================================================

#[test]
fn test_remove_fails_while_a_child_exists() {
    let (_temp, store) = store();
    store.create("parent", None, None).unwrap();
    store.create("child", Some("parent"), None).unwrap();

    match store.remove("parent") {
        Err(Error::HasChildren { children, .. }) => {
            assert_eq!(children, vec!["child".to_string()])
        }
        other => panic!("expected HasChildren, got {:?}", other),
    }
}

#[test]
fn test_remove_fails_while_running() {
    let (_temp, store) = store();
    store.create("busy", None, None).unwrap();
    store.acquire_pid_file("busy").unwrap();
    store
        .set_running("busy", nix::unistd::Pid::this())
        .unwrap();

    assert!(matches!(store.remove("busy"), Err(Error::InUse { .. })));

    store.clear_running("busy").unwrap();
    store.remove("busy").unwrap();
}

// =============================================================================
// Pid Files
// =============================================================================

#[test]
fn test_second_start_claim_fails_already_running() {
    let (_temp, store) = store();
    store.create("one", None, None).unwrap();
    store.acquire_pid_file("one").unwrap();
    store.set_running("one", nix::unistd::Pid::this()).unwrap();

    // A concurrent start must fail and leave the pid file untouched.
    assert!(matches!(
        store.acquire_pid_file("one"),
        Err(Error::AlreadyRunning(_))
    ));
    assert_eq!(
        store.is_running("one").unwrap(),
        Some(nix::unistd::Pid::this())
    );
}

#[test]
fn test_dead_pids_are_garbage() {
    let (_temp, store) = store();
    let layer = store.create("gone", None, None).unwrap();
    std::fs::write(layer.pid_path(), format!("{}\n", i32::MAX - 7)).unwrap();

    assert!(store.is_running("gone").unwrap().is_none());
    // Reaped on observation; the slot can be claimed again.
    store.acquire_pid_file("gone").unwrap();
}
