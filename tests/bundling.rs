//! Deterministic source bundling

mod fixtures;

use std::fs;
use std::thread;
use std::time::Duration;

use agent_launch::bundle::{BundleError, Bundler};
use fixtures::*;
use tempfile::TempDir;

#[test]
fn test_same_tree_same_hash_and_bytes() {
    let a = agent_dir();
    thread::sleep(Duration::from_millis(20));
    let b = TempDir::new().unwrap();
    // Different creation order and mtimes
    fs::create_dir_all(b.path().join("tools")).unwrap();
    fs::write(b.path().join("tools/search.py"), "def search(q):\n    return []\n").unwrap();
    write_agent_source(b.path());

    let first = Bundler::new(a.path()).unwrap().create_bundle(AGENT).unwrap();
    let second = Bundler::new(b.path()).unwrap().create_bundle(AGENT).unwrap();

    assert_eq!(first.content_hash, second.content_hash);
    assert_eq!(first.archive, second.archive);
    assert_eq!(first.storage_key, second.storage_key);
}

#[test]
fn test_content_change_changes_hash() {
    let dir = agent_dir();
    let before = Bundler::new(dir.path()).unwrap().create_bundle(AGENT).unwrap();
    fs::write(dir.path().join("agent.py"), "def handler(event):\n    return None\n").unwrap();
    let after = Bundler::new(dir.path()).unwrap().create_bundle(AGENT).unwrap();

    assert_ne!(before.content_hash, after.content_hash);
    assert_ne!(before.storage_key, after.storage_key);
}

#[test]
fn test_ignored_paths_do_not_affect_hash() {
    let dir = agent_dir();
    let clean = Bundler::new(dir.path()).unwrap().create_bundle(AGENT).unwrap();

    fs::create_dir_all(dir.path().join(".git")).unwrap();
    fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
    fs::create_dir_all(dir.path().join("__pycache__")).unwrap();
    fs::write(dir.path().join("__pycache__/agent.cpython-312.pyc"), [0u8, 1, 2]).unwrap();
    fs::write(dir.path().join(".dockerignore"), "notes/\n").unwrap();
    fs::create_dir_all(dir.path().join("notes")).unwrap();
    fs::write(dir.path().join("notes/todo.md"), "later\n").unwrap();

    let bundler = Bundler::new(dir.path())
        .unwrap()
        .with_ignore_file(&dir.path().join(".dockerignore"))
        .unwrap()
        .with_excludes(&[".dockerignore"])
        .unwrap();
    let noisy = bundler.create_bundle(AGENT).unwrap();

    assert_eq!(clean.content_hash, noisy.content_hash);
    assert!(noisy.require("Dockerfile").is_ok());
}

#[test]
fn test_size_ceiling() {
    let dir = agent_dir();
    fs::write(dir.path().join("weights.bin"), vec![7u8; 64 * 1024]).unwrap();

    let err = Bundler::new(dir.path())
        .unwrap()
        .with_max_bytes(1024)
        .create_bundle(AGENT)
        .unwrap_err();
    assert!(matches!(err, BundleError::SizeExceeded { .. }));
}
