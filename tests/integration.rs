use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

struct TestEnv {
    _tmp: TempDir,
    home: PathBuf,
    config_dir: PathBuf,
    clones_dir: PathBuf,
}

fn setup_test_env() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let home = root.join("home");
    fs::create_dir_all(&home).unwrap();

    TestEnv {
        home,
        config_dir: root.join("config"),
        clones_dir: root.join("clones"),
        _tmp: tmp,
    }
}

/// A checkout with a README, as `clones sync` would leave it.
fn fake_checkout(env: &TestEnv, owner: &str, repo: &str, readme: &str) -> PathBuf {
    let dir = env.clones_dir.join(owner).join(repo);
    fs::create_dir_all(dir.join(".git")).unwrap();
    fs::write(dir.join("README.md"), readme).unwrap();
    dir
}

fn run_clones(env: &TestEnv, args: &[&str]) -> (String, String, bool) {
    let binary = Path::new(env!("CARGO_BIN_EXE_clones"));
    let output = Command::new(binary)
        .args(args)
        .env("HOME", &env.home)
        .env("CLONES_CONFIG_DIR", &env.config_dir)
        .env("CLONES_CONTENT_DIR", &env.clones_dir)
        .env_remove("CLONES_DIR")
        .env_remove("CLONES_SYNC_CONCURRENCY")
        .env_remove("XDG_CONFIG_HOME")
        .env_remove("OPENAI_API_KEY")
        .env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .output()
        .unwrap_or_else(|e| panic!("Failed to run clones binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_add_then_rebuild_and_list() {
    let env = setup_test_env();

    let (stdout, stderr, success) = run_clones(&env, &["add", "git@github.com:Acme/Widgets.git", "--tag", "cli"]);
    assert!(success, "add failed: {}", stderr);
    assert!(stdout.contains("added github.com:acme/widgets"));

    let registry = fs::read_to_string(env.clones_dir.join("registry.jsonl")).unwrap();
    assert!(registry.contains("\"github.com:acme/widgets\""));
    assert!(registry.contains("\"cli\""));

    let (stdout, stderr, success) = run_clones(&env, &["index", "rebuild"]);
    assert!(success, "index rebuild failed: {}", stderr);
    assert!(stdout.contains("not cloned: 1"));

    let (stdout, _, success) = run_clones(&env, &["list"]);
    assert!(success);
    assert!(stdout.contains("acme/widgets"));
}

#[test]
fn test_add_rejects_garbage_url() {
    let env = setup_test_env();
    let (_, stderr, success) = run_clones(&env, &["add", "not a url"]);
    assert!(!success);
    assert!(stderr.contains("error:"));
}

#[test]
fn test_search_finds_indexed_readme() {
    let env = setup_test_env();
    fake_checkout(
        &env,
        "acme",
        "widgets",
        "# Widgets\n\nThis README holds important information about sprockets.\n",
    );
    fake_checkout(&env, "acme", "gears", "# Gears\n\nNothing to see here.\n");
    run_clones(&env, &["add", "https://github.com/acme/widgets"]);
    run_clones(&env, &["add", "https://github.com/acme/gears"]);

    let (stdout, stderr, success) = run_clones(&env, &["index", "rebuild"]);
    assert!(success, "index rebuild failed: {}", stderr);
    assert!(stdout.contains("readmes indexed: 2"));

    let (stdout, stderr, success) = run_clones(&env, &["search", "-q", "important", "--mode", "bm25", "--explain"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("acme/widgets"));
    assert!(!stdout.contains("acme/gears"));
    assert!(stdout.contains("bm25: rank=1"));

    // Without embeddings, hybrid falls back to the lexical signal.
    let (stdout, _, success) = run_clones(&env, &["search", "-q", "sprockets"]);
    assert!(success);
    assert!(stdout.contains("acme/widgets"));

    let (stdout, _, success) = run_clones(&env, &["list", "--filter", "sprockets"]);
    assert!(success);
    assert!(stdout.starts_with("acme/widgets"));
}

#[test]
fn test_search_validation_exits_1_without_side_effects() {
    let env = setup_test_env();

    for args in [
        vec!["search", "-q", "x", "--mode", "fuzzy"],
        vec!["search", "-q", "x", "--limit", "0"],
        vec!["search", "-q", "x", "--blend", "1.5"],
        vec!["search", "-q", "x", "--rerank-top", "-1"],
        vec!["search", "-q", "x", "--mode", "vector"],
    ] {
        let (_, stderr, success) = run_clones(&env, &args);
        assert!(!success, "{:?} should fail", args);
        assert!(stderr.contains("error:"), "{:?}: {}", args, stderr);
    }
    assert!(!env.config_dir.join("clones.db").exists());
}

#[test]
fn test_unknown_command_exits_1() {
    let env = setup_test_env();
    let binary = Path::new(env!("CARGO_BIN_EXE_clones"));
    let status = Command::new(binary)
        .arg("frobnicate")
        .env("CLONES_CONFIG_DIR", &env.config_dir)
        .env("CLONES_CONTENT_DIR", &env.clones_dir)
        .output()
        .unwrap()
        .status;
    assert_eq!(status.code(), Some(1));

    let (stdout, _, success) = run_clones(&env, &["--help"]);
    assert!(success);
    assert!(stdout.contains("sync"));
}

#[test]
fn test_rm_tombstones_and_deletes_checkout() {
    let env = setup_test_env();
    let dir = fake_checkout(&env, "acme", "widgets", "# Widgets\n");
    run_clones(&env, &["add", "https://github.com/acme/widgets"]);

    // Non-interactive without --yes refuses.
    let (_, stderr, success) = run_clones(&env, &["rm", "acme/widgets"]);
    assert!(!success);
    assert!(stderr.contains("--yes"));
    assert!(dir.exists());

    let (stdout, stderr, success) = run_clones(&env, &["rm", "acme/widgets", "--yes"]);
    assert!(success, "rm failed: {}", stderr);
    assert!(stdout.contains("removed github.com:acme/widgets"));
    assert!(!dir.exists());
    assert!(!env.clones_dir.join("acme").exists());

    let registry = fs::read_to_string(env.clones_dir.join("registry.jsonl")).unwrap();
    assert!(registry.contains("\"tombstone\""));
    assert!(!registry.contains("\"kind\":\"repo\""));

    let (_, _, success) = run_clones(&env, &["rm", "acme/widgets", "--yes"]);
    assert!(!success);
}

#[test]
fn test_rm_keep_disk() {
    let env = setup_test_env();
    let dir = fake_checkout(&env, "acme", "widgets", "# Widgets\n");
    run_clones(&env, &["add", "https://github.com/acme/widgets"]);

    let (_, stderr, success) = run_clones(&env, &["rm", "github.com:acme/widgets", "--keep-disk", "--yes"]);
    assert!(success, "rm failed: {}", stderr);
    assert!(dir.exists());
}

#[test]
fn test_sync_dry_run_writes_nothing() {
    let env = setup_test_env();
    fs::create_dir_all(&env.clones_dir).unwrap();

    let (stdout, stderr, success) = run_clones(&env, &["sync", "--dry-run", "--progress", "off"]);
    assert!(success, "sync --dry-run failed: {}", stderr);
    assert!(stdout.contains("sync (dry-run)"));

    assert!(!env.clones_dir.join("registry.jsonl").exists());
    assert!(!env.config_dir.join("local.json").exists());
    assert!(!env.config_dir.join("clones.db").exists());
}

#[test]
fn test_sync_rejects_bad_progress_mode() {
    let env = setup_test_env();
    let (_, _, success) = run_clones(&env, &["sync", "--dry-run", "--progress", "loud"]);
    assert!(!success);
}

#[test]
fn test_corrupt_registry_is_reported() {
    let env = setup_test_env();
    fs::create_dir_all(&env.clones_dir).unwrap();
    fs::write(env.clones_dir.join("registry.jsonl"), "{ this is not json\n").unwrap();

    let (_, stderr, success) = run_clones(&env, &["add", "https://github.com/acme/widgets"]);
    assert!(!success);
    assert!(stderr.contains("corrupt"), "stderr: {}", stderr);
    assert!(stderr.contains("clones doctor"), "stderr: {}", stderr);
}

#[test]
fn test_doctor_resets_corrupt_registry() {
    let env = setup_test_env();
    fs::create_dir_all(&env.clones_dir).unwrap();
    fs::write(env.clones_dir.join("registry.jsonl"), "{ this is not json\n").unwrap();

    // Non-interactive without --yes leaves the file alone.
    let (_, stderr, success) = run_clones(&env, &["doctor"]);
    assert!(!success);
    assert!(stderr.contains("--yes"), "stderr: {}", stderr);

    let (stdout, stderr, success) = run_clones(&env, &["doctor", "--yes"]);
    assert!(success, "doctor failed: {}", stderr);
    assert!(stdout.contains("registry reset"));
    assert!(stdout.contains("local state created"));
    assert!(stdout.contains("database: 0 mirrored"));
    let backups = fs::read_dir(&env.clones_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("registry.jsonl.corrupt-"))
        .count();
    assert_eq!(backups, 1);

    let (_, stderr, success) = run_clones(&env, &["add", "https://github.com/acme/widgets"]);
    assert!(success, "add after doctor failed: {}", stderr);
}

#[test]
fn test_stars_without_token() {
    let env = setup_test_env();
    let (stdout, _, success) = run_clones(&env, &["stars"]);
    assert!(success);
    assert!(stdout.contains("Not authenticated with GitHub"));
}
