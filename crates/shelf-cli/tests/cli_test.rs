//! End-to-end tests for the shelf binary
//!
//! Each test runs the built binary against its own cache directory, with
//! HOME and the working directory pointed at a temp dir so no real config
//! is picked up.

use std::io::Write;
use std::process::{Command, Output, Stdio};

use shelf_config::testing::TestEnvironment;

fn shelf(env: &TestEnvironment, args: &[&str]) -> Output {
    shelf_with_stdin(env, args, None)
}

fn shelf_with_stdin(env: &TestEnvironment, args: &[&str], stdin: Option<&[u8]>) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_shelf"))
        .arg("--cache-dir")
        .arg(&env.cache_root)
        .args(args)
        .current_dir(&env.project_root)
        .env("HOME", &env.data_dir)
        .env("SHELF_LOG", "off")
        .env_remove("SHELF_CACHE_DIR")
        .env_remove("SHELF_DATA_DIR")
        .env_remove("SHELF_MAX_ENTRIES")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to execute shelf");
    {
        let mut pipe = child.stdin.take().unwrap();
        if let Some(bytes) = stdin {
            pipe.write_all(bytes).unwrap();
        }
    }
    child.wait_with_output().unwrap()
}

fn stdout(output: &Output) -> String {
    assert!(
        output.status.success(),
        "shelf failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout.clone()).unwrap()
}

fn add_file(env: &TestEnvironment, name: &str, content: &[u8], labels: &[&str]) -> String {
    let path = env.create_file(name, content).unwrap();
    let path = path.to_str().unwrap();
    let mut args = vec!["add"];
    for label in labels {
        args.push("--label");
        args.push(*label);
    }
    args.push(path);
    stdout(&shelf(env, &args)).trim().to_string()
}

#[test]
fn test_add_ls_cat() {
    let env = TestEnvironment::new().unwrap();
    let id = add_file(&env, "ns.txt", b"consensus body", &["type=consensus", "flavor=ns"]);
    assert_eq!(id, "0");

    let listing = stdout(&shelf(&env, &["ls"]));
    assert_eq!(listing, "0\t14\ttype=consensus flavor=ns\n");

    let body = shelf(&env, &["cat", "--key", "flavor", "--value", "ns"]);
    assert!(body.status.success());
    assert_eq!(body.stdout, b"consensus body");
}

#[test]
fn test_add_from_stdin() {
    let env = TestEnvironment::new().unwrap();
    let out = shelf_with_stdin(&env, &["add", "-l", "src=stdin", "-"], Some(b"piped"));
    assert_eq!(stdout(&out).trim(), "0");

    let body = shelf(&env, &["cat", "--key", "src", "--value", "stdin"]);
    assert_eq!(body.stdout, b"piped");
}

#[test]
fn test_ls_json_and_filter() {
    let env = TestEnvironment::new().unwrap();
    add_file(&env, "a", b"a", &["flavor=ns"]);
    add_file(&env, "b", b"bb", &["flavor=md"]);

    let text = stdout(&shelf(
        &env,
        &["ls", "--key", "flavor", "--value", "md", "--json"],
    ));
    let rows: serde_json::Value = serde_json::from_str(&text).unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["object"], "1");
    assert_eq!(rows[0]["size"], 2);
}

#[test]
fn test_rm_removes_from_disk() {
    let env = TestEnvironment::new().unwrap();
    add_file(&env, "a", b"a", &["flavor=ns"]);
    add_file(&env, "b", b"b", &["flavor=md"]);

    let report = stdout(&shelf(&env, &["rm", "--key", "flavor", "--value", "ns"]));
    assert!(report.contains("Deleted 1 of 1"));
    assert!(!env.cache_root.join("0").exists());

    let listing = stdout(&shelf(&env, &["ls"]));
    assert_eq!(listing, "1\t1\tflavor=md\n");
}

#[test]
fn test_cat_missing_fails() {
    let env = TestEnvironment::new().unwrap();
    let out = shelf(&env, &["cat", "--key", "flavor", "--value", "none"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("No entry labeled flavor=none"));
}

#[test]
fn test_bad_label_rejected() {
    let env = TestEnvironment::new().unwrap();
    let path = env.create_file("x", b"x").unwrap();
    let out = shelf(&env, &["add", "--label", "novalue", path.to_str().unwrap()]);
    assert!(!out.status.success());
    assert!(!env.cache_root.join("0").exists());
}

#[test]
fn test_usage() {
    let env = TestEnvironment::new().unwrap();
    add_file(&env, "a", b"12345", &["k=v"]);

    let report = stdout(&shelf(&env, &["usage"]));
    assert!(report.contains("Objects:   1 / 8192"));
    assert!(report.contains("Bytes:     10"));
}

#[test]
fn test_config_prints_valid_toml() {
    let env = TestEnvironment::new().unwrap();
    let text = stdout(&shelf(&env, &["config"]));
    let parsed: shelf_config::Config = toml::from_str(&text).unwrap();
    assert_eq!(parsed.cache.max_entries, 8192);
}

#[test]
fn test_config_effective_reads_project_file() {
    let env = TestEnvironment::new().unwrap();
    env.write_project_config("[cache]\nmax_entries = 3\n").unwrap();

    let text = stdout(&shelf(&env, &["config", "--effective"]));
    let parsed: shelf_config::Config = toml::from_str(&text).unwrap();
    assert_eq!(parsed.cache.max_entries, 3);
}
