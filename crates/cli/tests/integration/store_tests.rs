use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn add_prints_location_in_store() {
  let env = TestEnv::new();
  let file = env.write_file("hello.txt", "hello");

  let output = env.kiln_cmd().arg("add").arg(&file).output().unwrap();
  assert!(output.status.success());

  let location = String::from_utf8(output.stdout).unwrap();
  let location = std::path::Path::new(location.trim());
  assert!(location.starts_with(dunce::canonicalize(env.store_path()).unwrap()));
  assert!(location.to_string_lossy().ends_with("-hello.txt"));
  assert_eq!(std::fs::read_to_string(location).unwrap(), "hello");
}

#[test]
fn add_is_idempotent() {
  let env = TestEnv::new();
  let file = env.write_file("data", "same content");

  let first = env.json(&["add", file.to_str().unwrap()]);
  let second = env.json(&["add", file.to_str().unwrap()]);

  assert_eq!(first["path"], second["path"]);
}

#[test]
fn info_and_verify_added_directory() {
  let env = TestEnv::new();
  env.write_file("pkg/bin/tool", "#!/bin/sh\n");
  env.write_file("pkg/README", "readme");

  let added = env.json(&["add", env.temp.path().join("pkg").to_str().unwrap(), "--name", "pkg"]);
  let path = added["path"].as_str().unwrap().to_string();

  env
    .kiln_cmd()
    .args(["info", &path])
    .assert()
    .success()
    .stdout(predicate::str::contains("Kind").and(predicate::str::contains("tree")));

  let info = env.json(&["info", &path]);
  assert_eq!(info["kind"], "tree");
  assert_eq!(info["path"], path.as_str());

  env.kiln_cmd().args(["verify", &path]).assert().success();
}

#[test]
fn add_with_root_survives_gc() {
  let env = TestEnv::new();
  let kept = env.write_file("kept", "kept");
  let dropped = env.write_file("dropped", "dropped");

  let kept = env.json(&["add", kept.to_str().unwrap(), "--root", "keep"]);
  let dropped = env.json(&["add", dropped.to_str().unwrap()]);

  let roots = env.json(&["roots", "list"]);
  assert_eq!(roots[0]["name"], "keep");
  assert_eq!(roots[0]["path"], kept["path"]);

  let gc = env.json(&["gc"]);
  assert_eq!(gc["deleted"], serde_json::json!([dropped["path"]]));

  env.kiln_cmd().args(["info", kept["path"].as_str().unwrap()]).assert().success();
  env
    .kiln_cmd()
    .args(["info", dropped["path"].as_str().unwrap()])
    .assert()
    .failure();
}

#[test]
fn roots_add_and_remove() {
  let env = TestEnv::new();
  let file = env.write_file("f", "content");
  let added = env.json(&["add", file.to_str().unwrap()]);
  let path = added["path"].as_str().unwrap();

  env
    .kiln_cmd()
    .args(["roots", "add", "mine", path])
    .assert()
    .success()
    .stdout(predicate::str::contains("mine"));

  env
    .kiln_cmd()
    .args(["roots", "list"])
    .assert()
    .success()
    .stdout(predicate::str::contains(path));

  env.kiln_cmd().args(["roots", "remove", "mine"]).assert().success();

  let gc = env.json(&["gc", "--dry-run"]);
  assert_eq!(gc["dry_run"], true);
  assert_eq!(gc["deleted"], serde_json::json!([path]));
  env.kiln_cmd().args(["info", path]).assert().success();
}

#[test]
fn roots_add_rejects_bad_name() {
  let env = TestEnv::new();
  let file = env.write_file("f", "content");
  let added = env.json(&["add", file.to_str().unwrap()]);

  env
    .kiln_cmd()
    .args(["roots", "add", "../escape", added["path"].as_str().unwrap()])
    .assert()
    .failure();
}
