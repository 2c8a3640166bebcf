use predicates::prelude::*;

use super::common::TestEnv;

const CHAIN_GRAPH: &str = r#"{
  "recipes": {
    "greet": {
      "command": { "builder": "/bin/sh", "args": ["-c", "echo hello > $out"], "env": { "PATH": "/usr/bin:/bin" } },
      "outputs": ["out"]
    },
    "shout": {
      "inputs": { "greeting": { "recipe": "greet", "output": "out" } },
      "command": { "builder": "/bin/sh", "args": ["-c", "tr a-z A-Z < $input_greeting > $out"], "env": { "PATH": "/usr/bin:/bin" } },
      "outputs": ["out"]
    }
  }
}"#;

const FAILING_GRAPH: &str = r#"{
  "recipes": {
    "bad": {
      "command": { "builder": "/bin/sh", "args": ["-c", "echo broken >&2; exit 3"], "env": { "PATH": "/usr/bin:/bin" } },
      "outputs": ["out"]
    }
  }
}"#;

const CYCLE_GRAPH: &str = r#"{
  "recipes": {
    "a": {
      "inputs": { "b": { "recipe": "b", "output": "out" } },
      "command": { "builder": "/bin/sh", "args": ["-c", "touch $out"], "env": { "PATH": "/usr/bin:/bin" } },
      "outputs": ["out"]
    },
    "b": {
      "inputs": { "a": { "recipe": "a", "output": "out" } },
      "command": { "builder": "/bin/sh", "args": ["-c", "touch $out"], "env": { "PATH": "/usr/bin:/bin" } },
      "outputs": ["out"]
    }
  }
}"#;

#[test]
fn build_realizes_dependencies_then_caches() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", CHAIN_GRAPH);

  env
    .kiln_cmd()
    .arg("build")
    .arg(&graph)
    .arg("shout")
    .assert()
    .success()
    .stdout(predicate::str::contains("greet built").and(predicate::str::contains("shout built")));

  env
    .kiln_cmd()
    .arg("build")
    .arg(&graph)
    .arg("shout")
    .assert()
    .success()
    .stdout(predicate::str::contains("shout cached"));
}

#[test]
fn build_json_reports_outputs() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", CHAIN_GRAPH);

  let report = env.json(&["build", graph.to_str().unwrap()]);
  let results = report["results"].as_array().unwrap();
  assert_eq!(results.len(), 2);
  assert_eq!(results[0]["recipe"], "greet");
  assert_eq!(results[1]["recipe"], "shout");
  assert_eq!(results[1]["status"]["status"], "built");

  let path = results[1]["outputs"]["out"].as_str().unwrap();
  let info = env.json(&["info", path]);
  assert_eq!(info["kind"], "file");
}

#[test]
fn failed_build_exits_nonzero_with_log() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", FAILING_GRAPH);

  env
    .kiln_cmd()
    .arg("build")
    .arg(&graph)
    .assert()
    .failure()
    .stdout(predicate::str::contains("builder exited with code 3"))
    .stderr(predicate::str::contains("broken").and(predicate::str::contains("1 recipe(s) failed")));
}

#[test]
fn cyclic_graph_is_rejected() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", CYCLE_GRAPH);

  env
    .kiln_cmd()
    .arg("build")
    .arg(&graph)
    .assert()
    .failure()
    .stderr(predicate::str::contains("Invalid recipe graph"));
}

#[test]
fn unknown_target_is_rejected() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", CHAIN_GRAPH);

  env
    .kiln_cmd()
    .arg("build")
    .arg(&graph)
    .arg("missing")
    .assert()
    .failure();
}

#[test]
fn rooted_outputs_survive_gc_until_unrooted() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", CHAIN_GRAPH);

  let report = env.json(&["build", graph.to_str().unwrap(), "greet", "--root"]);
  let out = report["results"][0]["outputs"]["out"].clone();

  let roots = env.json(&["roots", "list"]);
  assert_eq!(roots[0]["name"], "greet");
  assert_eq!(roots[0]["path"], out);

  let gc = env.json(&["gc"]);
  assert_eq!(gc["stats"]["deleted"], 0);

  env.kiln_cmd().args(["roots", "remove", "greet"]).assert().success();

  let gc = env.json(&["gc"]);
  assert_eq!(gc["deleted"], serde_json::json!([out]));
}

#[test]
fn push_to_local_substituter_then_substitute_in_fresh_store() {
  let env = TestEnv::new();
  let graph = env.write_file("graph.json", CHAIN_GRAPH);
  let cache = env.temp.path().join("cache");
  let cache_url = format!("file://{}", cache.display());

  env.json(&["build", graph.to_str().unwrap(), "--substituter", &cache_url, "--push"]);

  let fresh = TestEnv::new();
  let report = fresh.json(&["build", graph.to_str().unwrap(), "--substituter", &cache_url]);
  for result in report["results"].as_array().unwrap() {
    assert_eq!(result["status"]["status"], "substituted");
  }
}
