use std::io::Write;

use corral_core::{domains, Config, ConfigError, Engine};
use tempfile::TempDir;

fn engine() -> Engine {
    Engine::new(domains::all()).unwrap()
}

fn write_file(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

const VALID: &str = r#"
stores:
  - domain: mock
rules:
  - name: PodToLogs
    start: {domain: k8s, classes: [Pod]}
    goal: {domain: log, classes: [application]}
    result: {query: '{namespace="{{ metadata.namespace }}",pod="{{ metadata.name }}"}'}
"#;

#[test]
fn test_valid_config_applies() {
    let mut engine = engine();
    let config = Config::from_str(VALID).unwrap();
    config.apply(&mut engine).unwrap();

    assert_eq!(engine.rules().len(), 1);
    assert_eq!(engine.rules()[0].name(), "PodToLogs");
    assert!(engine.store("mock").is_some());
}

#[test]
fn test_unknown_top_level_key_fatal() {
    assert!(matches!(
        Config::from_str("bogus: true\n"),
        Err(ConfigError::Parse { .. })
    ));
}

#[test]
fn test_unknown_domain_fatal() {
    let mut engine = engine();
    let config = Config::from_str(
        r#"
rules:
  - name: r1
    start: {domain: nope, classes: [Pod]}
    goal: {domain: log, classes: [application]}
    result: {query: "x"}
"#,
    )
    .unwrap();
    assert!(matches!(
        config.apply(&mut engine),
        Err(ConfigError::UnknownDomain { .. })
    ));
}

#[test]
fn test_unknown_class_fatal() {
    let mut engine = engine();
    let config = Config::from_str(
        r#"
rules:
  - name: r1
    start: {domain: k8s, classes: [Widget]}
    goal: {domain: log, classes: [application]}
    result: {query: "x"}
"#,
    )
    .unwrap();
    assert!(matches!(
        config.apply(&mut engine),
        Err(ConfigError::UnknownClass { .. })
    ));
}

#[test]
fn test_empty_class_list_fatal() {
    let mut engine = engine();
    let config = Config::from_str(
        r#"
rules:
  - name: r1
    start: {domain: k8s, classes: []}
    goal: {domain: log, classes: [application]}
    result: {query: "x"}
"#,
    )
    .unwrap();
    assert!(matches!(
        config.apply(&mut engine),
        Err(ConfigError::EmptyClasses { .. })
    ));
}

#[test]
fn test_duplicate_rule_name_fatal() {
    let mut engine = engine();
    let config = Config::from_str(
        r#"
rules:
  - name: r1
    start: {domain: k8s, classes: [Pod]}
    goal: {domain: log, classes: [application]}
    result: {query: '{pod="x"}'}
  - name: r1
    start: {domain: k8s, classes: [Pod]}
    goal: {domain: log, classes: [audit]}
    result: {query: '{pod="y"}'}
"#,
    )
    .unwrap();
    assert!(matches!(
        config.apply(&mut engine),
        Err(ConfigError::DuplicateRule(_))
    ));
}

#[test]
fn test_template_compile_error_fatal() {
    let mut engine = engine();
    let config = Config::from_str(
        r#"
rules:
  - name: r1
    start: {domain: k8s, classes: [Pod]}
    goal: {domain: log, classes: [application]}
    result: {query: "{% for %}"}
"#,
    )
    .unwrap();
    assert!(matches!(
        config.apply(&mut engine),
        Err(ConfigError::Rule { .. })
    ));
}

#[test]
fn test_alias_expansion() {
    let mut engine = engine();
    let config = Config::from_str(
        r#"
aliases:
  - name: workloads
    domain: k8s
    classes: [Deployment, ReplicaSet, StatefulSet]
rules:
  - name: WorkloadToPods
    start: {domain: k8s, classes: [workloads, DaemonSet]}
    goal: {domain: k8s, classes: [Pod]}
    result: {query: "/api/v1/namespaces/{{ metadata.namespace }}/pods"}
"#,
    )
    .unwrap();
    config.apply(&mut engine).unwrap();

    let names: Vec<&str> = engine.rules()[0]
        .start()
        .iter()
        .map(|c| c.name())
        .collect();
    assert_eq!(
        names,
        vec!["Deployment", "ReplicaSet", "StatefulSet", "DaemonSet"]
    );
}

#[test]
fn test_undefined_alias_fatal() {
    let mut engine = engine();
    let config = Config::from_str(
        r#"
aliases:
  - name: workloads
    domain: log
    classes: [application]
rules:
  - name: r1
    start: {domain: k8s, classes: [workloads]}
    goal: {domain: log, classes: [application]}
    result: {query: "x"}
"#,
    )
    .unwrap();
    // "workloads" is defined for the log domain, not k8s.
    assert!(matches!(
        config.apply(&mut engine),
        Err(ConfigError::UnknownAlias { .. })
    ));
}

#[test]
fn test_include_merges_and_overrides() {
    let dir = TempDir::new().unwrap();
    write_file(
        &dir,
        "base.yaml",
        r#"
rules:
  - name: r1
    start: {domain: k8s, classes: [Pod]}
    goal: {domain: log, classes: [application]}
    result: {query: '{pod="base"}'}
  - name: r2
    start: {domain: k8s, classes: [Pod]}
    goal: {domain: log, classes: [audit]}
    result: {query: '{pod="audit"}'}
"#,
    );
    let top = write_file(
        &dir,
        "top.yaml",
        r#"
include: [base.yaml]
rules:
  - name: r1
    start: {domain: k8s, classes: [Pod]}
    goal: {domain: log, classes: [application]}
    result: {query: '{pod="override"}'}
"#,
    );

    let config = Config::load(&top).unwrap();
    assert_eq!(config.rules.len(), 2);
    // Later entries override earlier ones by rule name, in place.
    assert_eq!(config.rules[0].name, "r1");
    assert!(config.rules[0].result.query.contains("override"));
    assert_eq!(config.rules[1].name, "r2");
}

#[test]
fn test_include_cycle_fatal() {
    let dir = TempDir::new().unwrap();
    write_file(&dir, "a.yaml", "include: [b.yaml]\n");
    let b = write_file(&dir, "b.yaml", "include: [a.yaml]\n");

    assert!(matches!(
        Config::load(&b),
        Err(ConfigError::IncludeCycle(_))
    ));
}

#[test]
fn test_json_document_accepted() {
    let config = Config::from_str(
        r#"{"rules":[{"name":"r1","start":{"domain":"k8s","classes":["Pod"]},"goal":{"domain":"log","classes":["application"]},"result":{"query":"{pod=\"x\"}"}}]}"#,
    )
    .unwrap();
    assert_eq!(config.rules.len(), 1);
}
