//! Settings-file discovery against a real directory tree.

use std::fs;

use squint::settings::load_snapshot;

#[test]
fn project_config_is_found_by_walking_up() {
    let root = tempfile::tempdir().unwrap();
    let nested = root.path().join("src").join("deep");
    fs::create_dir_all(&nested).unwrap();

    fs::write(
        root.path().join(".squint.toml"),
        r#"
"@disable" = false

[linters.flake8]
args = "--max-complexity 10"
"#,
    )
    .unwrap();

    let snapshot = load_snapshot(1, Some(&nested));
    assert_eq!(snapshot.version, 1);
    let flake8 = snapshot.project.linters.get("flake8").expect("project linter settings");
    assert_eq!(
        flake8.get("args").and_then(|v| v.as_str()),
        Some("--max-complexity 10")
    );
    assert_eq!(
        snapshot.project.meta.get("@disable").and_then(|v| v.as_bool()),
        Some(false)
    );
}

#[test]
fn missing_project_config_degrades_to_empty_layer() {
    let root = tempfile::tempdir().unwrap();
    let snapshot = load_snapshot(3, Some(root.path()));
    assert!(snapshot.project.linters.is_empty());
    assert!(snapshot.project.meta.is_empty());
}
