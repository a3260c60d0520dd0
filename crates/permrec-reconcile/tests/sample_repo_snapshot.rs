use std::path::{Path, PathBuf};

use permrec_reconcile::{
    CheckOutcome, ReconcileConfig, ReconcilePipeline, BUILTIN_MANUAL_LABEL,
    BUILTIN_MANUAL_PERMISSIONS, DEFAULT_OUTPUT,
};
use tempfile::tempdir;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn sample_repo() -> PathBuf {
    workspace_root().join("fixtures/sample-repo")
}

fn expected_script() -> String {
    std::fs::read_to_string(workspace_root().join("fixtures/sample-repo.expected.sql"))
        .expect("read expected script")
}

fn config_into(output_dir: &Path) -> ReconcileConfig {
    ReconcileConfig {
        workspace_root: sample_repo(),
        output_path: output_dir.join(DEFAULT_OUTPUT),
        ..Default::default()
    }
}

#[test]
fn golden_script_for_sample_repo() {
    let out = tempdir().expect("tempdir");
    let summary = ReconcilePipeline::new(config_into(out.path()))
        .expect("pipeline")
        .run()
        .expect("run");

    let written = std::fs::read_to_string(out.path().join(DEFAULT_OUTPUT)).expect("read output");
    assert_eq!(written, expected_script());
    assert_eq!(summary.total_permissions, 24);
    assert_eq!(summary.emitted_rows, 24);
    assert!(summary.output_changed);
}

#[test]
fn per_source_counts_for_sample_repo() {
    let out = tempdir().expect("tempdir");
    let plan = ReconcilePipeline::new(config_into(out.path()))
        .expect("pipeline")
        .plan()
        .expect("plan");

    let labels: Vec<_> = plan.sources.iter().map(|s| s.label.as_str()).collect();
    assert_eq!(
        labels,
        vec![
            "services/api/internal/db/schema.sql",
            "infra/seed/seed_data.sql",
            "infra/migrations/000040_platform_rbac_templates.up.sql",
            "infra/migrations/000047_tenant_default_roles_and_permissions.up.sql",
            "infra/migrations/000048_platform_extras.up.sql",
            BUILTIN_MANUAL_LABEL,
        ]
    );

    let schema = &plan.sources[0];
    assert_eq!((schema.statements, schema.rows_accepted), (1, 3));

    let seed = &plan.sources[1];
    assert_eq!(seed.statements, 2);
    assert_eq!(seed.tuples_seen, 4);
    assert_eq!(seed.rows_rejected, 1);
    assert_eq!(seed.duplicates_skipped, 1);

    let missing = &plan.sources[3];
    assert!(!missing.found);
    assert_eq!(missing.rows_accepted, 0);

    let extras = &plan.sources[4];
    assert_eq!(extras.statements, 2);
    assert_eq!(extras.duplicates_skipped, 1);

    let manual = &plan.sources[5];
    assert_eq!(manual.rows_accepted, BUILTIN_MANUAL_PERMISSIONS.len());
    assert_eq!(manual.duplicates_skipped, 1);

    assert!(plan.set.get("never:seen").is_none());
    assert_eq!(plan.set.get("kb:view").unwrap().description, "Browse the knowledge base");
    assert_eq!(plan.set.get("roles:view").unwrap().module, "roles");
}

#[test]
fn repeated_runs_are_byte_identical() {
    let out = tempdir().expect("tempdir");
    let pipeline = ReconcilePipeline::new(config_into(out.path())).expect("pipeline");

    let first = pipeline.run().expect("first run");
    let first_bytes = std::fs::read(&first.output_path).expect("read first");
    let second = pipeline.run().expect("second run");
    let second_bytes = std::fs::read(&second.output_path).expect("read second");

    assert_eq!(first_bytes, second_bytes);
    assert_eq!(first.output_sha256, second.output_sha256);
    assert!(!second.output_changed);
}

#[test]
fn check_detects_stale_output() {
    let out = tempdir().expect("tempdir");
    let pipeline = ReconcilePipeline::new(config_into(out.path())).expect("pipeline");
    let output = out.path().join(DEFAULT_OUTPUT);

    assert_eq!(
        pipeline.check().expect("check"),
        CheckOutcome::Stale { path: output.clone() }
    );

    pipeline.run().expect("run");
    assert_eq!(pipeline.check().expect("check"), CheckOutcome::UpToDate);

    std::fs::write(&output, "-- edited by hand\n").expect("edit output");
    assert_eq!(
        pipeline.check().expect("check"),
        CheckOutcome::Stale { path: output }
    );
}

#[test]
fn empty_root_yields_builtin_manual_permissions_only() {
    let root = tempdir().expect("tempdir");
    let summary = ReconcilePipeline::new(ReconcileConfig {
        workspace_root: root.path().to_path_buf(),
        ..Default::default()
    })
    .expect("pipeline")
    .run()
    .expect("run");

    assert_eq!(summary.total_permissions, BUILTIN_MANUAL_PERMISSIONS.len());
    let script = std::fs::read_to_string(root.path().join(DEFAULT_OUTPUT)).expect("read output");
    assert!(script.contains("(uuid_generate_v7(), 'portal:teacher', 'core', 'Access teacher portal')"));
    assert!(!script.contains("'users:view'"));
}

#[test]
fn manual_file_fills_gaps_after_builtin_table() {
    let out = tempdir().expect("tempdir");
    let manual = out.path().join("extra.yaml");
    std::fs::write(
        &manual,
        "version: 1\npermissions:\n  - code: reports:export\n    module: reports\n    description: Export reports\n  - code: users:view\n    module: ignored\n    description: Never wins\n",
    )
    .expect("write manual file");

    let plan = ReconcilePipeline::new(ReconcileConfig {
        manual_file: Some(manual),
        ..config_into(out.path())
    })
    .expect("pipeline")
    .plan()
    .expect("plan");

    assert_eq!(plan.set.len(), 25);
    assert_eq!(plan.set.get("reports:export").unwrap().module, "reports");
    assert_eq!(plan.set.get("users:view").unwrap().module, "users");
    assert_eq!(plan.sources.last().unwrap().duplicates_skipped, 1);
}

#[test]
fn missing_manual_file_is_fatal() {
    let out = tempdir().expect("tempdir");
    let err = ReconcilePipeline::new(ReconcileConfig {
        manual_file: Some(out.path().join("nope.yaml")),
        ..config_into(out.path())
    })
    .err()
    .expect("missing manual file should fail");
    assert!(format!("{err:#}").contains("nope.yaml"));
}

#[test]
fn report_is_written_as_json() {
    let out = tempdir().expect("tempdir");
    let report_path = out.path().join("reports/run.json");
    let summary = ReconcilePipeline::new(ReconcileConfig {
        report_path: Some(report_path.clone()),
        ..config_into(out.path())
    })
    .expect("pipeline")
    .run()
    .expect("run");

    assert_eq!(summary.report_path.as_deref(), Some(report_path.as_path()));
    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report_path).expect("read report"))
            .expect("parse report");
    assert_eq!(report["total_permissions"], 24);
    assert_eq!(report["output_sha256"], summary.output_sha256.as_str());
    assert_eq!(report["sources"].as_array().map(Vec::len), Some(6));
    assert_eq!(report["sources"][3]["found"], false);
}

#[test]
fn relative_report_path_lands_under_root() {
    let root = tempdir().expect("tempdir");
    let summary = ReconcilePipeline::new(ReconcileConfig {
        workspace_root: root.path().to_path_buf(),
        report_path: Some(PathBuf::from("reports/run.json")),
        ..Default::default()
    })
    .expect("pipeline")
    .run()
    .expect("run");

    let expected = root.path().join("reports/run.json");
    assert!(expected.is_file());
    assert_eq!(summary.report_path.as_deref(), Some(expected.as_path()));
    assert_eq!(summary.output_path, root.path().join(DEFAULT_OUTPUT));
}
