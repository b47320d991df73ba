//! History store round-trips and calibration feedback.

mod support;

use quarry::{
    record_execution, DataType, FileHistory, History, HistoryEntry, LogicalExpr, NodeStats,
    Optimization, OptimizerOptions, PlanBuilder,
};

use support::*;

#[test]
fn save_and_update_round_trip() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("history.jsonl").display().to_string();

    let history = FileHistory::new();
    history.record(HistoryEntry {
        fingerprint: "scan:nation:aaaa".into(),
        cardinality: 25.0,
        bytes: 1000.0,
        timestamp: 7,
    });
    history.record(HistoryEntry {
        fingerprint: "join:bbbb".into(),
        cardinality: 125.0,
        bytes: 9000.0,
        timestamp: 9,
    });
    history.save_to_file(&path).expect("save");

    let restored = FileHistory::new();
    restored.update_from_file(&path).expect("update");
    assert_eq!(restored.len(), 2);
    assert_eq!(
        restored.lookup("scan:nation:aaaa"),
        history.lookup("scan:nation:aaaa")
    );
    assert_eq!(restored.lookup("join:bbbb"), history.lookup("join:bbbb"));

    // Idempotent: applying the same file again changes nothing.
    restored.update_from_file(&path).expect("update again");
    assert_eq!(restored.len(), 2);
}

#[test]
fn file_is_newline_delimited_json() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("history.jsonl").display().to_string();

    let history = FileHistory::new();
    history.record_now("a", 1.0, 2.0);
    history.record_now("b", 3.0, 4.0);
    history.save_to_file(&path).expect("save");

    let content = std::fs::read_to_string(&path).expect("read");
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    for line in lines {
        let entry: HistoryEntry = serde_json::from_str(line).expect("each line parses");
        assert!(!entry.fingerprint.is_empty());
    }
}

#[test]
fn recorded_execution_recalibrates_the_next_plan() {
    let catalog = tpch_catalog();
    let history = FileHistory::new();

    let mut b = PlanBuilder::new();
    let scan = b.scan("nation", nation_schema());
    let filtered = b.filter(
        scan,
        LogicalExpr::call(
            "like",
            DataType::Boolean,
            vec![
                col("n_name", DataType::Utf8),
                LogicalExpr::constant(quarry::Literal::String("A%".into())),
            ],
        ),
    );
    let root = b.project(
        filtered,
        vec!["n_name".into()],
        vec![col("n_name", DataType::Utf8)],
    );

    let plan_once = |history: &FileHistory| {
        let mut optimization =
            Optimization::new(&root, &catalog, history, OptimizerOptions::default()).unwrap();
        let best = optimization.best_plan().unwrap();
        let executable = optimization.to_executable_plan(&best).unwrap();
        let scan_id = executable.plan.fragments[0].scans[0].clone();
        let prediction = executable.predictions[&scan_id];
        (executable, scan_id, prediction)
    };

    let (executable, scan_id, before) = plan_once(&history);

    // The runtime reports that only 2 of 25 rows actually survived.
    record_execution(
        &history,
        &executable,
        &[NodeStats {
            node_id: scan_id,
            cardinality: 2.0,
            bytes: 64.0,
        }],
    );

    let (_, _, after) = plan_once(&history);
    assert!(
        after.fanout < before.fanout,
        "history lowers the scan estimate: {} -> {}",
        before.fanout,
        after.fanout
    );
    assert!((after.fanout - 2.0).abs() < 1e-6);
}

#[test]
fn sample_cache_is_shared_per_fingerprint() {
    let history = FileHistory::new();
    assert!(history.cached_sample("scan:nation:x").is_none());
    history.cache_sample("scan:nation:x", 0.125);
    assert_eq!(history.cached_sample("scan:nation:x"), Some(0.125));
}
