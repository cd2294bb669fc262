use std::io::Write as _;
use std::path::Path;

use tempfile::NamedTempFile;

use foxtrot::workload::{self, OpKind};
use foxtrot::{BPlusTree, BulkBufferedTree, RingBufferedTree, WorkloadError};

fn write_workload(lines: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("tempfile");
    file.write_all(lines.as_bytes()).expect("write workload");
    file
}

#[test]
fn parses_inserts_and_reads() {
    let file = write_workload("INSERT 5\nINSERT 7\nINSERT 3\nREAD 5\nREAD 3\nREAD 99\n");
    let ops = workload::read_workload(file.path()).expect("parse");

    assert_eq!(ops.len(), 6);
    assert_eq!(ops[0].kind, OpKind::Insert);
    assert_eq!(ops[0].key, 5);
    assert_eq!(ops[3].kind, OpKind::Read);
    assert_eq!(ops[5].key, 99);
}

#[test]
fn blank_lines_are_skipped_and_negative_keys_parse() {
    let file = write_workload("INSERT -42\n\nREAD -42\n");
    let ops = workload::read_workload(file.path()).expect("parse");
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].key, -42);
}

#[test]
fn an_unknown_op_token_is_fatal() {
    let file = write_workload("INSERT 1\nUPSERT 2\n");
    match workload::read_workload(file.path()) {
        Err(WorkloadError::UnknownOp { line, token }) => {
            assert_eq!(line, 2);
            assert_eq!(token, "UPSERT");
        }
        other => panic!("expected an unknown-op error, got {other:?}"),
    }
}

#[test]
fn a_missing_key_is_fatal() {
    let file = write_workload("READ\n");
    match workload::read_workload(file.path()) {
        Err(WorkloadError::BadKey { line }) => assert_eq!(line, 1),
        other => panic!("expected a bad-key error, got {other:?}"),
    }
}

#[test]
fn a_missing_file_reports_io() {
    match workload::read_workload(Path::new("/no/such/workload.txt")) {
        Err(WorkloadError::Io { path, .. }) => assert!(path.contains("workload.txt")),
        other => panic!("expected an io error, got {other:?}"),
    }
}

#[test]
fn the_scenario_runs_on_every_front_end() {
    let file = write_workload("INSERT 5\nINSERT 7\nINSERT 3\nREAD 5\nREAD 3\nREAD 99\n");
    let ops = workload::read_workload(file.path()).expect("parse");

    let tree = BPlusTree::<i64, i64>::new();
    workload::execute(&tree, &ops, 2);
    assert_eq!(tree.lookup(5), Some(5));
    assert_eq!(tree.lookup(3), Some(3));
    assert_eq!(tree.lookup(99), None);

    let bulk = BulkBufferedTree::<i64, i64>::new();
    workload::execute(&bulk, &ops, 2);
    assert_eq!(bulk.lookup(5), Some(5));
    assert_eq!(bulk.lookup(3), Some(3));
    assert_eq!(bulk.lookup(99), None);

    let ring = RingBufferedTree::<i64, i64>::with_workers(2);
    workload::execute(&ring, &ops, 2);
    assert_eq!(ring.lookup(5), Some(5));
    assert_eq!(ring.lookup(3), Some(3));
    assert_eq!(ring.lookup(99), None);
}

#[test]
fn a_mixed_workload_reports_throughput() {
    let mut lines = String::new();
    // warm-up pass over the key universe, then a 50/50 mix
    for key in 0..1_000 {
        lines.push_str(&format!("INSERT {key}\n"));
    }
    for _ in 0..19_000 {
        let key = fastrand::i64(0..1_000);
        if fastrand::bool() {
            lines.push_str(&format!("INSERT {key}\n"));
        } else {
            lines.push_str(&format!("READ {key}\n"));
        }
    }
    let file = write_workload(&lines);
    let ops = workload::read_workload(file.path()).expect("parse");
    assert_eq!(ops.len(), 20_000);

    let tree = BPlusTree::<i64, i64>::new();
    let report = workload::run_algorithm(&tree, &ops, "mixed", 4);
    assert!(report.ops_per_sec > 0.0);
    assert_eq!(report.num_threads, 4);

    let line = serde_json::to_string(&report).expect("serialise report");
    assert!(line.contains("\"algor\":\"olc_btree\""));
    assert!(line.contains("\"workload\":\"mixed\""));
    assert!(line.contains("\"ops_per_sec\""));

    // warmed-up keys are all visible after the run
    for key in 0..1_000i64 {
        assert_eq!(tree.lookup(key), Some(key), "missing key {key}");
    }
}
