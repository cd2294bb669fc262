use std::env;
use std::path::Path;
use std::process;

use tracing::{error, info, Level};

use foxtrot::bulk::BulkBufferedTree;
use foxtrot::ring::RingBufferedTree;
use foxtrot::tree::BPlusTree;
use foxtrot::workload::{self, RunReport};

fn main() {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("no subscriber is installed before this one");

    let Some(path) = env::args().nth(1) else {
        eprintln!("usage: foxtrot <workload-file>");
        process::exit(1);
    };

    let ops = match workload::read_workload(Path::new(&path)) {
        Ok(ops) => ops,
        Err(err) => {
            error!(%err, "could not load workload");
            process::exit(2);
        }
    };
    info!(ops = ops.len(), workload = %path, "workload loaded");

    let num_threads = num_cpus::get();

    let tree = BPlusTree::<i64, i64>::new();
    print_report(workload::run_algorithm(&tree, &ops, &path, num_threads));

    let bulk = BulkBufferedTree::<i64, i64>::new();
    print_report(workload::run_algorithm(&bulk, &ops, &path, num_threads));

    let ring = RingBufferedTree::<i64, i64>::with_workers(num_threads);
    print_report(workload::run_algorithm(&ring, &ops, &path, num_threads));
}

fn print_report(report: RunReport) {
    match serde_json::to_string(&report) {
        Ok(line) => println!("{line}"),
        Err(err) => {
            error!(%err, "could not serialise report");
            process::exit(2);
        }
    }
}
