// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end runs against real shell children.

use camino::Utf8PathBuf;
use camino_tempfile::Utf8TempDir;
use pretty_assertions::assert_eq;
use shtest_runner::{
    config::{InterpreterSpec, RunnerOptions},
    journal::{Journal, TestStatus},
    list::TestList,
    runner::{RunSummary, TestRunnerBuilder},
    signal::SignalHandlerKind,
    test_filter::TestFilter,
};

struct Suite {
    _dirs: (Utf8TempDir, Utf8TempDir),
    testdir: Utf8PathBuf,
    outdir: Utf8PathBuf,
}

impl Suite {
    fn new() -> Self {
        let testdir = Utf8TempDir::new().unwrap();
        let outdir = Utf8TempDir::new().unwrap();
        Self {
            testdir: testdir.path().to_owned(),
            outdir: outdir.path().to_owned(),
            _dirs: (testdir, outdir),
        }
    }

    fn script(&self, name: &str, body: &str) {
        let path = self.testdir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, format!("#!/bin/bash\n{body}\n")).unwrap();
    }

    fn options(&self) -> RunnerOptions {
        let mut options = RunnerOptions::new(self.testdir.clone());
        options.outdir = self.outdir.clone();
        options.batch = true;
        options
    }

    fn run(&self, options: RunnerOptions) -> RunSummary {
        let filter = TestFilter::from_options(&options).unwrap();
        let test_list = TestList::discover(&options, &filter).unwrap();
        let mut builder = TestRunnerBuilder::new(options);
        builder.set_signal_handler_kind(SignalHandlerKind::Noop);
        builder.build().unwrap().execute(&test_list).unwrap()
    }

    fn journal(&self) -> indexmap::IndexMap<String, TestStatus> {
        Journal::read_path(&self.outdir.join("journal")).unwrap()
    }

    fn log(&self, name: &str) -> String {
        std::fs::read_to_string(self.outdir.join(name)).unwrap()
    }
}

#[test]
fn happy_path() {
    let suite = Suite::new();
    suite.script("a.sh", "exit 0");
    suite.script("b.sh", "exit 1");
    suite.script("c.sh", "exit 200");
    suite.script("d.sh", "echo hi; sleep 0.1; exit 0");

    let summary = suite.run(suite.options());
    assert_eq!(summary.total, 4);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.exit_code(), 1);

    let journal = suite.journal();
    assert_eq!(journal["vanilla:a.sh"], TestStatus::Passed);
    assert_eq!(journal["vanilla:b.sh"], TestStatus::Failed);
    assert_eq!(journal["vanilla:c.sh"], TestStatus::Skipped);
    assert_eq!(journal["vanilla:d.sh"], TestStatus::Passed);

    assert_eq!(suite.log("vanilla:d.sh.txt"), "[ 0:00] hi\n");
}

#[test]
fn inactivity_timeout_kills_silent_test() {
    let suite = Suite::new();
    suite.script("hang.sh", "sleep 3600");

    let mut options = suite.options();
    options.timeout = 1;

    let started = std::time::Instant::now();
    let summary = suite.run(options);
    assert!(started.elapsed() < std::time::Duration::from_secs(10));

    assert_eq!(summary.exit_code(), 1);
    assert_eq!(suite.journal()["vanilla:hang.sh"], TestStatus::Timeout);
}

#[test]
fn output_resets_the_inactivity_clock() {
    let suite = Suite::new();
    // Four seconds of wall clock against a two-second timeout, but never
    // more than a second of silence.
    suite.script(
        "chatty.sh",
        "for i in 1 2 3 4; do echo tick$i; sleep 0.9; done",
    );

    let mut options = suite.options();
    options.timeout = 2;
    suite.run(options);

    assert_eq!(suite.journal()["vanilla:chatty.sh"], TestStatus::Passed);
}

#[test]
fn resume_skips_done_tests() {
    let suite = Suite::new();
    // t1 would fail if it ever ran again.
    suite.script("t1.sh", "exit 1");
    suite.script("t2.sh", "exit 0");
    std::fs::write(
        suite.outdir.join("journal"),
        "vanilla:t1.sh passed\nvanilla:t2.sh started\n",
    )
    .unwrap();

    let mut options = suite.options();
    options.resume = true;
    let summary = suite.run(options);

    // Only the interrupted test re-ran.
    assert_eq!(summary.total, 1);
    assert_eq!(summary.exit_code(), 0);
    let journal = suite.journal();
    assert_eq!(journal["vanilla:t1.sh"], TestStatus::Passed);
    assert_eq!(journal["vanilla:t2.sh"], TestStatus::Passed);
}

#[test]
fn resume_after_everything_done_is_a_noop() {
    let suite = Suite::new();
    suite.script("a.sh", "exit 0");

    let summary = suite.run(suite.options());
    assert_eq!(summary.total, 1);

    let mut options = suite.options();
    options.resume = true;
    let summary = suite.run(options);
    assert_eq!(summary.total, 0);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(suite.journal()["vanilla:a.sh"], TestStatus::Passed);
}

#[test]
fn parallel_runs_keep_logs_whole() {
    let suite = Suite::new();
    let body = "for i in $(seq 0 99); do echo i=$i; sleep 0.01; done";
    suite.script("one.sh", body);
    suite.script("two.sh", body);

    let mut options = suite.options();
    options.jobs = 2;
    let summary = suite.run(options);
    assert_eq!(summary.exit_code(), 0);

    for name in ["vanilla:one.sh.txt", "vanilla:two.sh.txt"] {
        let log = suite.log(name);
        let bodies: Vec<String> = log
            .lines()
            .map(|line| {
                let (stamp, body) = line.split_at(8);
                assert!(stamp.starts_with('[') && stamp.ends_with("] "));
                body.to_owned()
            })
            .collect();
        let expected: Vec<String> = (0..100).map(|i| format!("i={i}")).collect();
        assert_eq!(bodies, expected);
    }
}

#[test]
fn sentinel_lines_drive_substitution() {
    let suite = Suite::new();
    suite.script("subst.sh", "echo @TESTDIR=/tmp/x\necho hello @TESTDIR@");

    suite.run(suite.options());

    let log = suite.log("vanilla:subst.sh.txt");
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with("@TESTDIR=/tmp/x"));
    assert!(lines[1].ends_with("hello /tmp/x"));
}

#[test]
fn slot_and_flavour_reach_the_child() {
    let suite = Suite::new();
    suite.script("env.sh", "echo slot=$TEST_SLOT flavour=$TEST_FLAVOUR");

    suite.run(suite.options());

    let log = suite.log("vanilla:env.sh.txt");
    assert!(log.ends_with("slot=0 flavour=vanilla\n"));
}

#[test]
fn flavours_multiply_runs_and_logs() {
    let suite = Suite::new();
    suite.script("f.sh", "echo running $TEST_FLAVOUR");

    let mut options = suite.options();
    options.flavours = vec!["vanilla".to_owned(), "debug".to_owned()];
    let summary = suite.run(options);
    assert_eq!(summary.total, 2);

    assert!(suite.log("vanilla:f.sh.txt").contains("running vanilla"));
    assert!(suite.log("debug:f.sh.txt").contains("running debug"));
}

#[test]
fn spawn_failure_is_a_test_failure() {
    let suite = Suite::new();
    suite.script("broken.py", "whatever");

    let mut options = suite.options();
    options.interpreters = vec![InterpreterSpec {
        ext: "py".to_owned(),
        script: "no-such-interpreter".into(),
    }];
    let summary = suite.run(options);

    assert_eq!(summary.exit_code(), 1);
    assert_eq!(suite.journal()["vanilla:broken.py"], TestStatus::Failed);
}

#[test]
fn watched_files_feed_the_log() {
    let suite = Suite::new();
    let side = suite.outdir.join("side.log");
    std::fs::write(&side, "").unwrap();
    suite.script(
        "aux.sh",
        &format!("sleep 0.5\necho from-side >> {side}\nsleep 0.5"),
    );

    let mut options = suite.options();
    options.watch = vec![side];
    suite.run(options);

    assert!(suite.log("vanilla:aux.sh.txt").contains("from-side"));
}

#[test]
fn nested_tests_flatten_into_log_names() {
    let suite = Suite::new();
    suite.script("group/inner.sh", "echo nested");

    suite.run(suite.options());

    assert_eq!(suite.journal()["vanilla:group/inner.sh"], TestStatus::Passed);
    assert!(suite.log("vanilla:group_inner.sh.txt").contains("nested"));
}

#[test]
fn heartbeat_file_stays_quiet_for_fast_tests() {
    let suite = Suite::new();
    suite.script("quick.sh", "exit 0");

    let heartbeat = suite.outdir.join("heartbeat");
    let mut options = suite.options();
    options.heartbeat = Some(heartbeat.clone());
    suite.run(options);

    // The first beat only lands after 20 seconds of runtime.
    assert!(!heartbeat.exists());
}
