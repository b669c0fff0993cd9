use std::time::Instant;

use crate::{Cmd, Error, Redirectable, read_string, run, start_stdio, success};

#[test]
fn simple_pipe() {
    let out = read_string(Cmd::new("printf").arg("hello") | Cmd::new("wc").arg("-c")).unwrap();
    assert_eq!(out.trim(), "5");
}

#[test]
fn three_stage_pipe() {
    let expr = Cmd::new("printf").arg("foo\\nbar\\nfoo\\n")
        | Cmd::new("sort")
        | Cmd::new("uniq")
        | Cmd::new("wc").arg("-l");
    assert_eq!(read_string(expr).unwrap().trim(), "2");
}

#[test]
fn err_pipe_captures_stderr() {
    let expr = Cmd::new("sh")
        .arg("-c")
        .arg("echo err 1>&2")
        .pipe_err(Cmd::new("cat"));
    assert_eq!(read_string(expr).unwrap(), "err\n");
}

#[test]
fn err_pipe_skips_stdout() {
    let left = Cmd::new("sh")
        .arg("-c")
        .arg("echo out; echo err 1>&2")
        .stdout_to(Redirectable::Null);
    let expr = left.pipe_err(Cmd::new("cat"));
    assert_eq!(read_string(expr).unwrap(), "err\n");
}

#[test]
fn seq_shares_stdout() {
    let ep = crate::PipeEndpoint::new();
    let mut chain = start_stdio(
        Cmd::new("printf").arg("a") & Cmd::new("printf").arg("b"),
        vec![Redirectable::Null, Redirectable::Endpoint(ep)],
    )
    .unwrap();
    assert_eq!(chain.processes.len(), 2);
    // interleaving of the shared stdout is undefined; only the merged
    // bytes are
    let merged = super::common::read_whole_file(chain.stdout.take().unwrap());
    chain.wait().unwrap();
    let mut chars: Vec<char> = merged.chars().collect();
    chars.sort_unstable();
    assert_eq!(chars.into_iter().collect::<String>(), "ab");
}

#[test]
fn chain_is_in_spawn_order() {
    let chain = run(Cmd::new("true") | Cmd::new("true").arg("second")).unwrap();
    assert_eq!(chain.processes.len(), 2);
    assert_eq!(chain.processes[0].cmd().to_string(), "true");
    assert_eq!(chain.processes[1].cmd().to_string(), "true second");
}

#[test]
fn pipeline_success() {
    assert!(success(Cmd::new("true") | Cmd::new("true")).unwrap());
    assert!(!success(Cmd::new("false") | Cmd::new("true")).unwrap());
}

#[test]
fn failed_pipeline_reports_left_member() {
    let err = run(Cmd::new("false") | Cmd::new("true")).unwrap_err();
    match err {
        Error::Failed(procs) => {
            assert_eq!(procs.len(), 1);
            assert_eq!(procs[0].cmd, "false");
            assert_eq!(procs[0].exit_code, 1);
            assert_eq!(procs[0].term_signal, 0);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn ignore_status_suppresses_failure() {
    run(Cmd::new("false").ignore_status()).unwrap();
    let chain = run(Cmd::new("false").ignore_status() | Cmd::new("true")).unwrap();
    assert!(!chain.success());
}

#[test]
fn spawn_failure_aborts_composition() {
    let before = Instant::now();
    let err = run(Cmd::new("sleep").arg("30") | Cmd::new("procpipe-no-such-cmd")).unwrap_err();
    match err {
        Error::Spawn { code, cmd } => {
            assert!(code < 0);
            assert_eq!(cmd, "procpipe-no-such-cmd");
        }
        other => panic!("unexpected error: {}", other),
    }
    // the already-spawned sleep must have been terminated and reaped
    assert!(before.elapsed().as_secs() < 5);
}
