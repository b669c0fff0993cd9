use std::ffi::OsString;

use crate::{Cmd, Error, run, signal, start, success};

#[test]
fn basic_exit() {
    let chain = run(Cmd::new("true")).unwrap();
    let p = &chain.processes[0];
    assert!(p.exited());
    assert_eq!(p.exit_code(), Some(0));
    assert_eq!(p.term_signal(), Some(0));
    assert!(p.success());
    assert!(!p.signaled());
}

#[test]
fn failing_exit() {
    let err = run(Cmd::new("false")).unwrap_err();
    assert!(matches!(err, Error::Failed(..)));
}

#[test]
fn exit_code_reported() {
    let chain = start(Cmd::new("sh").arg("-c").arg("exit 13")).unwrap();
    chain.wait().unwrap();
    assert_eq!(chain.processes[0].exit_code(), Some(13));
    assert!(!chain.success());
}

#[test]
fn terminate_then_wait() {
    let chain = start(Cmd::new("sleep").arg("1000")).unwrap();
    let p = &chain.processes[0];
    assert!(p.running());
    p.terminate().unwrap();
    p.wait().unwrap();
    assert!(p.exited());
    assert!(p.signaled());
    assert_eq!(p.term_signal(), Some(signal::SIGTERM));
}

#[test]
fn kill_after_exit_is_noop() {
    let chain = start(Cmd::new("sleep").arg("1000")).unwrap();
    chain.terminate().unwrap();
    chain.wait().unwrap();
    // the handle is gone; delivery must be accepted and do nothing
    chain.terminate().unwrap();
    chain.kill().unwrap();
}

#[test]
fn pid_while_running() {
    let chain = start(Cmd::new("sleep").arg("1000")).unwrap();
    let pid = chain.pid().unwrap();
    assert!(pid > 0);
    chain.terminate().unwrap();
    chain.wait().unwrap();
    assert!(matches!(chain.pid(), Err(Error::Pid)));
}

#[test]
fn poll_exit_nonblocking() {
    let chain = start(Cmd::new("sleep").arg("1000")).unwrap();
    let p = &chain.processes[0];
    assert_eq!(p.poll_exit(), None);
    p.terminate().unwrap();
    p.wait().unwrap();
    assert_eq!(p.poll_exit(), Some((0, signal::SIGTERM)));
}

#[test]
fn empty_argv_rejected() {
    let err = start(Cmd::from_argv(Vec::<OsString>::new())).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(..)));
}

#[test]
fn spawn_error_carries_command() {
    let err = start(Cmd::new("procpipe-no-such-cmd").arg("x")).unwrap_err();
    match err {
        Error::Spawn { code, cmd } => {
            assert!(code < 0);
            assert_eq!(cmd, "procpipe-no-such-cmd x");
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn success_helper() {
    assert!(success(Cmd::new("true")).unwrap());
    assert!(!success(Cmd::new("false")).unwrap());
}

#[test]
fn signal_numbers() {
    assert_eq!(signal::SIGHUP, 1);
    assert_eq!(signal::SIGINT, 2);
    assert_eq!(signal::SIGQUIT, 3);
    assert_eq!(signal::SIGKILL, 9);
    assert_eq!(signal::SIGPIPE, 13);
    assert_eq!(signal::SIGTERM, 15);
}

#[test]
fn detached_spawn() {
    assert!(success(Cmd::new("true").detached()).unwrap());
}

#[cfg(target_os = "linux")]
#[test]
fn cpu_restriction() {
    assert!(success(Cmd::new("true").cpus([0])).unwrap());
}

#[test]
fn debug_formats() {
    let chain = run(Cmd::new("true")).unwrap();
    let shown = format!("{:?}", chain.processes[0]);
    assert!(shown.contains("true"), "{}", shown);
    assert!(shown.contains("exited 0"), "{}", shown);
}
