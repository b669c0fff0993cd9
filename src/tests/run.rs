use std::fs;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::{
    Cmd, Error, Mode, Redirectable, lines, open, read_bytes, read_string, run_stdio, with_process,
};

#[test]
fn read_printf() {
    assert_eq!(
        read_string(Cmd::new("printf").arg("%s").arg("abc")).unwrap(),
        "abc"
    );
    assert_eq!(
        read_bytes(Cmd::new("printf").arg("%s").arg("abc")).unwrap(),
        b"abc"
    );
}

#[test]
fn read_checks_status() {
    let err = read_string(Cmd::new("sh").arg("-c").arg("echo partial; exit 3")).unwrap_err();
    assert!(matches!(err, Error::Failed(..)));
}

#[test]
fn run_stdio_captures_to_stream() {
    let sink = super::common::SharedBuf::new();
    run_stdio(
        Cmd::new("printf").arg("captured"),
        vec![
            Redirectable::Null,
            Redirectable::WriteStream(Box::new(sink.clone())),
        ],
    )
    .unwrap();
    assert_eq!(sink.contents(), b"captured");
}

#[test]
fn lines_strips_terminators() {
    let collected: Vec<String> = lines(Cmd::new("printf").arg("a\\nb\\n"), false)
        .unwrap()
        .map(|l| l.unwrap())
        .collect();
    assert_eq!(collected, vec!["a", "b"]);
}

#[test]
fn lines_keeps_terminators() {
    let collected: Vec<String> = lines(Cmd::new("printf").arg("a\\nb\\n"), true)
        .unwrap()
        .map(|l| l.unwrap())
        .collect();
    assert_eq!(collected, vec!["a\n", "b\n"]);
}

#[test]
fn lines_reports_failure_at_end() {
    let mut it = lines(Cmd::new("sh").arg("-c").arg("echo x; exit 3"), false).unwrap();
    assert_eq!(it.next().unwrap().unwrap(), "x");
    assert!(matches!(it.next(), Some(Err(Error::Failed(..)))));
    assert!(it.next().is_none());
}

#[test]
fn open_write_mode() {
    let tmpdir = TempDir::new().unwrap();
    let tmpname = tmpdir.path().join("sink");
    let mut chain = open(
        Cmd::new("sh")
            .arg("-c")
            .arg(format!("cat > {}", tmpname.display())),
        Mode::Write,
        Redirectable::Null,
    )
    .unwrap();
    chain
        .stdin
        .take()
        .unwrap()
        .write_all(b"written through the pipe")
        .unwrap();
    chain.wait().unwrap();
    chain.check_success().unwrap();
    assert_eq!(
        fs::read_to_string(&tmpname).unwrap(),
        "written through the pipe"
    );
}

#[test]
fn open_rw_rejects_extra_stdio() {
    let err = open(Cmd::new("cat"), Mode::ReadWrite, Redirectable::Fd(0)).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(..)));
}

#[test]
fn with_process_reads_to_eof() {
    let value = with_process(Cmd::new("printf").arg("scoped"), Mode::Read, |chain| {
        let mut out = String::new();
        chain
            .stdout
            .as_mut()
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        Ok(out)
    })
    .unwrap();
    assert_eq!(value, "scoped");
}

#[test]
fn with_process_rejects_leftover_output() {
    let err = with_process(Cmd::new("printf").arg("leftover"), Mode::Read, |_| Ok(())).unwrap_err();
    assert!(matches!(err, Error::Pipe));
}

#[test]
fn with_process_terminates_on_error() {
    let before = Instant::now();
    let err = with_process(Cmd::new("sleep").arg("30"), Mode::Read, |_| {
        Err::<(), Error>(Error::InvalidArgument("gave up".into()))
    })
    .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(..)));
    let elapsed = before.elapsed();
    // a 2-second grace period, then SIGTERM
    assert!(elapsed >= Duration::from_secs(2), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(10), "{:?}", elapsed);
}

#[test]
fn with_process_propagates_failed_status() {
    let err = with_process(Cmd::new("false"), Mode::Read, |chain| {
        let mut out = Vec::new();
        chain.stdout.as_mut().unwrap().read_to_end(&mut out).unwrap();
        Ok(())
    })
    .unwrap_err();
    assert!(matches!(err, Error::Failed(..)));
}

#[test]
fn cwd_applies() {
    let tmpdir = TempDir::new().unwrap();
    let expect = tmpdir.path().canonicalize().unwrap();
    let out = read_string(Cmd::new("pwd").cwd(tmpdir.path())).unwrap();
    assert_eq!(out.trim_end(), expect.to_str().unwrap());
}

#[test]
fn env_applies() {
    let out = read_string(
        Cmd::new("sh")
            .arg("-c")
            .arg("echo $PROCPIPE_RUN_TEST")
            .env("PROCPIPE_RUN_TEST", "marker"),
    )
    .unwrap();
    assert_eq!(out, "marker\n");
}

#[test]
fn env_clear_drops_inherited() {
    let out = read_string(
        Cmd::new("sh")
            .arg("-c")
            .arg("echo ${PROCPIPE_CLEARED:-unset}")
            .env("PROCPIPE_CLEARED", "still here")
            .env_clear(),
    )
    .unwrap();
    assert_eq!(out, "unset\n");
}
