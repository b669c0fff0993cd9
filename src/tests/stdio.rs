use std::fs::{self, File};
use std::io::{Cursor, Read, Write};

use tempfile::TempDir;

use super::common::{SharedBuf, read_whole_file};
use crate::{Cmd, Error, Mode, Redirectable, open, read_string, run, start_stdio};

#[test]
fn stderr_to_file() {
    let tmpdir = TempDir::new().unwrap();
    let tmpname = tmpdir.path().join("out");
    run(Cmd::new("sh")
        .arg("-c")
        .arg("echo x 1>&2")
        .stderr_to(Redirectable::path(&tmpname)))
    .unwrap();
    assert_eq!(fs::read_to_string(&tmpname).unwrap(), "x\n");
}

#[test]
fn stdout_to_file_truncates() {
    let tmpdir = TempDir::new().unwrap();
    let tmpname = tmpdir.path().join("out");
    fs::write(&tmpname, "old contents\n").unwrap();
    run(Cmd::new("printf")
        .arg("new")
        .stdout_to(Redirectable::path(&tmpname)))
    .unwrap();
    assert_eq!(fs::read_to_string(&tmpname).unwrap(), "new");
}

#[test]
fn stdout_to_file_appends() {
    let tmpdir = TempDir::new().unwrap();
    let tmpname = tmpdir.path().join("out");
    run(Cmd::new("printf")
        .arg("one\\n")
        .stdout_to(Redirectable::append(&tmpname)))
    .unwrap();
    run(Cmd::new("printf")
        .arg("two\\n")
        .stdout_to(Redirectable::append(&tmpname)))
    .unwrap();
    assert_eq!(fs::read_to_string(&tmpname).unwrap(), "one\ntwo\n");
}

#[test]
fn stdin_from_file() {
    let tmpdir = TempDir::new().unwrap();
    let tmpname = tmpdir.path().join("in");
    fs::write(&tmpname, "file input").unwrap();
    let out = read_string(Cmd::new("cat").stdin_from(Redirectable::path(&tmpname))).unwrap();
    assert_eq!(out, "file input");
}

#[test]
fn stdin_from_open_file() {
    let tmpdir = TempDir::new().unwrap();
    let tmpname = tmpdir.path().join("in");
    fs::write(&tmpname, "already open").unwrap();
    let f = File::open(&tmpname).unwrap();
    let out = read_string(Cmd::new("cat").stdin_from(f)).unwrap();
    assert_eq!(out, "already open");
}

#[test]
fn cat_roundtrip_over_endpoints() {
    let mut chain = open(Cmd::new("cat"), Mode::ReadWrite, Redirectable::Null).unwrap();
    let payload = b"bytes in, bytes out\n".repeat(64);
    let mut stdin = chain.stdin.take().unwrap();
    stdin.write_all(&payload).unwrap();
    drop(stdin);
    let mut echoed = Vec::new();
    chain
        .stdout
        .take()
        .unwrap()
        .read_to_end(&mut echoed)
        .unwrap();
    chain.wait().unwrap();
    assert!(chain.success());
    assert_eq!(echoed, payload);
}

#[test]
fn write_stream_forwarder_flushes_before_wait_returns() {
    let sink = SharedBuf::new();
    let chain = start_stdio(
        Cmd::new("printf").arg("forwarded"),
        vec![
            Redirectable::Null,
            Redirectable::WriteStream(Box::new(sink.clone())),
        ],
    )
    .unwrap();
    chain.wait().unwrap();
    // wait joins the forwarder, so the bytes must already be here
    assert_eq!(sink.contents(), b"forwarded");
}

#[test]
fn read_and_write_stream_forwarders() {
    let source = Cursor::new(b"stream roundtrip".to_vec());
    let sink = SharedBuf::new();
    let chain = start_stdio(
        Cmd::new("cat"),
        vec![
            Redirectable::ReadStream(Box::new(source)),
            Redirectable::WriteStream(Box::new(sink.clone())),
        ],
    )
    .unwrap();
    chain.wait().unwrap();
    assert!(chain.success());
    assert_eq!(sink.contents(), b"stream roundtrip");
}

#[test]
fn read_stream_rejected_for_output_slot() {
    let err = start_stdio(
        Cmd::new("true"),
        vec![
            Redirectable::Null,
            Redirectable::ReadStream(Box::new(Cursor::new(Vec::new()))),
        ],
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(..)));
}

#[test]
fn write_stream_rejected_for_input_slot() {
    let err = start_stdio(
        Cmd::new("true"),
        vec![Redirectable::WriteStream(Box::new(SharedBuf::new()))],
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(..)));
}

#[test]
fn endpoint_attaches_to_chain() {
    let ep = crate::PipeEndpoint::new();
    let mut chain = start_stdio(
        Cmd::new("printf").arg("attached"),
        vec![Redirectable::Null, Redirectable::Endpoint(ep.clone())],
    )
    .unwrap();
    // setup linked the parent end and start moved it onto the chain
    assert!(!ep.is_linked());
    let out = read_whole_file(chain.stdout.take().unwrap());
    chain.wait().unwrap();
    assert_eq!(out, "attached");
}

#[test]
fn pipe_pair_wires_two_commands() {
    let pair = crate::PipePair::new();
    let producer = start_stdio(
        Cmd::new("printf").arg("handoff"),
        vec![Redirectable::Null, Redirectable::Pipe(pair.clone())],
    )
    .unwrap();
    let ep = crate::PipeEndpoint::new();
    let mut consumer = start_stdio(
        Cmd::new("cat"),
        vec![
            Redirectable::Pipe(pair.clone()),
            Redirectable::Endpoint(ep),
        ],
    )
    .unwrap();
    // drop our copies of the pair so the consumer can see EOF
    pair.read.take();
    pair.write.take();
    let out = read_whole_file(consumer.stdout.take().unwrap());
    producer.wait().unwrap();
    consumer.wait().unwrap();
    assert_eq!(out, "handoff");
}

#[test]
fn feed_tolerates_early_exit() {
    // `true` never reads its stdin; the feed forwarder must treat the
    // broken pipe as a normal end
    let big = Cursor::new(vec![b'x'; 1 << 20]);
    let chain = start_stdio(
        Cmd::new("true"),
        vec![Redirectable::ReadStream(Box::new(big))],
    )
    .unwrap();
    chain.wait().unwrap();
    assert!(chain.success());
}
