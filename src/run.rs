use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::thread;
use std::time::Duration;

use crate::cmd::CmdExpr;
use crate::error::{Error, Result};
use crate::posix::signal::SIGTERM;
use crate::process::ProcessChain;
use crate::spawn;
use crate::stdio::{self, PipeEndpoint, Redirectable, StdioSlot};

/// Prepare the stdio vector, spawn the expression over it, and attach any
/// endpoint pipe ends to the chain.
fn spawn_with(expr: CmdExpr, stdios: Vec<Redirectable>) -> Result<ProcessChain> {
    let endpoints: Vec<Option<PipeEndpoint>> = stdios
        .iter()
        .map(|r| match r {
            Redirectable::Endpoint(ep) => Some(ep.clone()),
            _ => None,
        })
        .collect();

    let prepared = stdio::prepare_all(stdios)?;
    let mut slots: Vec<StdioSlot> = prepared.iter().map(|p| p.slot.clone()).collect();
    while slots.len() < 3 {
        slots.push(StdioSlot::null());
    }

    let result = spawn::spawn_tree(expr, &slots);
    // close-after-spawn: the children own their dup2'ed copies
    drop(prepared);
    let mut chain = result?;

    if let Some(Some(ep)) = endpoints.first() {
        chain.stdin = ep.take();
    }
    if let Some(Some(ep)) = endpoints.get(1) {
        chain.stdout = ep.take();
    }
    if let Some(Some(ep)) = endpoints.get(2) {
        chain.stderr = ep.take();
    }
    Ok(chain)
}

fn with_defaults(mut defaults: Vec<Redirectable>, user: Vec<Redirectable>) -> Vec<Redirectable> {
    for (i, r) in user.into_iter().enumerate() {
        if i < defaults.len() {
            defaults[i] = r;
        } else {
            defaults.push(r);
        }
    }
    defaults
}

/// Run a command expression to completion with inherited standard streams.
///
/// Spawns the expression with the parent's stdin, stdout and stderr, waits
/// for every member and its stream forwarders, and fails with
/// [`Error::Failed`] if any member without
/// [`ignore_status`](crate::Cmd::ignore_status) exited unsuccessfully.
///
/// ```no_run
/// # use procpipe::{run, Cmd};
/// # fn demo() -> procpipe::Result<()> {
/// run(Cmd::new("make").arg("install"))?;
/// # Ok(())
/// # }
/// ```
pub fn run(expr: impl Into<CmdExpr>) -> Result<ProcessChain> {
    run_stdio(expr, vec![])
}

/// Like [`run`], with positional stdio overrides.
///
/// `stdios[0]` replaces the child's stdin, `stdios[1]` stdout, `stdios[2]`
/// stderr; missing positions keep the inherited default.
pub fn run_stdio(
    expr: impl Into<CmdExpr>,
    stdios: Vec<Redirectable>,
) -> Result<ProcessChain> {
    let chain = spawn_with(
        expr.into(),
        with_defaults(stdio::inherit_defaults(), stdios),
    )?;
    chain.wait()?;
    chain.check_success()?;
    Ok(chain)
}

/// Start a command expression without waiting.
///
/// Standard streams not overridden are swallowed (connected to the null
/// device).  The returned chain is live; use
/// [`wait`](ProcessChain::wait)/[`check_success`](ProcessChain::check_success)
/// or the signal operations on it.
pub fn start(expr: impl Into<CmdExpr>) -> Result<ProcessChain> {
    start_stdio(expr, vec![])
}

/// Like [`start`], with positional stdio overrides.
///
/// Passing a [`Redirectable::Endpoint`] attaches the parent-side pipe end
/// to the returned chain's `stdin`/`stdout`/`stderr` field.
pub fn start_stdio(
    expr: impl Into<CmdExpr>,
    stdios: Vec<Redirectable>,
) -> Result<ProcessChain> {
    spawn_with(
        expr.into(),
        with_defaults(stdio::swallow_defaults(), stdios),
    )
}

/// Run an expression with swallowed stdio and report whether every member
/// exited with code 0.
///
/// Unlike [`run`] this does not error on unsuccessful exits; spawn
/// failures still error.
pub fn success(expr: impl Into<CmdExpr>) -> Result<bool> {
    let chain = start(expr)?;
    chain.wait()?;
    Ok(chain.success())
}

/// Which directions [`open`] connects to the parent.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Mode {
    /// Pipe the child's stdout to the parent (`chain.stdout`).
    Read,
    /// Pipe the parent to the child's stdin (`chain.stdin`).
    Write,
    /// Both.
    ReadWrite,
}

/// Start an expression with pipe ends for the requested directions.
///
/// The opposite-direction slot is connected to `stdio` (commonly
/// [`Redirectable::Null`]); stderr is inherited.  With [`Mode::ReadWrite`]
/// both slots are piped, so `stdio` must be `Null`.
pub fn open(
    expr: impl Into<CmdExpr>,
    mode: Mode,
    stdio: Redirectable,
) -> Result<ProcessChain> {
    let mut slots = vec![
        Redirectable::Null,
        Redirectable::Null,
        Redirectable::Fd(2),
    ];
    match mode {
        Mode::Read => {
            slots[0] = stdio;
            slots[1] = Redirectable::Endpoint(PipeEndpoint::new());
        }
        Mode::Write => {
            slots[0] = Redirectable::Endpoint(PipeEndpoint::new());
            slots[1] = stdio;
        }
        Mode::ReadWrite => {
            if !matches!(stdio, Redirectable::Null) {
                return Err(Error::invalid(
                    "both directions piped leave no slot for stdio",
                ));
            }
            slots[0] = Redirectable::Endpoint(PipeEndpoint::new());
            slots[1] = Redirectable::Endpoint(PipeEndpoint::new());
        }
    }
    spawn_with(expr.into(), slots)
}

/// Capture the standard output of an expression as bytes.
///
/// Equivalent to `open(expr, Mode::Read, Null)` followed by reading to
/// EOF, waiting, and checking the exit status.
pub fn read_bytes(expr: impl Into<CmdExpr>) -> Result<Vec<u8>> {
    let mut chain = open(expr, Mode::Read, Redirectable::Null)?;
    let mut out = Vec::new();
    if let Some(mut stdout) = chain.stdout.take() {
        stdout.read_to_end(&mut out)?;
    }
    chain.wait()?;
    chain.check_success()?;
    Ok(out)
}

/// Capture the standard output of an expression as text.
///
/// Invalid UTF-8 is replaced, not rejected.
pub fn read_string(expr: impl Into<CmdExpr>) -> Result<String> {
    Ok(String::from_utf8_lossy(&read_bytes(expr)?).into_owned())
}

/// Stream the lines of an expression's standard output.
///
/// With `keep` the line terminators are retained.  After the last line the
/// iterator waits for the chain and yields one final `Err` if it failed.
pub fn lines(expr: impl Into<CmdExpr>, keep: bool) -> Result<Lines> {
    let mut chain = open(expr, Mode::Read, Redirectable::Null)?;
    let reader = chain.stdout.take().map(BufReader::new);
    Ok(Lines {
        reader,
        chain: Some(chain),
        keep,
    })
}

/// Iterator over output lines, created by [`lines`].
#[derive(Debug)]
pub struct Lines {
    reader: Option<BufReader<File>>,
    chain: Option<ProcessChain>,
    keep: bool,
}

impl Iterator for Lines {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Result<String>> {
        if let Some(reader) = self.reader.as_mut() {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => self.reader = None,
                Ok(..) => {
                    if !self.keep {
                        if line.ends_with('\n') {
                            line.pop();
                        }
                        if line.ends_with('\r') {
                            line.pop();
                        }
                    }
                    return Some(Ok(line));
                }
                Err(e) => {
                    self.reader = None;
                    self.chain = None;
                    return Some(Err(e.into()));
                }
            }
        }
        let chain = self.chain.take()?;
        match chain.wait().and_then(|()| chain.check_success()) {
            Ok(()) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

const GRACE: Duration = Duration::from_secs(2);

/// Run `f` over a freshly opened chain with guaranteed cleanup.
///
/// On success of `f`: the child's stdin is closed, its stdout must already
/// be at EOF (anything left unread fails with [`Error::Pipe`] and triggers
/// the cleanup path), the chain is waited and its status checked.
///
/// On failure of `f`, or on leftover output: stdin is closed, a watchdog
/// delivers `SIGTERM` to members still running after a 2-second grace
/// period, and the chain is waited without joining forwarders before the
/// error is returned.
pub fn with_process<T>(
    expr: impl Into<CmdExpr>,
    mode: Mode,
    f: impl FnOnce(&mut ProcessChain) -> Result<T>,
) -> Result<T> {
    let mut chain = open(expr, mode, Redirectable::Null)?;
    match f(&mut chain) {
        Err(err) => {
            abort_scoped(&mut chain);
            Err(err)
        }
        Ok(value) => {
            chain.stdin = None;
            if let Some(stdout) = chain.stdout.as_mut() {
                let mut probe = [0u8; 1];
                match stdout.read(&mut probe) {
                    Ok(0) => (),
                    Ok(..) => {
                        abort_scoped(&mut chain);
                        return Err(Error::Pipe);
                    }
                    Err(e) => {
                        abort_scoped(&mut chain);
                        return Err(e.into());
                    }
                }
            }
            chain.stdout = None;
            chain.stderr = None;
            chain.wait()?;
            chain.check_success()?;
            Ok(value)
        }
    }
}

fn abort_scoped(chain: &mut ProcessChain) {
    chain.stdin = None;
    let shares = chain.shared_list();
    thread::Builder::new()
        .name("procpipe-grace".into())
        .spawn(move || {
            thread::sleep(GRACE);
            for s in &shares {
                if s.running() {
                    s.deliver(SIGTERM).ok();
                }
            }
        })
        .ok();
    chain.stdout = None;
    chain.stderr = None;
    chain.wait_no_sync().ok();
}
