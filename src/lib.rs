//! Execution of external processes composed into pipelines.
//!
//! The entry points are the [`Cmd`] builder, the [`CmdExpr`] expression
//! type it composes into, and the lifecycle functions [`run`], [`start`],
//! [`open`], [`read_string`] and friends.  Commands combine with `|`
//! (stdout to stdin), [`pipe_err`](CmdExpr::pipe_err) (stderr to stdin)
//! and `&` (concurrent, shared stdio), and any stdio slot of an
//! expression can be redirected to files, descriptors, pipe endpoints, or
//! arbitrary in-process streams serviced by background forwarders.
//!
//! Under the hood a process-wide reactor performs the spawn calls and
//! reaps children from a dedicated thread, completing each
//! [`Process`] through a callback that records the exit code or
//! terminating signal and wakes waiters.  `wait` additionally joins the
//! stream forwarders, so when it returns, everything the child wrote has
//! arrived.
//!
//! # Examples
//!
//! Run a pipeline and capture its output:
//!
//! ```no_run
//! # fn demo() -> procpipe::Result<()> {
//! use procpipe::{read_string, Cmd};
//!
//! let n = read_string(Cmd::new("printf").arg("hello") | Cmd::new("wc").arg("-c"))?;
//! assert_eq!(n, "5\n");
//! # Ok(())
//! # }
//! ```
//!
//! Talk to a process over pipes:
//!
//! ```no_run
//! # fn demo() -> procpipe::Result<()> {
//! use std::io::{Read, Write};
//! use procpipe::{open, Cmd, Mode, Redirectable};
//!
//! let mut p = open(Cmd::new("cat"), Mode::ReadWrite, Redirectable::Null)?;
//! p.stdin.take().unwrap().write_all(b"roundtrip")?;
//! let mut echoed = String::new();
//! p.stdout.take().unwrap().read_to_string(&mut echoed)?;
//! p.wait()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg(unix)]

mod cmd;
mod error;
mod pipe;
mod posix;
mod process;
mod reactor;
mod run;
mod spawn;
mod stdio;

pub use crate::cmd::{Cmd, CmdExpr, flags};
pub use crate::error::{Error, FailedCommand, Result};
pub use crate::posix::signal;
pub use crate::process::{Process, ProcessChain};
pub use crate::run::{
    Lines, Mode, lines, open, read_bytes, read_string, run, run_stdio, start, start_stdio,
    success, with_process,
};
pub use crate::stdio::{Forwarder, PipeEndpoint, PipePair, Redirectable};

#[cfg(test)]
mod tests {
    mod common;

    mod cmd;
    mod pipeline;
    mod process;
    mod run;
    mod stdio;
}
