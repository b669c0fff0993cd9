use std::ffi::CString;
use std::io;
use std::sync::Arc;

use crate::cmd::{Cmd, CmdExpr, flags};
use crate::error::{Error, Result};
use crate::pipe;
use crate::posix;
use crate::process::{ProcShared, Process, ProcessChain};
use crate::reactor::{SpawnRequest, reactor};
use crate::stdio::{self, StdioSlot};

/// Spawn a single command over the given stdio slots.
///
/// Marshals argv, environment, cwd, cpumask and the slot table into one
/// spawn wire call, collects the forwarders referenced by the slots as the
/// process's sync set, and registers the process for the completion
/// callback before the call returns.
pub(crate) fn spawn_one(cmd: &Cmd, slots: &[StdioSlot]) -> Result<Process> {
    if cmd.argv().is_empty() {
        return Err(Error::invalid("argv must not be empty"));
    }

    let argv: Vec<CString> = cmd
        .argv()
        .iter()
        .map(|a| posix::os_to_cstring(a))
        .collect::<io::Result<_>>()?;
    let file = argv[0].clone();
    let env = match cmd.format_env() {
        Some(vars) => Some(
            vars.iter()
                .map(|v| posix::os_to_cstring(v))
                .collect::<io::Result<Vec<_>>>()?,
        ),
        None => None,
    };
    let cwd = cmd.cwd_os().map(posix::os_to_cstring).transpose()?;
    let stdio = stdio::wire_stdio(slots);
    // the loop's built-in default for this bit is the inverse of ours
    let spawn_flags = cmd.flag_bits() ^ flags::DISABLE_EXACT_NAME;
    let cpumask = cmd
        .cpu_list()
        .filter(|cpus| !cpus.is_empty())
        .map(|cpus| {
            let top = cpus.iter().copied().max().unwrap_or(0) + 1;
            let mut mask = vec![0u8; top.max(posix::CPUMASK_SIZE)];
            for &cpu in cpus {
                mask[cpu] = 1;
            }
            mask
        });
    let sync_tasks = stdio::collect_sync(slots);

    let shared = Arc::new(ProcShared::new(cmd.clone()));
    let req = SpawnRequest {
        file,
        argv,
        env,
        cwd,
        stdio,
        flags: spawn_flags,
        cpumask,
    };
    match reactor().spawn(req, &shared) {
        Ok(..) => Ok(Process::new(shared, sync_tasks)),
        Err(code) => Err(Error::Spawn {
            code,
            cmd: cmd.to_cmdline_lossy(),
        }),
    }
}

/// Lower a command expression over a base slot vector into a chain of
/// running processes, spawned left-to-right.
///
/// When any spawn fails, members spawned so far are terminated and reaped
/// before the error escapes; the original spawn error is returned.
pub(crate) fn spawn_tree(expr: CmdExpr, slots: &[StdioSlot]) -> Result<ProcessChain> {
    debug_assert!(slots.len() >= 3);
    let mut chain = ProcessChain::empty();
    match spawn_expr(expr, slots, &mut chain) {
        Ok(()) => Ok(chain),
        Err(err) => {
            abort_partial(&chain);
            Err(err)
        }
    }
}

fn spawn_expr(expr: CmdExpr, slots: &[StdioSlot], chain: &mut ProcessChain) -> Result<()> {
    match expr {
        CmdExpr::Single(cmd) => {
            let process = spawn_one(&cmd, slots)?;
            chain.push(process);
            Ok(())
        }
        CmdExpr::Pipe(a, b) => {
            let (read_end, write_end) = pipe::link_pipe(false, false)?;
            let mut left = slots.to_vec();
            left[1] = StdioSlot::stream(&write_end);
            spawn_expr(*a, &left, chain)?;
            let mut right = slots.to_vec();
            right[0] = StdioSlot::stream(&read_end);
            spawn_expr(*b, &right, chain)?;
            // both children own dup2'ed copies of their ends by now
            pipe::close_sync(read_end);
            pipe::close_sync(write_end);
            Ok(())
        }
        CmdExpr::ErrPipe(a, b) => {
            let (read_end, write_end) = pipe::link_pipe(false, false)?;
            let mut left = slots.to_vec();
            left[2] = StdioSlot::stream(&write_end);
            spawn_expr(*a, &left, chain)?;
            let mut right = slots.to_vec();
            right[0] = StdioSlot::stream(&read_end);
            spawn_expr(*b, &right, chain)?;
            pipe::close_sync(read_end);
            pipe::close_sync(write_end);
            Ok(())
        }
        CmdExpr::Seq(a, b) => {
            spawn_expr(*a, slots, chain)?;
            spawn_expr(*b, slots, chain)
        }
        CmdExpr::Redirect {
            fd,
            what,
            readable,
            inner,
        } => {
            let prepared = stdio::prepare(what, readable)?;
            let mut sub = slots.to_vec();
            let fd = fd as usize;
            if fd >= sub.len() {
                sub.resize(fd + 1, StdioSlot::null());
            }
            sub[fd] = prepared.slot.clone();
            spawn_expr(*inner, &sub, chain)?;
            // dropping `prepared` is the close-after-spawn of the slot
            drop(prepared);
            Ok(())
        }
    }
}

/// Terminate and reap the members of a partially composed chain.
///
/// Sync tasks are not joined here: their pipe ends are still owned by the
/// failing composition above us, and they wind down on their own once
/// those close.
fn abort_partial(chain: &ProcessChain) {
    for p in &chain.processes {
        p.terminate().ok();
    }
    for p in &chain.processes {
        p.wait_no_sync().ok();
    }
}
