use std::fmt;
use std::fs::File;
use std::sync::{Arc, Condvar, Mutex};

use crate::cmd::Cmd;
use crate::error::{Error, FailedCommand, Result};
use crate::posix::signal::{SIGKILL, SIGTERM};
use crate::reactor::{HandleId, reactor};
use crate::stdio::Forwarder;

/// Exit code sentinel: the process has not been reaped yet.
const EXIT_SENTINEL: i64 = i64::MIN;
/// Term-signal sentinel, same meaning.
const SIG_SENTINEL: i32 = i32::MIN;

struct ProcState {
    /// The loop handle; becomes `None` exactly once, in the completion
    /// callback or on forced close.
    handle: Option<HandleId>,
    pid: u32,
    exit_code: i64,
    term_signal: i32,
}

/// State shared between a [`Process`], the reactor's handle table (via a
/// weak link), and any watchdog threads.
///
/// `exit_code`/`term_signal` are written exactly once, by the completion
/// callback, before the `exited` broadcast; readers either wait first or
/// observe the sentinels.
pub(crate) struct ProcShared {
    cmd: Cmd,
    state: Mutex<ProcState>,
    exited: Condvar,
}

impl ProcShared {
    pub(crate) fn new(cmd: Cmd) -> ProcShared {
        ProcShared {
            cmd,
            state: Mutex::new(ProcState {
                handle: None,
                pid: 0,
                exit_code: EXIT_SENTINEL,
                term_signal: SIG_SENTINEL,
            }),
            exited: Condvar::new(),
        }
    }

    pub(crate) fn cmd(&self) -> &Cmd {
        &self.cmd
    }

    /// Called by the reactor under the loop lock, before spawn returns.
    pub(crate) fn attach(&self, handle: HandleId, pid: u32) {
        let mut state = self.state.lock().unwrap();
        state.handle = Some(handle);
        state.pid = pid;
    }

    /// Completion callback body: record the exit, null the handle, wake
    /// waiters.  Runs under the loop lock; must not block.
    pub(crate) fn complete(&self, exit_code: i64, term_signal: i32) {
        let mut state = self.state.lock().unwrap();
        state.exit_code = exit_code;
        state.term_signal = term_signal;
        state.handle = None;
        self.exited.notify_all();
    }

    pub(crate) fn live_handle(&self) -> Option<(HandleId, u32)> {
        let state = self.state.lock().unwrap();
        state.handle.map(|h| (h, state.pid))
    }

    pub(crate) fn running(&self) -> bool {
        self.live_handle().is_some()
    }

    pub(crate) fn deliver(&self, sig: i32) -> Result<()> {
        reactor().kill(self, sig)
    }

    fn wait_exited(&self) {
        let mut state = self.state.lock().unwrap();
        while state.exit_code == EXIT_SENTINEL {
            state = self.exited.wait(state).unwrap();
        }
    }

    fn exit_pair(&self) -> (i64, i32) {
        let state = self.state.lock().unwrap();
        (state.exit_code, state.term_signal)
    }
}

/// A single spawned command.
///
/// Created by spawning a [`CmdExpr`](crate::CmdExpr) leaf; lives in a
/// [`ProcessChain`] in spawn order.  All methods take `&self`; the exit
/// state is shared with the reactor and updated by its completion
/// callback, so a `Process` can be inspected from any thread.
///
/// Dropping a still-running `Process` does not kill the child; it only
/// closes the loop handle, leaving the child to run unobserved.
pub struct Process {
    shared: Arc<ProcShared>,
    sync_tasks: Vec<Forwarder>,
}

impl Process {
    pub(crate) fn new(shared: Arc<ProcShared>, sync_tasks: Vec<Forwarder>) -> Process {
        Process { shared, sync_tasks }
    }

    /// The command this process was spawned from.
    pub fn cmd(&self) -> &Cmd {
        self.shared.cmd()
    }

    /// The OS pid, while the process handle is live.
    ///
    /// Fails with [`Error::Pid`] once the process has been reaped or the
    /// handle closed.
    pub fn pid(&self) -> Result<u32> {
        reactor().pid_of(&self.shared)
    }

    /// True while the loop handle is live, i.e. the child has not been
    /// reaped.
    pub fn running(&self) -> bool {
        self.shared.running()
    }

    /// Inverse of [`running`](Self::running).
    pub fn exited(&self) -> bool {
        !self.running()
    }

    /// True if the child was terminated by a signal.
    pub fn signaled(&self) -> bool {
        self.shared.exit_pair().1 > 0
    }

    /// The child's exit code, once it has exited.  0 for a signaled child.
    pub fn exit_code(&self) -> Option<i64> {
        match self.shared.exit_pair() {
            (EXIT_SENTINEL, _) => None,
            (code, _) => Some(code),
        }
    }

    /// The signal that terminated the child, once it has exited.  0 for a
    /// normal exit.
    pub fn term_signal(&self) -> Option<i32> {
        match self.shared.exit_pair() {
            (EXIT_SENTINEL, _) => None,
            (_, sig) => Some(sig),
        }
    }

    /// Non-blocking exit check: `Some((exit_code, term_signal))` once the
    /// child has been reaped.
    pub fn poll_exit(&self) -> Option<(i64, i32)> {
        match self.shared.exit_pair() {
            (EXIT_SENTINEL, _) => None,
            pair => Some(pair),
        }
    }

    /// True if the child exited voluntarily with code 0.
    pub fn success(&self) -> bool {
        matches!(self.shared.exit_pair(), (0, 0))
    }

    /// Deliver `sig` to the child.
    ///
    /// Delivering to an already-exited child is a no-op; the race against
    /// the completion callback is benign by design.
    pub fn send_signal(&self, sig: i32) -> Result<()> {
        self.shared.deliver(sig)
    }

    /// Send `SIGTERM`.
    pub fn terminate(&self) -> Result<()> {
        self.send_signal(SIGTERM)
    }

    /// Send `SIGKILL`.
    pub fn kill(&self) -> Result<()> {
        self.send_signal(SIGKILL)
    }

    /// Block until the child has exited and every stream forwarder
    /// attached to it has finished.
    ///
    /// The completion callback happens-before the return; forwarders are
    /// joined in slot order afterwards, so once `wait` returns all bytes
    /// the child wrote have reached their in-process destinations.
    pub fn wait(&self) -> Result<()> {
        self.wait_opt(true)
    }

    /// Like [`wait`](Self::wait), but without joining the forwarders.
    pub fn wait_no_sync(&self) -> Result<()> {
        self.wait_opt(false)
    }

    fn wait_opt(&self, join_sync: bool) -> Result<()> {
        self.shared.wait_exited();
        if join_sync {
            for task in &self.sync_tasks {
                task.join()?;
            }
        }
        Ok(())
    }

    pub(crate) fn shared(&self) -> Arc<ProcShared> {
        Arc::clone(&self.shared)
    }

    pub(crate) fn failed_command(&self) -> Option<FailedCommand> {
        match self.shared.exit_pair() {
            (0, 0) => None,
            (EXIT_SENTINEL, _) => None,
            (code, sig) => Some(FailedCommand {
                cmd: self.cmd().to_cmdline_lossy(),
                exit_code: code,
                term_signal: if sig == SIG_SENTINEL { 0 } else { sig },
            }),
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        // Abandoning a running process: close the loop handle so the
        // reactor's table doesn't leak.  The child itself is not signaled.
        if let Some((handle, _pid)) = self.shared.live_handle() {
            reactor().close_handle(handle);
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.shared.exit_pair() {
            (EXIT_SENTINEL, _) => "running".to_string(),
            (_, sig) if sig > 0 => format!("signaled {}", sig),
            (code, _) => format!("exited {}", code),
        };
        write!(f, "Process {{ {}, {} }}", self.cmd().to_cmdline_lossy(), state)
    }
}

/// Processes spawned from one command expression, in spawn order, plus
/// the pipe ends attached by `open`/`start`.
///
/// Spawn order is left-to-right across pipeline operators and decides
/// both iteration and error-reporting order.
#[derive(Debug, Default)]
pub struct ProcessChain {
    /// Write end of the first command's stdin, when one was requested.
    ///
    /// Declared before `processes` so the pipe closes first on drop and a
    /// child blocked on stdin can see EOF.
    pub stdin: Option<File>,
    /// Read end of the last command's stdout, when one was requested.
    pub stdout: Option<File>,
    /// Read end of the stderr slot, when one was requested.
    pub stderr: Option<File>,
    /// Member processes in spawn order.
    pub processes: Vec<Process>,
}

impl ProcessChain {
    pub(crate) fn empty() -> ProcessChain {
        ProcessChain::default()
    }

    /// Wait for every member in spawn order, joining stream forwarders.
    ///
    /// Close [`stdin`](Self::stdin) first if the first command reads from
    /// it, or the wait may never finish.
    pub fn wait(&self) -> Result<()> {
        for p in &self.processes {
            p.wait()?;
        }
        Ok(())
    }

    /// Wait for every member without joining stream forwarders.
    pub fn wait_no_sync(&self) -> Result<()> {
        for p in &self.processes {
            p.wait_no_sync()?;
        }
        Ok(())
    }

    /// True if every member exited voluntarily with code 0.
    pub fn success(&self) -> bool {
        self.processes.iter().all(Process::success)
    }

    /// Error out with [`Error::Failed`] if any member failed without
    /// `ignore_status`, reporting the failures in spawn order.
    pub fn check_success(&self) -> Result<()> {
        let failed: Vec<FailedCommand> = self
            .processes
            .iter()
            .filter(|p| !p.cmd().ignores_status())
            .filter_map(Process::failed_command)
            .collect();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Failed(failed))
        }
    }

    /// Deliver `sig` to every member, first to last.
    pub fn send_signal(&self, sig: i32) -> Result<()> {
        for p in &self.processes {
            p.send_signal(sig)?;
        }
        Ok(())
    }

    /// Send `SIGTERM` to every member.
    pub fn terminate(&self) -> Result<()> {
        self.send_signal(SIGTERM)
    }

    /// Send `SIGKILL` to every member.
    pub fn kill(&self) -> Result<()> {
        self.send_signal(SIGKILL)
    }

    /// The pid of the last member.
    pub fn pid(&self) -> Result<u32> {
        self.processes.last().ok_or(Error::Pid)?.pid()
    }

    pub(crate) fn push(&mut self, p: Process) {
        self.processes.push(p);
    }

    pub(crate) fn shared_list(&self) -> Vec<Arc<ProcShared>> {
        self.processes.iter().map(Process::shared).collect()
    }
}
