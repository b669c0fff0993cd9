use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::cmd::flags;
use crate::error::Error;
use crate::posix;
use crate::process::ProcShared;

/// Identity of a loop handle block.  The block itself lives in the
/// reactor's handle table; the id is what gets stored in `Process` state
/// and nulled when the handle is closed.  Completion is keyed on this id,
/// never on the OS pid, which the kernel is free to reuse the moment a
/// child is reaped.
pub(crate) type HandleId = u64;

/// The marshalled spawn call, one field per wire parameter.
pub(crate) struct SpawnRequest {
    /// Program to exec; the first argv entry unless overridden.
    pub file: CString,
    /// Argument vector, null-terminated on the way out.
    pub argv: Vec<CString>,
    /// `KEY=VALUE` environment block, or `None` to inherit.
    pub env: Option<Vec<CString>>,
    /// Working directory, or `None` to inherit.
    pub cwd: Option<CString>,
    /// Stdio table: `(tag, value)` per slot, slot index = child fd.
    pub stdio: Vec<(i32, usize)>,
    /// Flag bits; `DISABLE_EXACT_NAME` arrives already toggled.
    pub flags: u32,
    /// One byte per CPU, nonzero = allowed; `None` to inherit affinity.
    pub cpumask: Option<Vec<u8>>,
}

struct HandleBlock {
    pid: u32,
    /// The handle's user-data slot: a non-owning link back to the process
    /// that owns this handle.  Cleared by `close_handle`.
    data: Option<Weak<ProcShared>>,
}

struct Inner {
    handles: HashMap<HandleId, HandleBlock>,
    next_id: HandleId,
    reaper_started: bool,
}

/// The process-wide event loop.
///
/// Owns the loop lock serializing every handle mutation (spawn, kill, pid
/// query, association teardown) and the reaper thread that waits on the
/// registered children and dispatches completion callbacks.  Initialized
/// once on first use and never torn down.
pub(crate) struct Reactor {
    inner: Mutex<Inner>,
    have_children: Condvar,
}

static REACTOR: OnceLock<Reactor> = OnceLock::new();

pub(crate) fn reactor() -> &'static Reactor {
    REACTOR.get_or_init(|| Reactor {
        inner: Mutex::new(Inner {
            handles: HashMap::new(),
            next_id: 1,
            reaper_started: false,
        }),
        have_children: Condvar::new(),
    })
}

impl Reactor {
    /// Spawn a child per `req` and register it under a fresh handle.
    ///
    /// The whole call runs under the loop lock: the fork/exec handshake,
    /// the handle association, and the write of `shared`'s handle and pid.
    /// The completion callback also needs the lock to dispatch, so it
    /// cannot observe the child before the association is complete, no
    /// matter how quickly the child exits.
    ///
    /// On failure returns the negated OS error code; a child that forked
    /// but failed to exec has already been reaped.
    pub(crate) fn spawn(
        &self,
        req: SpawnRequest,
        shared: &Arc<ProcShared>,
    ) -> Result<(HandleId, u32), i32> {
        let mut inner = self.inner.lock().unwrap();
        self.ensure_reaper(&mut inner);

        let pid = match spawn_child(&req) {
            Ok(pid) => pid,
            Err(e) => {
                debug!("spawn failed: {}", e);
                return Err(-e.raw_os_error().unwrap_or(posix::EINVAL));
            }
        };

        let id = inner.next_id;
        inner.next_id += 1;
        inner.handles.insert(
            id,
            HandleBlock {
                pid,
                data: Some(Arc::downgrade(shared)),
            },
        );
        shared.attach(id, pid);
        self.have_children.notify_all();
        Ok((id, pid))
    }

    /// Deliver `sig` to the process if its handle is still live.
    ///
    /// ESRCH means the child is gone, which can legitimately race the
    /// completion callback and is treated as success.
    pub(crate) fn kill(&self, shared: &ProcShared, sig: i32) -> Result<(), Error> {
        let _loop_lock = self.inner.lock().unwrap();
        let Some((_handle, pid)) = shared.live_handle() else {
            return Ok(());
        };
        match posix::kill(pid, sig) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(posix::ESRCH) => Ok(()),
            Err(e) => Err(Error::Kill {
                code: e.raw_os_error().unwrap_or(0),
            }),
        }
    }

    /// The OS pid behind the process's handle.
    pub(crate) fn pid_of(&self, shared: &ProcShared) -> Result<u32, Error> {
        let _loop_lock = self.inner.lock().unwrap();
        match shared.live_handle() {
            Some((_handle, pid)) if pid > 0 => Ok(pid),
            _ => Err(Error::Pid),
        }
    }

    /// Force-close a handle: clear its association so the completion
    /// callback finds nothing to wake.  The table entry itself is freed
    /// when the child is reaped.
    pub(crate) fn close_handle(&self, id: HandleId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(block) = inner.handles.get_mut(&id) {
            block.data = None;
        }
    }

    fn ensure_reaper(&self, inner: &mut Inner) {
        if !inner.reaper_started {
            thread::Builder::new()
                .name("procpipe-reaper".into())
                .spawn(reaper_main)
                .expect("spawning reaper thread");
            inner.reaper_started = true;
        }
    }

    /// Completion callback: runs on the reaper thread with the loop lock
    /// held, must not block.  Records the exit, tears down the handle, and
    /// wakes waiters.
    ///
    /// `id` is the handle captured when the child was reaped; it is the
    /// only key used here.  A fresh spawn that was handed the same pid in
    /// the meantime sits under a different handle and is untouched.
    fn dispatch(&self, id: HandleId, pid: u32, exit_code: i64, term_signal: i32) {
        let mut inner = self.inner.lock().unwrap();
        let Some(block) = inner.handles.remove(&id) else {
            return;
        };
        debug_assert_eq!(block.pid, pid);
        if let Some(shared) = block.data.and_then(|weak| weak.upgrade()) {
            shared.complete(exit_code, term_signal);
        }
    }
}

/// Reaper thread: polls the registered children with `WNOHANG`, backing
/// off exponentially while nothing exits.
///
/// Only pids spawned through the reactor are ever waited on; children the
/// host process creates by other means are left for their owners to reap.
fn reaper_main() {
    let r = reactor();
    debug!("process reaper running");
    let mut delay = Duration::from_millis(1);
    loop {
        let registered: Vec<(HandleId, u32)> = {
            let mut inner = r.inner.lock().unwrap();
            while inner.handles.is_empty() {
                inner = r.have_children.wait(inner).unwrap();
                delay = Duration::from_millis(1);
            }
            inner
                .handles
                .iter()
                .map(|(&id, block)| (id, block.pid))
                .collect()
        };

        let mut reaped = false;
        for (id, pid) in registered {
            match posix::waitpid(pid, posix::WNOHANG) {
                Ok((0, _)) => {}
                Ok((reaped_pid, status)) => {
                    debug_assert_eq!(reaped_pid, pid);
                    let (exit_code, term_signal) = posix::decode_exit_status(status);
                    r.dispatch(id, pid, exit_code, term_signal);
                    reaped = true;
                }
                Err(e) if e.raw_os_error() == Some(posix::EINTR) => {}
                Err(e) if e.raw_os_error() == Some(posix::ECHILD) => {
                    // an outside waiter consumed the exit status; report it
                    // negated, like other out-of-band failures, so waiters
                    // still wake
                    warn!("child {} was reaped outside the reactor", pid);
                    r.dispatch(id, pid, -i64::from(posix::ECHILD), 0);
                    reaped = true;
                }
                Err(e) => warn!("waitpid({}) failed in reaper: {}", pid, e),
            }
        }

        if reaped {
            delay = Duration::from_millis(1);
        } else {
            thread::sleep(delay);
            delay = (delay * 2).min(Duration::from_millis(100));
        }
    }
}

/// Read exactly N bytes, or return None on immediate EOF. Similar to
/// read_exact(), but distinguishes between no read and partial read
/// (which is treated as error).
fn read_exact_or_eof<const N: usize>(source: &mut File) -> io::Result<Option<[u8; N]>> {
    let mut buf = [0u8; N];
    let mut total_read = 0;
    while total_read < N {
        let n = source.read(&mut buf[total_read..])?;
        if n == 0 {
            break;
        }
        total_read += n;
    }
    match total_read {
        0 => Ok(None),
        n if n == N => Ok(Some(buf)),
        _ => Err(io::ErrorKind::UnexpectedEof.into()),
    }
}

/// Fork and exec per `req`, confirming the exec through a close-on-exec
/// error pipe.  Returns the child pid once the exec is known to have
/// happened, or the child's errno if it did not.
fn spawn_child(req: &SpawnRequest) -> io::Result<u32> {
    let mut exec_fail_pipe = posix::pipe()?;
    posix::set_cloexec(&exec_fail_pipe.0)?;
    posix::set_cloexec(&exec_fail_pipe.1)?;

    let pid;
    unsafe {
        match posix::fork()? {
            Some(child_pid) => {
                pid = child_pid;
            }
            None => {
                drop(exec_fail_pipe.0);
                let result = exec_child(req);
                let error_code = match result {
                    Ok(()) => unreachable!(),
                    Err(e) => e.raw_os_error().unwrap_or(-1),
                } as u32;
                exec_fail_pipe.1.write_all(&error_code.to_le_bytes()).ok();
                posix::_exit(127);
            }
        }
    }

    drop(exec_fail_pipe.1);
    match read_exact_or_eof::<4>(&mut exec_fail_pipe.0)? {
        None => Ok(pid),
        Some(error_buf) => {
            let error_code = u32::from_le_bytes(error_buf);
            // reap the stillborn child; it was never registered, so the
            // reaper will not touch it
            posix::waitpid(pid, 0).ok();
            Err(io::Error::from_raw_os_error(error_code as i32))
        }
    }
}

/// Runs in the forked child.  Wires the stdio table, applies cwd, flags
/// and affinity, then execs.  Returns only on failure.
fn exec_child(req: &SpawnRequest) -> io::Result<()> {
    for (target, &(tag, value)) in req.stdio.iter().enumerate() {
        let target = target as i32;
        if tag == 0 {
            let fd = posix::open_devnull(target == 0)?;
            if fd != target {
                posix::dup2(fd, target)?;
            }
        } else {
            let fd = value as i32;
            if fd != target {
                posix::dup2(fd, target)?;
            }
        }
    }
    if let Some(cwd) = &req.cwd {
        posix::chdir(cwd)?;
    }
    if req.flags & flags::DETACHED != 0 {
        posix::setsid()?;
    }
    if let Some(mask) = &req.cpumask {
        posix::set_affinity(mask)?;
    }
    posix::reset_sigpipe()?;
    posix::exec(&req.file, &req.argv, req.env.as_deref())?;
    unreachable!();
}
