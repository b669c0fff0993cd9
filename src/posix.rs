use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::{Error, Result};
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::ptr;

use libc;

pub use libc::{ECHILD, EINTR, EINVAL, ESRCH};

/// Signals deliverable through [`kill`], with the conventional POSIX numbers.
///
/// Windows knows no `SIGQUIT` or `SIGPIPE`; the constants are part of the
/// portable surface regardless so that signal numbers mean the same thing
/// everywhere.
pub mod signal {
    /// Hangup detected on controlling terminal.
    pub const SIGHUP: i32 = 1;
    /// Interrupt from keyboard.
    pub const SIGINT: i32 = 2;
    /// Quit from keyboard.
    pub const SIGQUIT: i32 = 3;
    /// Kill signal; cannot be caught or ignored.
    pub const SIGKILL: i32 = 9;
    /// Broken pipe: write to pipe with no readers.
    pub const SIGPIPE: i32 = 13;
    /// Termination signal.
    pub const SIGTERM: i32 = 15;
}

fn check_err<T: Ord + Default>(num: T) -> Result<T> {
    if num < T::default() {
        return Err(Error::last_os_error());
    }
    Ok(num)
}

pub fn pipe() -> Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    check_err(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    Ok(unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) })
}

pub const F_GETFD: i32 = libc::F_GETFD;
pub const F_SETFD: i32 = libc::F_SETFD;
pub const FD_CLOEXEC: i32 = libc::FD_CLOEXEC;
pub const F_GETFL: i32 = libc::F_GETFL;
pub const F_SETFL: i32 = libc::F_SETFL;
pub const O_NONBLOCK: i32 = libc::O_NONBLOCK;

pub fn fcntl(fd: i32, cmd: i32, arg1: Option<i32>) -> Result<i32> {
    check_err(unsafe {
        match arg1 {
            Some(arg1) => libc::fcntl(fd, cmd, arg1),
            None => libc::fcntl(fd, cmd),
        }
    })
}

/// Mark `f` as close-on-exec.  Child-bound descriptors don't need the
/// inverse: `dup2` to the target fd produces a descriptor with the flag
/// cleared.
pub fn set_cloexec(f: &File) -> Result<()> {
    let fd = f.as_raw_fd();
    let old = fcntl(fd, F_GETFD, None)?;
    fcntl(fd, F_SETFD, Some(old | FD_CLOEXEC))?;
    Ok(())
}

pub fn set_nonblocking(f: &File, nonblocking: bool) -> Result<()> {
    let fd = f.as_raw_fd();
    let old = fcntl(fd, F_GETFL, None)?;
    let new = if nonblocking {
        old | O_NONBLOCK
    } else {
        old & !O_NONBLOCK
    };
    if new != old {
        fcntl(fd, F_SETFL, Some(new))?;
    }
    Ok(())
}

/// Returns `Some(child_pid)` in the parent and `None` in the child.
///
/// # Safety
///
/// In a multithreaded program the child may only call async-signal-safe
/// functions until it execs.
pub unsafe fn fork() -> Result<Option<u32>> {
    let pid = check_err(unsafe { libc::fork() })?;
    if pid == 0 { Ok(None) } else { Ok(Some(pid as u32)) }
}

pub fn _exit(status: u8) -> ! {
    unsafe { libc::_exit(status as libc::c_int) }
}

pub fn os_to_cstring(s: &OsStr) -> Result<CString> {
    let bytes = s.as_bytes();
    if bytes.iter().any(|&b| b == 0) {
        return Err(Error::from_raw_os_error(libc::EINVAL));
    }
    Ok(CString::new(bytes)
        // not expected to fail on Unix, as Unix paths *are* C strings
        .expect("converting Unix path to C string"))
}

fn cstring_ptr(s: &CString) -> *const libc::c_char {
    s.as_bytes_with_nul().as_ptr() as _
}

/// Execute `file`, searching `PATH` when it contains no slash.
///
/// With `env` of `None` the parent environment is inherited (`execvp`);
/// otherwise the given `KEY=VALUE` block replaces it and the `PATH` lookup
/// is done by hand before `execve`, mirroring what `execvpe` would do.
/// Returns only on failure.
pub fn exec(file: &CString, argv: &[CString], env: Option<&[CString]>) -> Result<()> {
    let mut argv_ptr: Vec<*const libc::c_char> = argv.iter().map(cstring_ptr).collect();
    argv_ptr.push(ptr::null());

    let Some(env) = env else {
        check_err(unsafe { libc::execvp(cstring_ptr(file), argv_ptr.as_ptr()) })?;
        return Ok(());
    };

    let mut env_ptr: Vec<*const libc::c_char> = env.iter().map(cstring_ptr).collect();
    env_ptr.push(ptr::null());

    if file.as_bytes().contains(&b'/') {
        check_err(unsafe { libc::execve(cstring_ptr(file), argv_ptr.as_ptr(), env_ptr.as_ptr()) })?;
        return Ok(());
    }

    let path_var = std::env::var_os("PATH").unwrap_or_else(|| OsString::from("/usr/bin:/bin"));
    let mut last_err = libc::ENOENT;
    for dir in std::env::split_paths(&path_var) {
        let full = dir.join(OsStr::from_bytes(file.as_bytes()));
        let Ok(full_c) = os_to_cstring(full.as_os_str()) else {
            continue;
        };
        unsafe { libc::execve(cstring_ptr(&full_c), argv_ptr.as_ptr(), env_ptr.as_ptr()) };
        let errno = Error::last_os_error().raw_os_error().unwrap_or(libc::ENOENT);
        // EACCES from one PATH entry must not mask a later match
        if errno != libc::ENOENT && errno != libc::EACCES && errno != libc::ENOTDIR {
            return Err(Error::from_raw_os_error(errno));
        }
        last_err = errno;
    }
    Err(Error::from_raw_os_error(last_err))
}

pub const WNOHANG: i32 = libc::WNOHANG;

/// `waitpid(pid, flags)`.  With `WNOHANG`, a still-running child reports
/// pid 0.
pub fn waitpid(pid: u32, flags: i32) -> Result<(u32, i32)> {
    let mut status = 0 as libc::c_int;
    let pid_out = check_err(unsafe {
        libc::waitpid(
            pid as libc::pid_t,
            &mut status as *mut libc::c_int,
            flags as libc::c_int,
        )
    })?;
    Ok((pid_out as u32, status))
}

/// Decode a raw wait status into `(exit_code, term_signal)`.
///
/// Exactly one of the pair is meaningful: a signaled child reports exit
/// code 0, a normally exited child reports signal 0.
pub fn decode_exit_status(status: i32) -> (i64, i32) {
    if libc::WIFSIGNALED(status) {
        (0, libc::WTERMSIG(status))
    } else if libc::WIFEXITED(status) {
        (libc::WEXITSTATUS(status) as i64, 0)
    } else {
        (status as i64, 0)
    }
}

pub fn kill(pid: u32, signal: i32) -> Result<()> {
    check_err(unsafe { libc::kill(pid as libc::pid_t, signal as libc::c_int) })?;
    Ok(())
}

pub fn dup2(oldfd: i32, newfd: i32) -> Result<()> {
    check_err(unsafe { libc::dup2(oldfd, newfd) })?;
    Ok(())
}

pub fn chdir(dir: &CString) -> Result<()> {
    check_err(unsafe { libc::chdir(cstring_ptr(dir)) })?;
    Ok(())
}

pub fn setsid() -> Result<()> {
    check_err(unsafe { libc::setsid() })?;
    Ok(())
}

/// Open `/dev/null` for the given direction, returning the raw fd.
///
/// Only used between `fork` and `exec`; the descriptor is intentionally
/// not wrapped in a `File` since the child never returns.
pub fn open_devnull(readable: bool) -> Result<RawFd> {
    let flags = if readable { libc::O_RDONLY } else { libc::O_WRONLY };
    check_err(unsafe { libc::open(c"/dev/null".as_ptr(), flags) })
}

/// Pin the calling process to the CPUs whose entries in `mask` are nonzero.
#[cfg(target_os = "linux")]
pub fn set_affinity(mask: &[u8]) -> Result<()> {
    if mask.len() > libc::CPU_SETSIZE as usize {
        return Err(Error::from_raw_os_error(libc::EINVAL));
    }
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        for (cpu, &on) in mask.iter().enumerate() {
            if on != 0 {
                libc::CPU_SET(cpu, &mut set);
            }
        }
        check_err(libc::sched_setaffinity(
            0,
            mem::size_of::<libc::cpu_set_t>(),
            &set,
        ))?;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_affinity(_mask: &[u8]) -> Result<()> {
    // no portable affinity call; the mask is advisory off Linux
    Ok(())
}

/// Minimum cpumask length accepted by the spawn wire call, in entries.
#[cfg(target_os = "linux")]
pub const CPUMASK_SIZE: usize = libc::CPU_SETSIZE as usize;

#[cfg(not(target_os = "linux"))]
pub const CPUMASK_SIZE: usize = 1024;

pub fn reset_sigpipe() -> Result<()> {
    // This is called after forking to reset SIGPIPE handling to the
    // defaults that Unix programs expect.  Quoting
    // std::process::Command::do_exec:
    //
    // """
    // libstd ignores SIGPIPE, and signal-handling libraries often set
    // a mask. Child processes inherit ignored signals and the signal
    // mask from their parent, but most UNIX programs do not reset
    // these things on their own, so we need to clean things up now to
    // avoid confusing the program we're about to run.
    // """

    unsafe {
        let mut set = mem::MaybeUninit::<libc::sigset_t>::uninit();
        check_err(libc::sigemptyset(set.as_mut_ptr()))?;
        check_err(libc::pthread_sigmask(
            libc::SIG_SETMASK,
            set.as_ptr(),
            ptr::null_mut(),
        ))?;
        let ret = libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        if ret == libc::SIG_ERR {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}
