use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::env;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::path::Path;

use crate::stdio::Redirectable;

/// Spawn flag bits, passed through to the spawn wire call.
pub mod flags {
    /// On Windows, controls exact-name matching when resolving the program
    /// image.  The loop's built-in default is the inverse of the caller
    /// semantics, so this bit is toggled once, immediately before the
    /// spawn call.  No effect on Unix.
    pub const DISABLE_EXACT_NAME: u32 = 1 << 2;

    /// Spawn the child detached, as the leader of a new session.
    pub const DETACHED: u32 = 1 << 3;
}

/// A single external command: argv plus spawn-time attributes.
///
/// `Cmd` is a builder in the usual style:
///
/// ```no_run
/// # use procpipe::Cmd;
/// let cmd = Cmd::new("rsync")
///     .arg("-a")
///     .arg("src/")
///     .arg("dest/")
///     .env("RSYNC_RSH", "ssh")
///     .cwd("/tmp");
/// ```
///
/// A `Cmd` does nothing by itself; hand it (or an expression built from
/// it with `|`, `&` and the redirect methods) to [`run`](crate::run),
/// [`start`](crate::start), [`open`](crate::open) or friends.
#[derive(Clone)]
#[must_use]
pub struct Cmd {
    argv: Vec<OsString>,
    env: Option<Vec<(OsString, OsString)>>,
    cwd: Option<OsString>,
    flags: u32,
    cpus: Option<Vec<usize>>,
    ignore_status: bool,
}

impl Cmd {
    /// Constructs a new `Cmd` running `program` with no arguments.
    pub fn new(program: impl AsRef<OsStr>) -> Cmd {
        Cmd::from_argv(vec![program.as_ref().to_owned()])
    }

    /// Constructs a `Cmd` from a complete argv.
    ///
    /// An empty argv is representable but refuses to spawn.
    pub fn from_argv(argv: Vec<OsString>) -> Cmd {
        Cmd {
            argv,
            env: None,
            cwd: None,
            flags: 0,
            cpus: None,
            ignore_status: false,
        }
    }

    /// Appends `arg` to the argument list.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Cmd {
        self.argv.push(arg.as_ref().to_owned());
        self
    }

    /// Extends the argument list with `args`.
    pub fn args(mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> Cmd {
        self.argv
            .extend(args.into_iter().map(|x| x.as_ref().to_owned()));
        self
    }

    fn ensure_env(&mut self) -> &mut Vec<(OsString, OsString)> {
        self.env.get_or_insert_with(|| env::vars_os().collect())
    }

    /// Clears the environment of the subprocess.
    ///
    /// When this is invoked, the subprocess will not inherit the
    /// environment of this process.
    pub fn env_clear(mut self) -> Cmd {
        self.env = Some(vec![]);
        self
    }

    /// Sets an environment variable in the child process.
    ///
    /// If the same variable is set more than once, the last value is used.
    /// Other variables are inherited by default; call `env_clear` first if
    /// that is undesirable.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Cmd {
        self.ensure_env()
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    /// Removes an environment variable from the child process.
    pub fn env_remove(mut self, key: impl AsRef<OsStr>) -> Cmd {
        self.ensure_env().retain(|(k, _v)| k != key.as_ref());
        self
    }

    /// Specifies the working directory of the child process.
    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Cmd {
        self.cwd = Some(dir.as_ref().as_os_str().to_owned());
        self
    }

    /// Restricts the child to the given CPU indices.
    pub fn cpus(mut self, cpus: impl IntoIterator<Item = usize>) -> Cmd {
        self.cpus = Some(cpus.into_iter().collect());
        self
    }

    /// Sets raw spawn [`flags`] bits.
    pub fn flags(mut self, bits: u32) -> Cmd {
        self.flags |= bits;
        self
    }

    /// Spawn the child detached in its own session.
    pub fn detached(self) -> Cmd {
        self.flags(flags::DETACHED)
    }

    /// A non-zero exit of this command will not be reported as a failure.
    pub fn ignore_status(mut self) -> Cmd {
        self.ignore_status = true;
        self
    }

    /// Connect two commands stdout-to-stdin, like the shell's `|`.
    ///
    /// Equivalent to the `|` operator; present for symmetry with
    /// [`pipe_err`](Self::pipe_err).
    pub fn pipe(self, rhs: impl Into<CmdExpr>) -> CmdExpr {
        CmdExpr::from(self).pipe(rhs)
    }

    /// Connect this command's stderr to `rhs`'s stdin.
    pub fn pipe_err(self, rhs: impl Into<CmdExpr>) -> CmdExpr {
        CmdExpr::from(self).pipe_err(rhs)
    }

    /// Replace one stdio slot of this command; see [`CmdExpr::redirect`].
    pub fn redirect(self, fd: u32, what: impl Into<Redirectable>, readable: bool) -> CmdExpr {
        CmdExpr::from(self).redirect(fd, what, readable)
    }

    /// Feed the command's stdin from `what`.
    pub fn stdin_from(self, what: impl Into<Redirectable>) -> CmdExpr {
        CmdExpr::from(self).stdin_from(what)
    }

    /// Send the command's stdout to `what`.
    pub fn stdout_to(self, what: impl Into<Redirectable>) -> CmdExpr {
        CmdExpr::from(self).stdout_to(what)
    }

    /// Send the command's stderr to `what`.
    pub fn stderr_to(self, what: impl Into<Redirectable>) -> CmdExpr {
        CmdExpr::from(self).stderr_to(what)
    }

    pub(crate) fn argv(&self) -> &[OsString] {
        &self.argv
    }

    pub(crate) fn cwd_os(&self) -> Option<&OsStr> {
        self.cwd.as_deref()
    }

    pub(crate) fn flag_bits(&self) -> u32 {
        self.flags
    }

    pub(crate) fn cpu_list(&self) -> Option<&[usize]> {
        self.cpus.as_deref()
    }

    /// True if a non-zero exit should not count as failure.
    pub fn ignores_status(&self) -> bool {
        self.ignore_status
    }

    /// The child environment as `KEY=VALUE` entries, deduplicated with the
    /// last setting winning; `None` means inherit.
    pub(crate) fn format_env(&self) -> Option<Vec<OsString>> {
        let env = self.env.as_deref()?;
        let mut seen = HashSet::<&OsStr>::new();
        let mut formatted: Vec<_> = env
            .iter()
            .rev()
            .filter(|&(k, _)| seen.insert(k))
            .map(|(k, v)| {
                let mut fmt = k.clone();
                fmt.push("=");
                fmt.push(v);
                fmt
            })
            .collect();
        formatted.reverse();
        Some(formatted)
    }

    // used for Display and error reporting
    fn display_escape(s: &str) -> Cow<'_, str> {
        fn nice_char(c: char) -> bool {
            match c {
                '-' | '_' | '.' | ',' | '/' => true,
                c if c.is_ascii_alphanumeric() => true,
                _ => false,
            }
        }
        if !s.chars().all(nice_char) {
            Cow::Owned(format!("'{}'", s.replace("'", r#"'\''"#)))
        } else {
            Cow::Borrowed(s)
        }
    }

    /// Show the command as a command-line string quoted in the Unix style.
    pub fn to_cmdline_lossy(&self) -> String {
        let mut out = String::new();
        if let Some(cmd_env) = &self.env {
            let current: Vec<_> = env::vars_os().collect();
            let current_map: HashMap<_, _> = current.iter().map(|(x, y)| (x, y)).collect();
            for (k, v) in cmd_env {
                if current_map.get(k) == Some(&v) {
                    continue;
                }
                out.push_str(&Cmd::display_escape(&k.to_string_lossy()));
                out.push('=');
                out.push_str(&Cmd::display_escape(&v.to_string_lossy()));
                out.push(' ');
            }
            let cmd_env: HashMap<_, _> = cmd_env.iter().map(|(k, v)| (k, v)).collect();
            for (k, _) in current {
                if !cmd_env.contains_key(&k) {
                    out.push_str(&Cmd::display_escape(&k.to_string_lossy()));
                    out.push('=');
                    out.push(' ');
                }
            }
        }
        let mut first = true;
        for arg in &self.argv {
            if !first {
                out.push(' ');
            }
            first = false;
            out.push_str(&Cmd::display_escape(&arg.to_string_lossy()));
        }
        out
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cmdline_lossy())
    }
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cmd {{ {} }}", self.to_cmdline_lossy())
    }
}

impl<R: Into<CmdExpr>> BitOr<R> for Cmd {
    type Output = CmdExpr;

    /// `a | b`: connect stdout of `a` to stdin of `b`.
    fn bitor(self, rhs: R) -> CmdExpr {
        CmdExpr::from(self) | rhs
    }
}

impl<R: Into<CmdExpr>> BitAnd<R> for Cmd {
    type Output = CmdExpr;

    /// `a & b`: spawn both concurrently with the same stdio.
    fn bitand(self, rhs: R) -> CmdExpr {
        CmdExpr::from(self) & rhs
    }
}

/// A command expression: single commands composed with pipes, stderr
/// pipes, concurrent groups, and per-slot redirections.
///
/// Built with the `|` and `&` operators and the [`pipe_err`] and
/// [`redirect`] family of methods, then spawned as a unit.  Processes are
/// spawned left-to-right and appear in the resulting
/// [`ProcessChain`](crate::ProcessChain) in that order.
///
/// [`pipe_err`]: Self::pipe_err
/// [`redirect`]: Self::redirect
#[must_use]
pub enum CmdExpr {
    /// One external command.
    Single(Cmd),
    /// Left's stdout feeds right's stdin.
    Pipe(Box<CmdExpr>, Box<CmdExpr>),
    /// Left's stderr feeds right's stdin.
    ErrPipe(Box<CmdExpr>, Box<CmdExpr>),
    /// Both sides run concurrently with the same stdio.
    ///
    /// Each child receives its own duplicate of the same descriptors;
    /// concurrent writes to a shared output interleave at the kernel's
    /// discretion.
    Seq(Box<CmdExpr>, Box<CmdExpr>),
    /// `inner` with one stdio slot replaced.
    Redirect {
        /// Child fd number of the slot to replace (0 = stdin, 1 = stdout,
        /// 2 = stderr; higher fds extend the stdio table).
        fd: u32,
        /// What to connect to the slot.
        what: Redirectable,
        /// Whether the child reads from the slot.
        readable: bool,
        /// The expression whose slot is replaced.
        inner: Box<CmdExpr>,
    },
}

impl CmdExpr {
    /// Connect `self`'s stdout to `rhs`'s stdin; the operator form is `|`.
    pub fn pipe(self, rhs: impl Into<CmdExpr>) -> CmdExpr {
        CmdExpr::Pipe(Box::new(self), Box::new(rhs.into()))
    }

    /// Connect `self`'s stderr to `rhs`'s stdin.
    pub fn pipe_err(self, rhs: impl Into<CmdExpr>) -> CmdExpr {
        CmdExpr::ErrPipe(Box::new(self), Box::new(rhs.into()))
    }

    /// Run `self` and `rhs` concurrently with the same stdio; the operator
    /// form is `&`.
    pub fn and(self, rhs: impl Into<CmdExpr>) -> CmdExpr {
        CmdExpr::Seq(Box::new(self), Box::new(rhs.into()))
    }

    /// Replace stdio slot `fd` of the expression with `what`.
    ///
    /// `readable` says whether the child reads from the slot (true for
    /// stdin-like fds).  Slot numbers are the child's fd numbers.
    pub fn redirect(self, fd: u32, what: impl Into<Redirectable>, readable: bool) -> CmdExpr {
        CmdExpr::Redirect {
            fd,
            what: what.into(),
            readable,
            inner: Box::new(self),
        }
    }

    /// Feed the expression's stdin from `what`.
    pub fn stdin_from(self, what: impl Into<Redirectable>) -> CmdExpr {
        self.redirect(0, what, true)
    }

    /// Send the expression's stdout to `what`.
    pub fn stdout_to(self, what: impl Into<Redirectable>) -> CmdExpr {
        self.redirect(1, what, false)
    }

    /// Send the expression's stderr to `what`.
    pub fn stderr_to(self, what: impl Into<Redirectable>) -> CmdExpr {
        self.redirect(2, what, false)
    }
}

impl From<Cmd> for CmdExpr {
    fn from(cmd: Cmd) -> CmdExpr {
        CmdExpr::Single(cmd)
    }
}

impl<R: Into<CmdExpr>> BitOr<R> for CmdExpr {
    type Output = CmdExpr;

    fn bitor(self, rhs: R) -> CmdExpr {
        self.pipe(rhs)
    }
}

impl<R: Into<CmdExpr>> BitAnd<R> for CmdExpr {
    type Output = CmdExpr;

    fn bitand(self, rhs: R) -> CmdExpr {
        self.and(rhs)
    }
}

impl fmt::Display for CmdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmdExpr::Single(cmd) => fmt::Display::fmt(cmd, f),
            CmdExpr::Pipe(a, b) => write!(f, "{} | {}", a, b),
            CmdExpr::ErrPipe(a, b) => write!(f, "{} .| {}", a, b),
            CmdExpr::Seq(a, b) => write!(f, "{} & {}", a, b),
            CmdExpr::Redirect {
                fd,
                what,
                readable,
                inner,
            } => {
                let dir = if *readable { "<" } else { ">" };
                write!(f, "{} {}{} {:?}", inner, fd, dir, what)
            }
        }
    }
}

impl fmt::Debug for CmdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CmdExpr {{ {} }}", self)
    }
}
