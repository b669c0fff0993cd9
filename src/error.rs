use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::result;

/// A command that exited unsuccessfully, as reported by [`Error::Failed`].
///
/// Carries the displayable command line along with the decoded exit
/// information.  Exactly one of `exit_code` and `term_signal` is nonzero
/// for a failed command.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FailedCommand {
    /// Displayable form of the command.
    pub cmd: String,
    /// The child's exit code, 0 if it was killed by a signal.
    pub exit_code: i64,
    /// The signal that terminated the child, 0 if it exited normally.
    pub term_signal: i32,
}

impl fmt::Display for FailedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.term_signal > 0 {
            write!(f, "[{}] killed by signal {}", self.cmd, self.term_signal)
        } else {
            write!(f, "[{}] exited with {}", self.cmd, self.exit_code)
        }
    }
}

/// Error type of the crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A request that cannot be honored, such as an empty argv or a
    /// contradictory stream-mode combination.
    InvalidArgument(String),
    /// The OS refused to start the process.  `code` is the negated errno,
    /// matching the "could not start" range of reported exit codes.
    Spawn {
        /// Negated OS error code.
        code: i32,
        /// Displayable form of the command that failed to start.
        cmd: String,
    },
    /// Delivering a signal failed with something other than ESRCH.
    Kill {
        /// Raw OS error code.
        code: i32,
    },
    /// The process handle is gone; no PID can be reported.
    Pid,
    /// One or more commands of a chain exited unsuccessfully without
    /// `ignore_status` set, in spawn order.
    Failed(Vec<FailedCommand>),
    /// A background stream forwarder failed; surfaces from whoever joins
    /// the forwarder, typically `wait`.
    IoForward(io::Error),
    /// A scoped consumer returned without draining the process's output.
    Pipe,
    /// Other I/O error during setup or communication.
    Io(io::Error),
}

/// Result returned by crate functions.
pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Error {
        Error::InvalidArgument(msg.into())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::Spawn { code, cmd } => {
                let os = io::Error::from_raw_os_error(-code);
                write!(f, "could not spawn [{}]: {}", cmd, os)
            }
            Error::Kill { code } => {
                write!(f, "kill failed: {}", io::Error::from_raw_os_error(*code))
            }
            Error::Pid => write!(f, "process handle is gone"),
            Error::Failed(procs) => {
                write!(f, "process failed: ")?;
                for (i, p) in procs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                Ok(())
            }
            Error::IoForward(err) => write!(f, "stream forwarder failed: {}", err),
            Error::Pipe => write!(f, "process output not consumed"),
            Error::Io(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::IoForward(err) | Error::Io(err) => Some(err),
            _ => None,
        }
    }
}
