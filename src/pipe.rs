use std::fs::File;
use std::io;

use crate::posix;

/// Create a unidirectional OS pipe, returning `(read_end, write_end)`.
///
/// Both ends are created close-on-exec; handing an end to a child happens
/// via `dup2` at exec time, which clears the flag on the child's copy.
/// The nonblocking bits apply to the respective end only.
pub(crate) fn link_pipe(read_nonblock: bool, write_nonblock: bool) -> io::Result<(File, File)> {
    let (read_end, write_end) = posix::pipe()?;
    posix::set_cloexec(&read_end)?;
    posix::set_cloexec(&write_end)?;
    if read_nonblock {
        posix::set_nonblocking(&read_end, true)?;
    }
    if write_nonblock {
        posix::set_nonblocking(&write_end, true)?;
    }
    Ok((read_end, write_end))
}

/// Close a pipe end immediately.
///
/// Closing one end while the other is in use by a spawned child is fine
/// and expected; the child owns a `dup2`ed copy.  Ends are owned values,
/// so closing twice cannot be expressed.
pub(crate) fn close_sync(end: File) {
    drop(end);
}
