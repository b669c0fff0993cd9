use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use log::warn;

use crate::error::{Error, Result};
use crate::pipe;

/// One stdio slot as handed to the spawn wire call.
///
/// The numeric tags match the wire format: 0 for an unconnected slot,
/// 2 for a native file descriptor, 4 for a loop-owned pipe end.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum SpawnSlot {
    /// Nothing attached; the child gets the null device.
    Null,
    /// A native descriptor the child inherits via `dup2`.
    Fd(RawFd),
    /// The child end of a pipe created during setup.
    Stream(RawFd),
}

impl SpawnSlot {
    pub(crate) fn tag(self) -> i32 {
        match self {
            SpawnSlot::Null => 0,
            SpawnSlot::Fd(..) => 2,
            SpawnSlot::Stream(..) => 4,
        }
    }

    pub(crate) fn value(self) -> usize {
        match self {
            SpawnSlot::Null => 0,
            SpawnSlot::Fd(fd) | SpawnSlot::Stream(fd) => fd as usize,
        }
    }
}

/// A slot plus the forwarder whose completion gates `wait` on this slot.
///
/// Cloning shares the forwarder handle; the composer copies whole slot
/// vectors when lowering pipeline nodes, and every process spawned with a
/// forwarded slot collects the same forwarder into its sync set.
#[derive(Clone)]
pub(crate) struct StdioSlot {
    pub kind: SpawnSlot,
    pub sync: Option<Forwarder>,
}

impl StdioSlot {
    pub(crate) fn null() -> StdioSlot {
        StdioSlot {
            kind: SpawnSlot::Null,
            sync: None,
        }
    }

    pub(crate) fn fd(fd: RawFd) -> StdioSlot {
        StdioSlot {
            kind: SpawnSlot::Fd(fd),
            sync: None,
        }
    }

    pub(crate) fn stream(end: &File) -> StdioSlot {
        StdioSlot {
            kind: SpawnSlot::Stream(end.as_raw_fd()),
            sync: None,
        }
    }
}

impl fmt::Debug for StdioSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if self.sync.is_some() {
            write!(f, "+sync")?;
        }
        Ok(())
    }
}

/// An initially unconnected pipe endpoint.
///
/// Pass it in a [`Redirectable::Endpoint`]; stream setup creates the pipe,
/// hands one end to the child, and links the parent's end here.  After the
/// command has started, [`take`](Self::take) yields the parent end as an
/// ordinary `File`.
///
/// Cloning shares the endpoint.
#[derive(Clone, Default)]
pub struct PipeEndpoint(Arc<Mutex<Option<File>>>);

impl PipeEndpoint {
    /// Creates an unlinked endpoint.
    pub fn new() -> PipeEndpoint {
        PipeEndpoint::default()
    }

    /// Takes the linked parent-side pipe end, if setup has linked one.
    pub fn take(&self) -> Option<File> {
        self.0.lock().unwrap().take()
    }

    /// True once setup has linked a pipe end and it has not been taken.
    pub fn is_linked(&self) -> bool {
        self.0.lock().unwrap().is_some()
    }

    fn link(&self, end: File) {
        *self.0.lock().unwrap() = Some(end);
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.0.lock().unwrap().as_ref().map(|f| f.as_raw_fd())
    }
}

/// A bidirectional pipe object: a read and a write endpoint linked as one
/// OS pipe the first time a spawn uses either side.
///
/// Unlike a bare [`PipeEndpoint`], both ends belong to the caller: stream
/// setup hands the child a duplicate of the matching side and closes
/// nothing afterwards.  That makes it possible to wire two independently
/// started commands together by hand, passing the write side to one and
/// the read side to the other.  Drop (or [`take`](PipeEndpoint::take)) the
/// caller's copies once both commands run, or EOF never reaches the
/// reader.
#[derive(Clone, Default, Debug)]
pub struct PipePair {
    /// The read side.
    pub read: PipeEndpoint,
    /// The write side.
    pub write: PipeEndpoint,
}

impl PipePair {
    /// Creates an unlinked pipe pair.
    pub fn new() -> PipePair {
        PipePair::default()
    }
}

impl fmt::Debug for PipeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0.lock().unwrap() {
            Some(file) => write!(f, "PipeEndpoint(fd {})", file.as_raw_fd()),
            None => write!(f, "PipeEndpoint(unlinked)"),
        }
    }
}

/// What to connect to one standard stream of a child.
pub enum Redirectable {
    /// The null device.
    Null,
    /// An existing OS file descriptor, borrowed.  `Fd(0)`..`Fd(2)` inherit
    /// the parent's standard streams.
    Fd(RawFd),
    /// An open file; the child sees its descriptor directly.
    File(File),
    /// A file to open at spawn time: read-only for an input slot, and
    /// write-create with either truncate or append for an output slot.
    Path {
        /// File to open.
        path: PathBuf,
        /// Append instead of truncating (output slots only).
        append: bool,
    },
    /// A pipe endpoint to be linked by setup; the parent keeps one end.
    Endpoint(PipeEndpoint),
    /// A bidirectional pipe object; the child gets the side matching the
    /// slot direction and the caller keeps both ends.
    Pipe(PipePair),
    /// An arbitrary in-process source feeding the child's input slot
    /// through a background forwarder.
    ReadStream(Box<dyn Read + Send + 'static>),
    /// An arbitrary in-process sink receiving the child's output slot
    /// through a background forwarder.
    WriteStream(Box<dyn Write + Send + 'static>),
}

impl Redirectable {
    /// Convenience constructor for [`Redirectable::Path`] with truncation.
    pub fn path(path: impl Into<PathBuf>) -> Redirectable {
        Redirectable::Path {
            path: path.into(),
            append: false,
        }
    }

    /// Convenience constructor for [`Redirectable::Path`] with append.
    pub fn append(path: impl Into<PathBuf>) -> Redirectable {
        Redirectable::Path {
            path: path.into(),
            append: true,
        }
    }
}

impl From<File> for Redirectable {
    fn from(f: File) -> Redirectable {
        Redirectable::File(f)
    }
}

impl From<PipeEndpoint> for Redirectable {
    fn from(ep: PipeEndpoint) -> Redirectable {
        Redirectable::Endpoint(ep)
    }
}

impl fmt::Debug for Redirectable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Redirectable::Null => write!(f, "Null"),
            Redirectable::Fd(fd) => write!(f, "Fd({})", fd),
            Redirectable::File(file) => write!(f, "File(fd {})", file.as_raw_fd()),
            Redirectable::Path { path, append } => {
                write!(f, "Path({:?}, append={})", path, append)
            }
            Redirectable::Endpoint(ep) => fmt::Debug::fmt(ep, f),
            Redirectable::Pipe(pair) => fmt::Debug::fmt(pair, f),
            Redirectable::ReadStream(..) => write!(f, "ReadStream(..)"),
            Redirectable::WriteStream(..) => write!(f, "WriteStream(..)"),
        }
    }
}

/// A prepared slot: the wire value plus the child-side resource that must
/// stay alive until the spawn call and be closed afterwards.
///
/// Dropping a `Prepared` closes `owned`, which is exactly the
/// close-after-spawn obligation; a setup that fails partway therefore
/// releases everything it acquired on unwind.
pub(crate) struct Prepared {
    pub slot: StdioSlot,
    pub owned: Option<File>,
    /// Keeps a borrowed pipe pair alive across the spawn call.
    #[allow(dead_code)]
    keep_alive: Option<PipePair>,
}

impl Prepared {
    fn plain(slot: StdioSlot) -> Prepared {
        Prepared {
            slot,
            owned: None,
            keep_alive: None,
        }
    }
}

/// Convert one [`Redirectable`] into a spawn slot.
///
/// `child_readable` is true for the child's input slots (fd 0), false for
/// output slots.  See the variant rules on [`Redirectable`].
pub(crate) fn prepare(what: Redirectable, child_readable: bool) -> Result<Prepared> {
    match what {
        Redirectable::Null => Ok(Prepared::plain(StdioSlot::null())),
        Redirectable::Fd(fd) => {
            if fd < 0 {
                return Err(Error::invalid("negative file descriptor"));
            }
            Ok(Prepared::plain(StdioSlot::fd(fd)))
        }
        Redirectable::File(file) => Ok(Prepared {
            slot: StdioSlot::fd(file.as_raw_fd()),
            owned: Some(file),
            keep_alive: None,
        }),
        Redirectable::Path { path, append } => {
            let file = if child_readable {
                File::open(&path)?
            } else {
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .append(append)
                    .truncate(!append)
                    .mode(0o644)
                    .open(&path)?
            };
            Ok(Prepared {
                slot: StdioSlot::fd(file.as_raw_fd()),
                owned: Some(file),
                keep_alive: None,
            })
        }
        Redirectable::Pipe(pair) => {
            if !pair.read.is_linked() && !pair.write.is_linked() {
                let (read_end, write_end) = pipe::link_pipe(false, false)?;
                pair.read.link(read_end);
                pair.write.link(write_end);
            }
            let side = if child_readable { &pair.read } else { &pair.write };
            let Some(fd) = side.raw_fd() else {
                return Err(Error::invalid("pipe end already taken"));
            };
            // the caller owns both ends; nothing to close after spawn,
            // but the pair must outlive the spawn call
            Ok(Prepared {
                slot: StdioSlot::fd(fd),
                owned: None,
                keep_alive: Some(pair),
            })
        }
        Redirectable::Endpoint(ep) => {
            let (read_end, write_end) = pipe::link_pipe(false, false)?;
            let (child_end, parent_end) = if child_readable {
                (read_end, write_end)
            } else {
                (write_end, read_end)
            };
            let slot = StdioSlot::stream(&child_end);
            ep.link(parent_end);
            Ok(Prepared {
                slot,
                owned: Some(child_end),
                keep_alive: None,
            })
        }
        Redirectable::ReadStream(source) => {
            if !child_readable {
                return Err(Error::invalid("readable stream attached to an output slot"));
            }
            let (read_end, write_end) = pipe::link_pipe(false, false)?;
            let task = Forwarder::feed(source, write_end);
            Ok(Prepared {
                slot: StdioSlot {
                    kind: SpawnSlot::Stream(read_end.as_raw_fd()),
                    sync: Some(task),
                },
                owned: Some(read_end),
                keep_alive: None,
            })
        }
        Redirectable::WriteStream(sink) => {
            if child_readable {
                return Err(Error::invalid("writable stream attached to an input slot"));
            }
            let (read_end, write_end) = pipe::link_pipe(false, false)?;
            let task = Forwarder::drain(read_end, sink);
            Ok(Prepared {
                slot: StdioSlot {
                    kind: SpawnSlot::Stream(write_end.as_raw_fd()),
                    sync: Some(task),
                },
                owned: Some(write_end),
                keep_alive: None,
            })
        }
    }
}

/// Prepare a whole stdio vector.  Slot 0 is the child's input.
///
/// On error every already-prepared slot is released before the error
/// escapes (the `Prepared` values built so far unwind).
pub(crate) fn prepare_all(stdios: Vec<Redirectable>) -> Result<Vec<Prepared>> {
    stdios
        .into_iter()
        .enumerate()
        .map(|(i, r)| prepare(r, i == 0))
        .collect()
}

enum ForwarderState {
    Running(thread::JoinHandle<io::Result<u64>>),
    Done(Option<ForwarderFailure>),
}

/// Recorded outcome of a failed forwarder, replayable to every joiner.
struct ForwarderFailure {
    /// `None` for failures with no underlying I/O error, e.g. a panic.
    kind: Option<ErrorKind>,
    msg: String,
}

impl ForwarderFailure {
    fn to_io_error(&self) -> io::Error {
        match self.kind {
            Some(kind) => io::Error::new(kind, self.msg.clone()),
            None => io::Error::other(self.msg.clone()),
        }
    }
}

/// Handle to a background task copying bytes between an in-process stream
/// and one end of an OS pipe.
///
/// The task runs until EOF on its input side, then closes its pipe end.
/// It is joinable any number of times from any clone; the first join
/// blocks, subsequent joins report the recorded outcome.
#[derive(Clone)]
pub struct Forwarder(Arc<Mutex<ForwarderState>>);

impl Forwarder {
    /// Copy from an in-process source into the write end of a pipe
    /// (the child's input).  Closing the write end on completion delivers
    /// EOF to the child.
    fn feed(mut source: Box<dyn Read + Send>, mut write_end: File) -> Forwarder {
        Forwarder::spawn(move || {
            match io::copy(&mut source, &mut write_end) {
                Ok(n) => Ok(n),
                // the child stopped reading early; that is its business
                Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(0),
                Err(e) => Err(e),
            }
        })
    }

    /// Copy from the read end of a pipe (the child's output) into an
    /// in-process sink, flushing the sink at EOF.
    fn drain(mut read_end: File, mut sink: Box<dyn Write + Send>) -> Forwarder {
        Forwarder::spawn(move || {
            let n = io::copy(&mut read_end, &mut sink)?;
            sink.flush()?;
            Ok(n)
        })
    }

    fn spawn(body: impl FnOnce() -> io::Result<u64> + Send + 'static) -> Forwarder {
        let handle = thread::Builder::new()
            .name("procpipe-fwd".into())
            .spawn(move || {
                let result = body();
                if let Err(e) = &result {
                    warn!("stream forwarder failed: {}", e);
                }
                result
            })
            .expect("spawning forwarder thread");
        Forwarder(Arc::new(Mutex::new(ForwarderState::Running(handle))))
    }

    /// Wait for the forwarder to finish, reporting its outcome.
    pub fn join(&self) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        if let ForwarderState::Running(..) = *state {
            let ForwarderState::Running(handle) =
                std::mem::replace(&mut *state, ForwarderState::Done(None))
            else {
                unreachable!();
            };
            let outcome = match handle.join() {
                Ok(Ok(..)) => None,
                Ok(Err(e)) => Some(ForwarderFailure {
                    kind: Some(e.kind()),
                    msg: e.to_string(),
                }),
                Err(..) => Some(ForwarderFailure {
                    kind: None,
                    msg: "forwarder panicked".to_string(),
                }),
            };
            *state = ForwarderState::Done(outcome);
        }
        match &*state {
            ForwarderState::Done(None) => Ok(()),
            ForwarderState::Done(Some(failure)) => Err(Error::IoForward(failure.to_io_error())),
            ForwarderState::Running(..) => unreachable!(),
        }
    }
}

impl fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0.lock().unwrap() {
            ForwarderState::Running(..) => write!(f, "Forwarder(running)"),
            ForwarderState::Done(None) => write!(f, "Forwarder(done)"),
            ForwarderState::Done(Some(..)) => write!(f, "Forwarder(failed)"),
        }
    }
}

/// Translate prepared slots to the wire tuples expected by the reactor.
pub(crate) fn wire_stdio(slots: &[StdioSlot]) -> Vec<(i32, usize)> {
    slots.iter().map(|s| (s.kind.tag(), s.kind.value())).collect()
}

/// Collect the forwarders referenced by a slot vector, in slot order.
pub(crate) fn collect_sync(slots: &[StdioSlot]) -> Vec<Forwarder> {
    slots.iter().filter_map(|s| s.sync.clone()).collect()
}

/// Default stdio for a foreground run: the parent's standard streams.
pub(crate) fn inherit_defaults() -> Vec<Redirectable> {
    vec![
        Redirectable::Fd(0),
        Redirectable::Fd(1),
        Redirectable::Fd(2),
    ]
}

/// Default stdio for a background start: everything swallowed.
pub(crate) fn swallow_defaults() -> Vec<Redirectable> {
    vec![Redirectable::Null, Redirectable::Null, Redirectable::Null]
}
