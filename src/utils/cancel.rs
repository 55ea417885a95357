//! Caller-supplied cancellation and deadlines
//!
//! Every long-running step (capture, transforms, uploads, downloads) takes a
//! `CancelToken` and checks it between chunks of work.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Size of the buffer used by cancellable copies
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Why an operation stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Cancelled {
    #[error("operation cancelled by caller")]
    ByCaller,

    #[error("operation deadline exceeded")]
    DeadlineExceeded,
}

/// Cloneable cancellation handle with an optional deadline
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// Token that is only cancelled explicitly
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that expires at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// Token that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Derive a token sharing this token's cancel flag, with a tighter deadline
    /// if `timeout` ends before the current one.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            flag: Arc::clone(&self.flag),
            deadline: Some(deadline),
        }
    }

    /// Request cancellation; every clone observes it
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.check().is_err()
    }

    /// Return an error if the token was cancelled or its deadline passed
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.flag.load(Ordering::SeqCst) {
            return Err(Cancelled::ByCaller);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Cancelled::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Clamp a timeout to the time left on this token
    pub fn clamp(&self, timeout: Duration) -> Duration {
        match self.remaining() {
            Some(left) => left.min(timeout),
            None => timeout,
        }
    }
}

/// Failure of a cancellable stream copy
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Copy `reader` into `writer`, checking `cancel` before every chunk
pub fn copy_cancellable<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    cancel: &CancelToken,
) -> Result<u64, StreamError> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        cancel.check()?;
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }

    writer.flush()?;
    Ok(total)
}

/// Reader adapter that fails once the token is cancelled.
///
/// Used for request bodies handed to the HTTP client, where the copy loop is
/// not under our control.
pub struct CancellableReader<R> {
    inner: R,
    cancel: CancelToken,
}

impl<R> CancellableReader<R> {
    pub fn new(inner: R, cancel: CancelToken) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Err(reason) = self.cancel.check() {
            return Err(io::Error::new(io::ErrorKind::Other, reason));
        }
        self.inner.read(buf)
    }
}
