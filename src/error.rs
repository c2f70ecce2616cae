//! Error classification per the two-tier model: recoverable errors are
//! logged and the caller continues; unrecoverable ones go through
//! [`abort`], which defaults to logging + process termination but can be
//! overridden (e.g. by tests).

use std::sync::atomic::{AtomicUsize, Ordering};

use nix;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "short read/write on shared tracebuffer state: {}", inner)]
    ShortIo { inner: String },
    #[fail(display = "mmap failed: {}", inner)]
    Mmap { inner: ::std::io::Error },
    #[fail(display = "tracebuffer file header is not valid: {}", inner)]
    BadHeader { inner: String },
    #[fail(display = "mutex acquisition timed out")]
    MutexTimeout,
    #[fail(display = "mutex is in a deadlocked state")]
    MutexDeadlocked,
    #[fail(display = "mutex error: {}", inner)]
    MutexError { inner: String },
    #[fail(display = "entry too large for ring buffer body (u16 max): {} bytes", size)]
    EntryTooLarge { size: usize },
    #[fail(display = "in_file_offset was not static (site not yet resolved)")]
    UnresolvedSite,
    #[fail(display = "I/O error: {}", inner)]
    Io { inner: ::std::io::Error },
    #[fail(display = "nix error: {}", inner)]
    Nix { inner: nix::Error },
}

impl From<::std::io::Error> for Error {
    fn from(inner: ::std::io::Error) -> Self {
        Error::Io { inner }
    }
}

impl From<nix::Error> for Error {
    fn from(inner: nix::Error) -> Self {
        Error::Nix { inner }
    }
}

/// Logs a recoverable error and lets the caller continue. Tracepoints that
/// hit one of these simply drop the entry in question.
#[macro_export]
macro_rules! recoverable {
    ($($arg:tt)*) => {
        ::log::error!(target: "clltk_trace::recoverable", $($arg)*);
    };
}

static ABORT_HOOK: AtomicUsize = AtomicUsize::new(0);

type AbortFn = fn(&str) -> !;

fn default_abort(msg: &str) -> ! {
    log::error!(target: "clltk_trace::unrecoverable", "{}", msg);
    std::process::abort();
}

/// Overrides the process-abort behavior invoked by [`abort`]. Intended for
/// tests that need to observe an unrecoverable condition without actually
/// terminating the test binary; the override function must itself diverge.
pub fn set_abort_hook(hook: AbortFn) {
    ABORT_HOOK.store(hook as usize, Ordering::SeqCst);
}

/// Logs an unrecoverable error and terminates the process (or calls the
/// overridden hook). Used for conditions the spec classifies as
/// unrecoverable: short pread/pwrite on shared state, mmap failure, a
/// tracebuffer file that fails header validation, null-pointer invariant
/// violations inside the library itself.
pub fn abort(msg: &str) -> ! {
    let hook = ABORT_HOOK.load(Ordering::SeqCst);
    if hook == 0 {
        default_abort(msg)
    } else {
        let f: AbortFn = unsafe { std::mem::transmute(hook) };
        f(msg)
    }
}
