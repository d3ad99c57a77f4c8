use std::io;

use thiserror::Error;

/// Errors produced while registering or running log streams.
#[derive(Debug, Error)]
pub enum Error {
    /// The OS refused to allocate a pipe for a new stream.
    #[error("unable to allocate pipe for stream '{tag}': {source}")]
    Pipe {
        tag: String,
        #[source]
        source: io::Error,
    },

    /// Registration or a second `run` was attempted after `run` started.
    #[error("log pipe is already running")]
    AlreadyStarted,

    /// The reader thread of a stream could not be spawned.
    #[error("unable to spawn reader thread for stream '{tag}': {source}")]
    Spawn {
        tag: String,
        #[source]
        source: io::Error,
    },

    /// The run was cancelled before every stream reached end of input.
    #[error("log pipe run cancelled")]
    Cancelled,

    /// A single line grew past the configured maximum.
    #[error("line from stream '{tag}' exceeds {limit} bytes")]
    LineTooLong { tag: String, limit: usize },

    /// Reading from the pipe failed.
    #[error("read from stream '{tag}' failed: {source}")]
    Read {
        tag: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Returns true when `err` reports I/O against a pipe whose other end (or the
/// handle itself) has already been closed.
///
/// Readers see this when a stream is closed while a read is in flight, and
/// producers see it when writing to a [`StreamWriter`](crate::StreamWriter)
/// after [`LogPipe::close`](crate::LogPipe::close).
pub fn is_pipe_closed(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected => true,
        _ => err.raw_os_error() == Some(EBADF),
    }
}

#[cfg(unix)]
const EBADF: i32 = 9;
#[cfg(windows)]
const EBADF: i32 = 6; // ERROR_INVALID_HANDLE
#[cfg(not(any(unix, windows)))]
const EBADF: i32 = -1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_pipe_closed() {
        assert!(is_pipe_closed(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_pipe_closed(&io::Error::from(io::ErrorKind::NotConnected)));
        assert!(is_pipe_closed(&io::Error::from_raw_os_error(EBADF)));
        assert!(!is_pipe_closed(&io::Error::from(io::ErrorKind::InvalidData)));
        assert!(!is_pipe_closed(&io::Error::other("boom")));
    }

    #[test]
    fn test_error_display() {
        let err = Error::LineTooLong {
            tag: "worker:stderr".into(),
            limit: 16,
        };
        assert_eq!(
            err.to_string(),
            "line from stream 'worker:stderr' exceeds 16 bytes"
        );
        assert!(Error::Cancelled.is_cancelled());
        assert!(!err.is_cancelled());
    }
}
