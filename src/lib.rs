//! # logpipe
//! Interleave the output of child processes (or any other byte producer) into
//! your existing logs.
//!
//! A [`LogPipe`] hands out one [`StreamWriter`] per registered stream. Whatever
//! is written there is split into lines, and every line reaches the stream's
//! callback rendered as `[<tag>] <line>`. [`LogPipe::run`] reads all streams
//! concurrently until they end, one of them fails, or the run is cancelled.
//!
//! ## Usage
//! ```toml
//! // Cargo.toml
//! ...
//! [dependencies]
//! logpipe = "0.1.0"
//! ```
//!
//! ```rust
//! use std::io::Write;
//! use std::sync::{Arc, Mutex};
//! use logpipe::{CancellationToken, LogPipe};
//!
//! let lines = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&lines);
//!
//! let mut pipe = LogPipe::new().with_tag("test:stdout");
//! let mut stdout = pipe.must_add(move |args| sink.lock().unwrap().push(args.to_string()));
//!
//! writeln!(stdout, "alpha").unwrap();
//! writeln!(stdout, "beta").unwrap();
//! drop(stdout); // end of input
//!
//! pipe.run(&CancellationToken::new()).unwrap();
//! assert_eq!(*lines.lock().unwrap(), ["[test:stdout] alpha", "[test:stdout] beta"]);
//! ```
//!
//! ## Child processes
//! Hand the writers to [`std::process::Command`] and route the lines into the
//! `log` facade:
//!
//! ```rust,no_run
//! use std::process::Command;
//! use logpipe::{CancellationToken, LogPipe, log_func};
//!
//! let mut pipe = LogPipe::new();
//! let stdout = pipe.must_add_tagged("make:stdout", log_func(log::Level::Info));
//! let stderr = pipe.must_add_tagged("make:stderr", log_func(log::Level::Warn));
//!
//! let mut child = Command::new("make")
//!     .stdout(stdout.into_stdio()?)
//!     .stderr(stderr.into_stdio()?)
//!     .spawn()?;
//!
//! std::thread::scope(|s| {
//!     let run = s.spawn(|| pipe.run(&CancellationToken::new()));
//!     child.wait()?;
//!     run.join().expect("log pipe panicked")?;
//!     Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
//! })?;
//! # Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
//! ```
//!
//! ## Shutdown
//! [`LogPipe::close`] closes every stream: lines not yet read are dropped,
//! later writes fail, and the streams' runs return `Ok(())`. Cancelling the
//! token given to [`LogPipe::run`] makes it return [`Error::Cancelled`] instead.
//!
//! The longest accepted line defaults to 64 KiB and can be changed with the
//! `LOGPIPE_MAX_LINE_BYTES` environment variable or [`LogPipe::with_max_line_len`].

mod config;
mod error;
mod scanner;
mod stream;
mod utils;

use std::{
    fmt,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

pub use config::{DEFAULT_MAX_LINE_BYTES, LOGPIPE_CONFIG, LogPipeConfig};
pub use error::{Error, is_pipe_closed};
pub use stream::{LogFunc, StreamWriter};
pub use tokio_util::sync::CancellationToken;
pub use utils::{log_func, stderr_func, stdout_func};

use stream::{LogStream, lock};

/// Tag used when neither the stream nor the pipe has one.
pub const DEFAULT_TAG: &str = "logpipe";

/// Dispatcher routing several output streams into line callbacks.
///
/// The default value is ready to use. Register every stream before calling
/// [`LogPipe::run`]; registration afterwards fails with [`Error::AlreadyStarted`].
#[derive(Default)]
pub struct LogPipe {
    tag: Option<String>,
    max_line_len: Option<usize>,
    streams: Vec<LogStream>,
    started: AtomicBool,
}

impl LogPipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the tag used for streams registered without one.
    pub fn with_tag(self, tag: &str) -> Self {
        Self {
            tag: Some(tag.into()),
            ..self
        }
    }

    /// Sets the longest accepted line, in bytes, for streams registered afterwards.
    pub fn with_max_line_len(self, max_line_len: usize) -> Self {
        Self {
            max_line_len: Some(max_line_len),
            ..self
        }
    }

    /// Default tag of this pipe.
    pub fn tag(&self) -> &str {
        match self.tag.as_deref() {
            Some(tag) if !tag.is_empty() => tag,
            _ => DEFAULT_TAG,
        }
    }

    fn max_line_len(&self) -> usize {
        self.max_line_len.unwrap_or(LOGPIPE_CONFIG.MAX_LINE_BYTES)
    }

    /// Tags of the registered streams, in registration order.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.streams.iter().map(LogStream::tag)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Registers a stream tagged with the pipe's default tag.
    pub fn add<F>(&mut self, log_func: F) -> Result<StreamWriter, Error>
    where
        F: FnMut(fmt::Arguments<'_>) + Send + 'static,
    {
        self.add_tagged("", log_func)
    }

    /// Registers a stream and returns the writer feeding it.
    /// An empty `tag` falls back to the pipe's default tag.
    pub fn add_tagged<F>(&mut self, tag: &str, log_func: F) -> Result<StreamWriter, Error>
    where
        F: FnMut(fmt::Arguments<'_>) + Send + 'static,
    {
        let tag = if tag.is_empty() { self.tag() } else { tag };
        if self.started.load(Ordering::Acquire) {
            return Err(Error::AlreadyStarted);
        }
        let (stream, writer) = LogStream::new(tag, Box::new(log_func), self.max_line_len())
            .map_err(|source| Error::Pipe {
                tag: tag.to_string(),
                source,
            })?;
        self.streams.push(stream);
        Ok(writer)
    }

    /// Like [`LogPipe::add`], panicking if the stream cannot be created.
    pub fn must_add<F>(&mut self, log_func: F) -> StreamWriter
    where
        F: FnMut(fmt::Arguments<'_>) + Send + 'static,
    {
        self.must_add_tagged("", log_func)
    }

    /// Like [`LogPipe::add_tagged`], panicking if the stream cannot be created.
    pub fn must_add_tagged<F>(&mut self, tag: &str, log_func: F) -> StreamWriter
    where
        F: FnMut(fmt::Arguments<'_>) + Send + 'static,
    {
        self.add_tagged(tag, log_func)
            .unwrap_or_else(|err| panic!("Unable to add log stream: {err}"))
    }

    /// Reads every stream on its own thread until all of them are done.
    ///
    /// The first error of any stream cancels the others and is returned.
    /// Cancelling `cancel` stops each stream before its next line and yields
    /// [`Error::Cancelled`]; streams closed through [`LogPipe::close`] end
    /// without error. A pipe runs at most once.
    ///
    /// # Panics
    /// Panics if a stream callback panics.
    pub fn run(&self, cancel: &CancellationToken) -> Result<(), Error> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }
        let group = cancel.child_token();
        let first_error = Mutex::new(None);
        thread::scope(|scope| {
            for stream in &self.streams {
                let (group, first_error) = (&group, &first_error);
                let spawned = thread::Builder::new()
                    .name(format!("logpipe:{}", stream.tag()))
                    .spawn_scoped(scope, move || {
                        if let Err(err) = stream.run(group) {
                            fail(first_error, group, err);
                        }
                    });
                if let Err(source) = spawned {
                    let tag = stream.tag().to_string();
                    fail(first_error, group, Error::Spawn { tag, source });
                    break;
                }
            }
        });
        match first_error.into_inner().unwrap_or_else(PoisonError::into_inner) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Closes every stream, in registration order. Idempotent.
    pub fn close(&self) {
        for stream in &self.streams {
            stream.close();
        }
    }
}

/// Records `err` unless an earlier one is already recorded, then stops the group.
fn fail(first_error: &Mutex<Option<Error>>, group: &CancellationToken, err: Error) {
    {
        let mut first_error = lock(first_error);
        if first_error.is_none() {
            if !err.is_cancelled() {
                log::warn!("log pipe stopping: {err}");
            }
            *first_error = Some(err);
        }
    }
    group.cancel();
}

impl fmt::Debug for LogPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogPipe")
            .field("tag", &self.tag())
            .field("streams", &self.tags().collect::<Vec<_>>())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}
