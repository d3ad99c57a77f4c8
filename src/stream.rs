use std::{
    borrow::Cow,
    fmt,
    io::{self, PipeReader, PipeWriter, Write},
    process::Stdio,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    thread,
};

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, select};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, is_pipe_closed},
    scanner::{LineScanner, ScanError},
};

/// Callback receiving every line of a stream, rendered as `[<tag>] <line>`.
pub type LogFunc = Box<dyn FnMut(fmt::Arguments<'_>) + Send>;

type WriteEnd = Arc<Mutex<Option<PipeWriter>>>;

/// Outcome of one blocking read, handed from the scanning thread to the run loop.
type Scanned = Result<Option<String>, ScanError>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn closed_stream_error(tag: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("log stream '{tag}' is closed"),
    )
}

/// Write end of a registered stream.
///
/// Bytes written here show up, split into lines, in the stream's [`LogFunc`].
/// Dropping the writer (or calling [`StreamWriter::close`]) signals end of
/// input to the stream. Once the stream is closed by its [`LogPipe`](crate::LogPipe),
/// every write fails with an error recognised by [`is_pipe_closed`](crate::is_pipe_closed).
pub struct StreamWriter {
    tag: Arc<str>,
    inner: WriteEnd,
}

impl StreamWriter {
    /// Tag of the stream this writer feeds.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Closes this handle's write end. Idempotent.
    pub fn close(&self) {
        drop(lock(&self.inner).take());
    }

    /// Hands the pipe's write end over to a child process.
    ///
    /// The stream reaches end of input once the child (and every other holder
    /// of the write end) exits. [`LogPipe::close`](crate::LogPipe::close) still
    /// ends the run right away; the write end itself lives on in the child.
    pub fn into_stdio(self) -> io::Result<Stdio> {
        lock(&self.inner)
            .take()
            .map(Stdio::from)
            .ok_or_else(|| closed_stream_error(&self.tag))
    }
}

impl Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match lock(&self.inner).as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(closed_stream_error(&self.tag)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock(&self.inner).as_mut() {
            Some(writer) => writer.flush(),
            None => Err(closed_stream_error(&self.tag)),
        }
    }
}

impl fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWriter")
            .field("tag", &self.tag)
            .field("closed", &lock(&self.inner).is_none())
            .finish()
    }
}

/// Read side of a stream, owned by whichever thread runs it.
struct Reader {
    pipe: PipeReader,
    log_func: LogFunc,
}

pub(crate) struct LogStream {
    tag: Arc<str>,
    max_line_len: usize,
    reader: Mutex<Option<Reader>>,
    writer: Weak<Mutex<Option<PipeWriter>>>,
    done: Receiver<()>,
    done_tx: Mutex<Option<Sender<()>>>,
}

impl LogStream {
    pub(crate) fn new(
        tag: &str,
        log_func: LogFunc,
        max_line_len: usize,
    ) -> io::Result<(Self, StreamWriter)> {
        let (pipe, writer) = io::pipe()?;
        let (done_tx, done) = bounded(0);
        let tag: Arc<str> = tag.into();
        let inner = Arc::new(Mutex::new(Some(writer)));
        let stream = Self {
            tag: Arc::clone(&tag),
            max_line_len,
            reader: Mutex::new(Some(Reader { pipe, log_func })),
            writer: Arc::downgrade(&inner),
            done,
            done_tx: Mutex::new(Some(done_tx)),
        };
        Ok((stream, StreamWriter { tag, inner }))
    }

    pub(crate) fn tag(&self) -> &str {
        &self.tag
    }

    fn is_closed(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Closes the done gate, then releases the read end (unless a run owns it)
    /// and the write end. Only the first call does anything.
    ///
    /// A run blocked on the pipe returns right away, even when the write end
    /// lives on in a child process. Safe to call from a stream's own callback.
    pub(crate) fn close(&self) {
        let Some(done_tx) = lock(&self.done_tx).take() else {
            return;
        };
        // Dropping the gate also stops the scanning thread, which drops the
        // read end and so fails any producer write stuck on a full pipe.
        drop(done_tx);
        drop(lock(&self.reader).take());
        if let Some(inner) = self.writer.upgrade() {
            drop(lock(&inner).take());
        }
        log::trace!("log stream '{}' closed", self.tag);
    }

    /// Moves the blocking reads onto their own thread and returns the channel
    /// its lines arrive on.
    ///
    /// The thread ends at end of input, on a read error, once the receiver is
    /// gone, or when the done gate closes while it waits to hand a line over.
    /// A read in flight is left to finish on its own.
    fn spawn_scanner(&self, pipe: PipeReader) -> Result<Receiver<Scanned>, Error> {
        let (lines_tx, lines) = bounded::<Scanned>(0);
        let done = self.done.clone();
        let mut scanner = LineScanner::new(pipe, self.max_line_len);
        thread::Builder::new()
            .name(format!("logpipe:{}:read", self.tag))
            .spawn(move || {
                loop {
                    let scanned = scanner.next_line().map(|line| line.map(Cow::into_owned));
                    let last = !matches!(scanned, Ok(Some(_)));
                    select! {
                        send(lines_tx, scanned) -> sent => {
                            if sent.is_err() {
                                return;
                            }
                        }
                        recv(done) -> _ => return,
                    }
                    if last {
                        return;
                    }
                }
            })
            .map_err(|source| Error::Spawn {
                tag: self.tag.to_string(),
                source,
            })?;
        Ok(lines)
    }

    /// Reads lines until end of input, close, cancellation or failure.
    ///
    /// `cancel` is checked between lines. Closing the done gate ends the run
    /// immediately, including while it waits for the next line.
    pub(crate) fn run(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let Some(Reader { pipe, mut log_func }) = lock(&self.reader).take() else {
            return Ok(());
        };
        log::debug!("log stream '{}' started", self.tag);
        let lines = self.spawn_scanner(pipe)?;
        loop {
            if self.is_closed() {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let scanned = select! {
                recv(lines) -> scanned => scanned,
                recv(self.done) -> _ => return Ok(()),
            };
            match scanned {
                Ok(Ok(Some(line))) => log_func(format_args!("[{}] {line}", self.tag)),
                // a closed channel means the scanner already reported its last result
                Ok(Ok(None)) | Err(_) => {
                    log::debug!("log stream '{}' reached end of input", self.tag);
                    self.close();
                    return Ok(());
                }
                Ok(Err(ScanError::Io(err))) if self.is_closed() && is_pipe_closed(&err) => {
                    return Ok(());
                }
                Ok(Err(ScanError::Io(source))) => {
                    return Err(Error::Read {
                        tag: self.tag.to_string(),
                        source,
                    });
                }
                Ok(Err(ScanError::LineTooLong)) => {
                    return Err(Error::LineTooLong {
                        tag: self.tag.to_string(),
                        limit: self.max_line_len,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::{
        sync::OnceLock,
        time::{Duration, Instant},
    };

    fn collecting_stream(tag: &str, max: usize) -> (LogStream, StreamWriter, Receiver<String>) {
        let (tx, rx) = unbounded();
        let (stream, writer) = LogStream::new(
            tag,
            Box::new(move |args: fmt::Arguments<'_>| {
                tx.send(args.to_string()).ok();
            }),
            max,
        )
        .unwrap();
        (stream, writer, rx)
    }

    #[test]
    fn test_chunked_writes_yield_whole_lines() {
        let (stream, mut writer, rx) = collecting_stream("chunks", 1024);
        for chunk in ["fir", "st\nsec", "ond\n", "third", "\n"] {
            writer.write_all(chunk.as_bytes()).unwrap();
        }
        drop(writer);
        stream.run(&CancellationToken::new()).unwrap();
        let lines: Vec<_> = rx.try_iter().collect();
        assert_eq!(lines, ["[chunks] first", "[chunks] second", "[chunks] third"]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (stream, mut writer, rx) = collecting_stream("twice", 1024);
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| stream.close());
            }
        });
        stream.close();
        let err = writer.write_all(b"late\n").unwrap_err();
        assert!(is_pipe_closed(&err));
        stream.run(&CancellationToken::new()).unwrap();
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn test_close_releases_blocked_read() {
        let (stream, _writer, rx) = collecting_stream("idle", 1024);
        thread::scope(|s| {
            let handle = s.spawn(|| stream.run(&CancellationToken::new()));
            thread::sleep(Duration::from_millis(50));
            stream.close();
            assert!(handle.join().unwrap().is_ok());
        });
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn test_close_releases_read_while_write_end_is_handed_off() {
        let (stream, writer, rx) = collecting_stream("child", 1024);
        // stands in for a child process holding the write end
        let stdio = writer.into_stdio().unwrap();
        let stream = Arc::new(stream);
        let (result_tx, result_rx) = bounded(1);
        let running = Arc::clone(&stream);
        thread::spawn(move || {
            result_tx.send(running.run(&CancellationToken::new())).ok();
        });
        thread::sleep(Duration::from_millis(100));
        let closed_at = Instant::now();
        stream.close();
        let result = result_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("run still blocked after close");
        assert!(result.is_ok());
        assert!(closed_at.elapsed() < Duration::from_secs(2));
        assert_eq!(rx.try_iter().count(), 0);
        drop(stdio);
    }

    #[test]
    fn test_close_from_callback_with_full_pipe() {
        let this: Arc<OnceLock<Arc<LogStream>>> = Arc::new(OnceLock::new());
        let slot = Arc::clone(&this);
        let (stream, mut writer) = LogStream::new(
            "self-closing",
            Box::new(move |_: fmt::Arguments<'_>| {
                // give the producer time to fill the pipe and block
                thread::sleep(Duration::from_millis(100));
                if let Some(stream) = slot.get() {
                    stream.close();
                }
            }),
            1 << 16,
        )
        .unwrap();
        let stream = Arc::new(stream);
        this.set(Arc::clone(&stream)).ok();
        let producer = thread::spawn(move || {
            let line = [b'x'; 1023];
            while writer.write_all(&line).and_then(|_| writer.write_all(b"\n")).is_ok() {}
        });
        let (result_tx, result_rx) = bounded(1);
        let running = Arc::clone(&stream);
        thread::spawn(move || {
            result_tx.send(running.run(&CancellationToken::new())).ok();
        });
        let result = result_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("close from callback deadlocked");
        assert!(result.is_ok());
        producer.join().unwrap();
    }

    #[test]
    fn test_cancelled_before_first_line() {
        let (stream, mut writer, rx) = collecting_stream("cancel", 1024);
        writeln!(writer, "never delivered").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(stream.run(&cancel), Err(Error::Cancelled)));
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn test_overlong_line_fails_stream() {
        let (stream, mut writer, rx) = collecting_stream("long", 8);
        writeln!(writer, "short").unwrap();
        writeln!(writer, "much too long for eight bytes").unwrap();
        drop(writer);
        let err = stream.run(&CancellationToken::new()).unwrap_err();
        assert!(matches!(err, Error::LineTooLong { ref tag, limit: 8 } if tag == "long"));
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), ["[long] short"]);
    }

    #[test]
    fn test_writer_close_and_stdio_handoff() {
        let (_stream, writer, _rx) = collecting_stream("handoff", 1024);
        assert_eq!(writer.tag(), "handoff");
        writer.close();
        writer.close();
        let err = writer.into_stdio().unwrap_err();
        assert!(is_pipe_closed(&err));

        let (_stream, writer, _rx) = collecting_stream("handoff", 1024);
        assert!(writer.into_stdio().is_ok());
    }
}
