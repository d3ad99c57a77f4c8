use std::{
    borrow::Cow,
    io::{self, BufRead, BufReader, Read},
};

pub(crate) enum ScanError {
    LineTooLong,
    Io(io::Error),
}

/// Splits a byte stream into lines of at most `max` bytes, not counting the
/// `\n` or a `\r` right before it.
pub(crate) struct LineScanner<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
    max: usize,
}

impl<R: Read> LineScanner<R> {
    pub(crate) fn new(reader: R, max: usize) -> Self {
        Self {
            reader: BufReader::with_capacity(max.clamp(1, 64 * 1024), reader),
            line: Vec::new(),
            max,
        }
    }

    /// Returns the next line without its terminator, or `None` at end of input.
    /// A final line lacking a newline is still returned.
    pub(crate) fn next_line(&mut self) -> Result<Option<Cow<'_, str>>, ScanError> {
        self.line.clear();
        loop {
            let available = match self.reader.fill_buf() {
                Ok(buf) => buf,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ScanError::Io(err)),
            };
            if available.is_empty() {
                if self.line.is_empty() {
                    return Ok(None);
                }
                break;
            }
            let newline = available.iter().position(|&b| b == b'\n');
            let chunk = &available[..newline.unwrap_or(available.len())];
            // one spare byte for a '\r' that turns out to precede the newline
            if self.line.len() + chunk.len() > self.max.saturating_add(1) {
                return Err(ScanError::LineTooLong);
            }
            self.line.extend_from_slice(chunk);
            let used = chunk.len() + usize::from(newline.is_some());
            self.reader.consume(used);
            if newline.is_some() {
                break;
            }
            if self.line.len() > self.max && self.line.last() != Some(&b'\r') {
                return Err(ScanError::LineTooLong);
            }
        }
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }
        if self.line.len() > self.max {
            return Err(ScanError::LineTooLong);
        }
        Ok(Some(String::from_utf8_lossy(&self.line)))
    }
}
