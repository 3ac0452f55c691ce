//! A slog term decorator that prints log messages above a progress bar.

use std::io;

use indicatif::ProgressBar;
use slog::{OwnedKVList, Record};
use slog_term::{Decorator, RecordDecorator};

/// Formats records into a buffer and hands complete lines to the progress bar.
pub struct ProgressBarDecorator {
    bar: ProgressBar,
}

struct LineBuffer<'a>(&'a mut Vec<u8>);

impl ProgressBarDecorator {
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Decorator for ProgressBarDecorator {
    fn with_record<F: FnOnce(&mut dyn RecordDecorator) -> io::Result<()>>(
        &self,
        _record: &Record,
        _logger_values: &OwnedKVList,
        f: F,
    ) -> io::Result<()> {
        let mut buf = Vec::new();
        f(&mut LineBuffer(&mut buf))?;
        // println adds its own newline
        while buf.last() == Some(&b'\n') {
            buf.pop();
        }
        let line = String::from_utf8(buf).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Cannot convert log message to string: {}", e),
            )
        })?;
        if self.bar.is_hidden() {
            eprintln!("{}", line);
        } else {
            self.bar.println(line);
        }
        Ok(())
    }
}

impl io::Write for LineBuffer<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl RecordDecorator for LineBuffer<'_> {
    fn reset(&mut self) -> io::Result<()> {
        Ok(())
    }
}
