//! Background stdin monitor for operator steering between agent turns.

use std::io::BufRead;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::cancel::CancelToken;

const POLL: Duration = Duration::from_millis(100);

/// Buffers lines typed by the operator while an agent turn is in flight. The
/// caller checks for buffered input between turns.
///
/// The reader thread exits on EOF or once the `StdinReader` is dropped and it
/// fails to deliver the next line. It may stay blocked on the underlying read
/// until input arrives; shutdown is best-effort.
pub struct StdinReader {
    lines: Receiver<String>,
}

impl StdinReader {
    /// Start a background thread reading non-empty lines from `reader`.
    pub fn new<R: BufRead + Send + 'static>(reader: R) -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for line in reader.lines() {
                let Ok(line) = line else {
                    return;
                };
                if line.trim().is_empty() {
                    continue;
                }
                if tx.send(line.trim().to_string()).is_err() {
                    return;
                }
            }
        });
        Self { lines: rx }
    }

    /// Non-blocking check for buffered input.
    pub fn try_line(&self) -> Option<String> {
        self.lines.try_recv().ok()
    }

    /// Block until a line arrives, the reader hits EOF, or the token cancels.
    pub fn wait_line(&self, cancel: &CancelToken) -> Option<String> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match self.lines.recv_timeout(POLL) {
                Ok(line) => return Some(line),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn buffers_lines_and_skips_blanks() {
        let reader = StdinReader::new(Cursor::new(b"first\n\nsecond\n".to_vec()));
        // Wait for the background thread to drain the cursor.
        let cancel = CancelToken::new();
        assert_eq!(reader.wait_line(&cancel).as_deref(), Some("first"));
        assert_eq!(reader.wait_line(&cancel).as_deref(), Some("second"));
        assert_eq!(reader.wait_line(&cancel), None);
    }

    #[test]
    fn try_line_is_non_blocking() {
        let reader = StdinReader::new(Cursor::new(Vec::new()));
        assert_eq!(reader.try_line(), None);
    }

    #[test]
    fn wait_line_returns_none_on_cancellation() {
        struct Never;
        impl std::io::Read for Never {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                std::thread::sleep(Duration::from_secs(30));
                Ok(0)
            }
        }
        let reader = StdinReader::new(std::io::BufReader::new(Never));
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(reader.wait_line(&cancel), None);
    }
}
