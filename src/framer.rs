//! Re-framing of a raw byte stream into protocol records
//!
//! The framer knows nothing about sockets. Bytes are pushed in with
//! [`Framer::feed`] as they arrive and records are pulled out one at a
//! time with [`Framer::next_record`]. Because records are extracted
//! lazily under the *current* mode, a caller that switches to
//! [`Mode::Data`] after seeing a `DATA` command gets the rest of the
//! same chunk parsed as payload, not as further commands.
//!
//! ```
//! use rai::{Framer, Mode, Record};
//!
//! let mut framer = Framer::new();
//! framer.feed(b"DATA\r\n..dot\r\n.\r\nQUIT\r\n");
//!
//! assert_eq!(framer.next_record(), Some(Record::Command("DATA".into())));
//! framer.set_mode(Mode::Data);
//! assert_eq!(framer.next_record(), Some(Record::Data(".dot".into())));
//! assert_eq!(framer.next_record(), Some(Record::DataEnd));
//! assert_eq!(framer.next_record(), Some(Record::Command("QUIT".into())));
//! assert_eq!(framer.next_record(), None);
//! ```

use bytes::{Bytes, BytesMut};

const CRLF: &[u8] = b"\r\n";

/// Which grammar the framer applies to buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// CRLF-terminated command lines.
    #[default]
    Command,
    /// Dot-stuffed bulk data ending with a lone `.` line.
    Data,
}

/// A complete unit extracted from the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// A command line without its CRLF. May be empty.
    Command(Bytes),
    /// One data line without its CRLF, with a stuffed leading `.` removed.
    Data(Bytes),
    /// The `.` line that ends a data transfer. The framer is back in
    /// [`Mode::Command`] once this has been returned.
    DataEnd,
}

/// Incremental line framer.
#[derive(Debug, Default)]
pub struct Framer {
    buf: BytesMut,
    mode: Mode,
    /// Bytes before this offset are known not to start a terminator.
    scanned: usize,
}

impl Framer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes. Nothing is parsed until [`Self::next_record`].
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Switch grammar. Bytes already buffered are parsed under the new mode.
    pub const fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Number of bytes received but not yet turned into records.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop everything buffered, complete lines included.
    pub fn discard(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }

    /// Extract the next complete record, or `None` if the buffer holds
    /// no further terminator.
    pub fn next_record(&mut self) -> Option<Record> {
        let line = self.next_line()?;
        let record = match self.mode {
            Mode::Command => Record::Command(line),
            Mode::Data if line.as_ref() == b"." => {
                self.mode = Mode::Command;
                Record::DataEnd
            }
            Mode::Data if line.first() == Some(&b'.') => Record::Data(line.slice(1..)),
            Mode::Data => Record::Data(line),
        };
        Some(record)
    }

    fn next_line(&mut self) -> Option<Bytes> {
        let Some(pos) = find_crlf(&self.buf[self.scanned..]) else {
            // A trailing `\r` may be the first half of a split terminator.
            self.scanned = self.buf.len().saturating_sub(1);
            return None;
        };

        let end = self.scanned + pos;
        let mut line = self.buf.split_to(end + CRLF.len());
        line.truncate(end);
        self.scanned = 0;
        Some(line.freeze())
    }
}

fn find_crlf(haystack: &[u8]) -> Option<usize> {
    haystack.windows(CRLF.len()).position(|window| window == CRLF)
}
