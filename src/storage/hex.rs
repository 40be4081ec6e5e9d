//! # Hex stream backend
//!
//! Frames file contents as CRLF-terminated hex lines over a raw byte
//! link ([embedded_io] serial), for ad-hoc export to an engineering
//! host. The wire grammar:
//!
//! ```text
//!   BEGIN:<name>
//!   SIZE:<decimal byte count>
//!   <hex pairs, a space after every 8 bytes, line stride K bytes>
//!   END:<name>
//! ```
//!
//! `BEGIN:`, `SIZE:`, `END:`, `PROGRESS:` and `ABORT:` are the
//! reserved line prefixes; a conformant writer emits nothing else.
//! Reception is liberal: framing lines are skipped, data lines may
//! carry an `<address>: ` prefix, hex digits are accepted in either
//! case, and an `ABORT:` line terminates the transfer.
//!
//! There is no hardware flow control on the link; the per-line pacing
//! of the grammar is the only throttle.
use core::fmt::Write as _;

use embedded_hal::delay::DelayNs;
use embedded_io::{Read, ReadReady, Write};
use fugit::MillisDurationU32;

use super::{FileName, StorageBackend};
use crate::Error;

/// Default bytes per data line.
pub const DEFAULT_LINE_STRIDE: usize = 32;
/// Hard upper bound on the line stride.
pub const MAX_LINE_STRIDE: usize = 64;
/// A space is emitted after every this many bytes of a line.
const GROUP_BYTES: usize = 8;
/// A progress ping is emitted after every this many payload bytes.
const PROGRESS_INTERVAL: usize = 1024;
/// Budget for [StorageBackend::read] on a silent link.
pub const DEFAULT_RECEIVE_TIMEOUT: MillisDurationU32 = MillisDurationU32::from_ticks(10_000);

/// Sleep per poll while waiting for link input.
const POLL_TICK_MS: u32 = 1;

const CRLF: &[u8] = b"\r\n";
const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Longest accepted input line; longer lines decode up to this bound.
const LINE_CAP: usize = 192;

enum LineKind {
    Data,
    End,
    Abort,
    Ignored,
}

pub struct HexStreamBackend<L, D>
where
    L: Read + Write + ReadReady,
    D: DelayNs,
{
    link: L,
    delay: D,
    line_stride: usize,
    /// Emit `PROGRESS:` pings while set.
    progress: bool,
    /// Latched by a transfer that did not complete; cleared by
    /// [Self::abort].
    in_progress: bool,
    files_moved: u32,
    bytes_moved: u32,
}

impl<L, D> HexStreamBackend<L, D>
where
    L: Read + Write + ReadReady,
    D: DelayNs,
{
    pub fn new(link: L, delay: D) -> Self {
        Self {
            link,
            delay,
            line_stride: DEFAULT_LINE_STRIDE,
            progress: false,
            in_progress: false,
            files_moved: 0,
            bytes_moved: 0,
        }
    }

    /// Access to the underlying link.
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Releases the link and delay.
    pub fn release(self) -> (L, D) {
        (self.link, self.delay)
    }

    /// Sets the number of payload bytes per data line, clamped to
    /// `1..=`[MAX_LINE_STRIDE].
    pub fn set_line_stride(&mut self, stride: usize) {
        self.line_stride = stride.clamp(1, MAX_LINE_STRIDE);
    }

    pub fn line_stride(&self) -> usize {
        self.line_stride
    }

    /// Enables the 1 KiB `PROGRESS:` pings.
    pub fn set_progress(&mut self, enabled: bool) {
        self.progress = enabled;
    }

    /// `(files, payload bytes)` moved in either direction since the
    /// last reset.
    pub fn stats(&self) -> (u32, u32) {
        (self.files_moved, self.bytes_moved)
    }

    pub fn reset_stats(&mut self) {
        self.files_moved = 0;
        self.bytes_moved = 0;
    }

    /// Signals an abort to the peer and releases the transfer latch.
    pub fn abort(&mut self) {
        // Best effort: the link may be the reason we are aborting.
        let _ = self.link.write_all(b"ABORT:operator");
        let _ = self.link.write_all(CRLF);
        self.in_progress = false;
    }

    /// Emits one complete framed file. Returns the payload byte count.
    ///
    /// Fails `Busy` while an earlier transfer is latched; a transfer
    /// that died on a link error stays latched until [Self::abort].
    pub fn write(&mut self, name: &str, bytes: &[u8]) -> Result<usize, Error> {
        if self.in_progress {
            return Err(Error::Busy);
        }
        self.in_progress = true;
        self.emit_file(name, bytes)?;
        self.in_progress = false;
        self.files_moved += 1;
        self.bytes_moved = self.bytes_moved.wrapping_add(bytes.len() as u32);
        Ok(bytes.len())
    }

    /// Reassembles a file from framed input.
    ///
    /// Reads lines until `END:` or until `timeout` elapses with the
    /// link silent. `BEGIN:`, `SIZE:` and `PROGRESS:` lines are
    /// skipped; an `ABORT:` line terminates the transfer with
    /// `ProtocolError`. A timeout after partial data returns the
    /// bytes decoded so far; a timeout with nothing decoded is
    /// reported as `Timeout`.
    pub fn receive(&mut self, dst: &mut [u8], timeout: MillisDurationU32) -> Result<usize, Error> {
        if self.in_progress {
            return Err(Error::Busy);
        }
        self.in_progress = true;
        let result = self.receive_inner(dst, timeout);
        self.in_progress = false;
        if let Ok(decoded) = result {
            self.files_moved += 1;
            self.bytes_moved = self.bytes_moved.wrapping_add(decoded as u32);
        }
        result
    }

    fn receive_inner(
        &mut self,
        dst: &mut [u8],
        timeout: MillisDurationU32,
    ) -> Result<usize, Error> {
        let mut line = heapless::Vec::<u8, LINE_CAP>::new();
        let mut decoded = 0;
        let mut waited_ms = 0u32;
        loop {
            if !self.link.read_ready().map_err(|_| Error::IoError)? {
                if waited_ms >= timeout.ticks() {
                    // Partial lines are discarded on expiry.
                    return if decoded > 0 { Ok(decoded) } else { Err(Error::Timeout) };
                }
                self.delay.delay_ms(POLL_TICK_MS);
                waited_ms += POLL_TICK_MS;
                continue;
            }
            let mut byte = [0u8; 1];
            if self.link.read(&mut byte).map_err(|_| Error::IoError)? == 0 {
                continue;
            }
            waited_ms = 0;
            match byte[0] {
                b'\r' => {}
                b'\n' => {
                    match classify_line(&line) {
                        LineKind::End => return Ok(decoded),
                        LineKind::Abort => return Err(Error::ProtocolError),
                        LineKind::Ignored => {}
                        LineKind::Data => decode_data_line(&line, dst, &mut decoded),
                    }
                    line.clear();
                }
                other => {
                    // Overlong lines are truncated, not fatal.
                    let _ = line.push(other);
                }
            }
        }
    }

    fn emit_file(&mut self, name: &str, bytes: &[u8]) -> Result<(), Error> {
        self.emit_tagged(b"BEGIN:", name.as_bytes())?;

        let mut size_line = heapless::String::<24>::new();
        // Cannot fail: "SIZE:" plus ten digits fits the buffer.
        let _ = write!(size_line, "SIZE:{}", bytes.len());
        self.emit_raw(size_line.as_bytes())?;
        self.emit_raw(CRLF)?;

        let mut done = 0usize;
        for chunk in bytes.chunks(self.line_stride) {
            self.emit_data_line(chunk)?;
            let before = done;
            done += chunk.len();
            if self.progress && done / PROGRESS_INTERVAL != before / PROGRESS_INTERVAL {
                self.emit_progress(name, done, bytes.len())?;
            }
        }

        self.emit_tagged(b"END:", name.as_bytes())
    }

    fn emit_progress(&mut self, name: &str, done: usize, total: usize) -> Result<(), Error> {
        let mut line = heapless::String::<64>::new();
        let pct = if total == 0 { 100 } else { done * 100 / total };
        if write!(line, "PROGRESS:{name}:{done}/{total} ({pct}%)").is_ok() {
            self.emit_raw(line.as_bytes())?;
            self.emit_raw(CRLF)?;
        }
        Ok(())
    }

    /// One data line: hex pairs with a space after every eight bytes,
    /// none trailing.
    fn emit_data_line(&mut self, chunk: &[u8]) -> Result<(), Error> {
        let mut line = [0u8; MAX_LINE_STRIDE * 2 + MAX_LINE_STRIDE / GROUP_BYTES + 2];
        let mut len = 0;
        for (index, byte) in chunk.iter().enumerate() {
            line[len] = HEX_DIGITS[(byte >> 4) as usize];
            line[len + 1] = HEX_DIGITS[(byte & 0x0F) as usize];
            len += 2;
            if (index + 1) % GROUP_BYTES == 0 && index + 1 != chunk.len() {
                line[len] = b' ';
                len += 1;
            }
        }
        line[len] = b'\r';
        line[len + 1] = b'\n';
        self.emit_raw(&line[..len + 2])
    }

    fn emit_tagged(&mut self, tag: &[u8], name: &[u8]) -> Result<(), Error> {
        self.emit_raw(tag)?;
        self.emit_raw(name)?;
        self.emit_raw(CRLF)
    }

    fn emit_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.link.write_all(bytes).map_err(|_| Error::IoError)
    }
}

fn classify_line(line: &[u8]) -> LineKind {
    if line.starts_with(b"END:") {
        LineKind::End
    } else if line.starts_with(b"ABORT:") {
        LineKind::Abort
    } else if line.starts_with(b"BEGIN:")
        || line.starts_with(b"SIZE:")
        || line.starts_with(b"PROGRESS:")
    {
        LineKind::Ignored
    } else {
        LineKind::Data
    }
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        _ => None,
    }
}

/// Decodes the hex pairs of one data line into `dst`, skipping an
/// optional `<hex-addr>: ` prefix and single spaces between groups.
/// Decoding stops at the first character that is neither.
fn decode_data_line(line: &[u8], dst: &mut [u8], decoded: &mut usize) {
    let mut payload = line;
    if let Some(colon) = line.iter().position(|byte| *byte == b':')
        && colon > 0
        && line[..colon].iter().all(|byte| byte.is_ascii_hexdigit())
    {
        payload = &line[colon + 1..];
    }
    let mut pos = 0;
    while pos + 1 < payload.len() || (pos < payload.len() && payload[pos] == b' ') {
        if payload[pos] == b' ' {
            pos += 1;
            continue;
        }
        match (hex_value(payload[pos]), hex_value(payload[pos + 1])) {
            (Some(high), Some(low)) => {
                if *decoded == dst.len() {
                    return;
                }
                dst[*decoded] = (high << 4) | low;
                *decoded += 1;
                pos += 2;
            }
            _ => return,
        }
    }
}

//==================================================================================================
// Uniform interface
//==================================================================================================

impl<L, D> StorageBackend for HexStreamBackend<L, D>
where
    L: Read + Write + ReadReady,
    D: DelayNs,
{
    /// A serial link has no presence detect; the stream is always
    /// willing.
    fn is_ready(&mut self) -> bool {
        true
    }

    fn update(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn write(&mut self, name: &str, bytes: &[u8]) -> Result<usize, Error> {
        HexStreamBackend::write(self, name, bytes)
    }

    /// Reads whatever framed file the host sends next; `name` cannot
    /// be looked up on a stream and is ignored.
    fn read(&mut self, _name: &str, dst: &mut [u8]) -> Result<usize, Error> {
        self.receive(dst, DEFAULT_RECEIVE_TIMEOUT)
    }

    fn exists(&mut self, _name: &str) -> bool {
        false
    }

    fn size(&mut self, _name: &str) -> Result<u32, Error> {
        Ok(0)
    }

    fn delete(&mut self, _name: &str) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    fn list(&mut self, _out: &mut [FileName]) -> Result<usize, Error> {
        Ok(0)
    }

    /// A stream holds no files; format just resets the statistics.
    fn format(&mut self) -> Result<(), Error> {
        self.reset_stats();
        Ok(())
    }

    fn space(&mut self) -> Result<(u64, u64), Error> {
        Ok((0, 0))
    }
}

/// Loopback link used by the hex and router tests.
#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::VecDeque;
    use std::vec::Vec;

    pub(crate) struct MockLink {
        pub(crate) outgoing: Vec<u8>,
        incoming: VecDeque<u8>,
        pub(crate) fail_writes: bool,
    }

    impl MockLink {
        pub(crate) fn new() -> Self {
            Self {
                outgoing: Vec::new(),
                incoming: VecDeque::new(),
                fail_writes: false,
            }
        }

        pub(crate) fn feed(&mut self, bytes: &[u8]) {
            self.incoming.extend(bytes.iter().copied());
        }

        pub(crate) fn output(&self) -> &[u8] {
            &self.outgoing
        }
    }

    impl embedded_io::ErrorType for MockLink {
        type Error = embedded_io::ErrorKind;
    }

    impl embedded_io::Write for MockLink {
        fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            if self.fail_writes {
                return Err(embedded_io::ErrorKind::Other);
            }
            self.outgoing.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    impl embedded_io::Read for MockLink {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            let mut count = 0;
            while count < buf.len() {
                match self.incoming.pop_front() {
                    Some(byte) => {
                        buf[count] = byte;
                        count += 1;
                    }
                    None => break,
                }
            }
            Ok(count)
        }
    }

    impl embedded_io::ReadReady for MockLink {
        fn read_ready(&mut self) -> Result<bool, Self::Error> {
            Ok(!self.incoming.is_empty())
        }
    }

    pub(crate) struct NoopDelay;

    impl embedded_hal::delay::DelayNs for NoopDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }
}
