//! SSE line framing over a raw HTTP body.
//!
//! Upstream reads arrive at arbitrary byte boundaries, sometimes in the middle
//! of a multi-byte character. The framer keeps a single carry-over buffer plus
//! the undecoded tail of the previous read and yields each complete line
//! exactly once.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use memchr::memchr_iter;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::PendingQueue;
use crate::error::ChatError;

// ---------------------------------------------------------------------------
// LineFramer — incremental line splitter with streaming UTF-8 decode
// ---------------------------------------------------------------------------

/// Incremental line framer.
///
/// Lines are terminated by `\n`; a preceding `\r` is stripped. Invalid UTF-8
/// sequences decode to U+FFFD, while an incomplete sequence at the end of a
/// read is held until the next read completes it.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: String,
    read_offset: usize,
    utf8_remainder: Vec<u8>,
}

impl LineFramer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw read and append every line it completes to `out`.
    pub fn feed_bytes(&mut self, bytes: &[u8], out: &mut Vec<String>) {
        if self.utf8_remainder.is_empty() {
            let consumed = self.push_utf8(bytes);
            self.utf8_remainder.extend_from_slice(&bytes[consumed..]);
        } else {
            let mut joined = std::mem::take(&mut self.utf8_remainder);
            joined.extend_from_slice(bytes);
            let consumed = self.push_utf8(&joined);
            joined.drain(..consumed);
            self.utf8_remainder = joined;
        }
        self.extract_lines(out);
    }

    /// Flush at end of stream: a non-empty unterminated remainder becomes the
    /// final line.
    pub fn finish(&mut self, out: &mut Vec<String>) {
        if !self.utf8_remainder.is_empty() {
            self.buffer.push(char::REPLACEMENT_CHARACTER);
            self.utf8_remainder.clear();
        }
        let rest = &self.buffer[self.read_offset..];
        let rest = rest.strip_suffix('\r').unwrap_or(rest);
        if !rest.is_empty() {
            out.push(rest.to_string());
        }
        self.buffer.clear();
        self.read_offset = 0;
    }

    /// Decode as much of `bytes` as possible into the buffer and return how
    /// many bytes were consumed. Only an incomplete trailing sequence is left.
    fn push_utf8(&mut self, bytes: &[u8]) -> usize {
        let mut rest = bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    return bytes.len();
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&rest[..valid_up_to]) {
                        self.buffer.push_str(text);
                    }
                    match err.error_len() {
                        Some(invalid_len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid_up_to + invalid_len..];
                        }
                        None => return bytes.len() - (rest.len() - valid_up_to),
                    }
                }
            }
        }
    }

    fn extract_lines(&mut self, out: &mut Vec<String>) {
        let mut processed_up_to = self.read_offset;
        let scan_start = processed_up_to;
        let bytes = self.buffer.as_bytes();
        for rel_pos in memchr_iter(b'\n', &bytes[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let line = &self.buffer[processed_up_to..line_end];
            let line = line.strip_suffix('\r').unwrap_or(line);
            out.push(line.to_string());
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }
}

// ---------------------------------------------------------------------------
// Stream utility
// ---------------------------------------------------------------------------

struct LineStreamState<S> {
    body: std::pin::Pin<Box<S>>,
    framer: LineFramer,
    parsed: Vec<String>,
    pending: PendingQueue<String>,
    cancel: CancellationToken,
    finished: bool,
}

/// Split an HTTP body into lines using [`LineFramer`].
///
/// The body read is the cancellation point: once `cancel` fires no further
/// reads happen and the stream ends without an error item. A read error is
/// yielded once as [`ChatError::Transport`] and ends the stream.
pub fn line_stream<S, E>(
    byte_stream: S,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<String, ChatError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    futures_util::stream::unfold(
        LineStreamState {
            body: Box::pin(byte_stream),
            framer: LineFramer::new(),
            parsed: Vec::with_capacity(8),
            pending: PendingQueue::new(),
            cancel,
            finished: false,
        },
        |mut state| async move {
            loop {
                if state.cancel.is_cancelled() {
                    return None;
                }
                if let Some(line) = state.pending.pop_front() {
                    return Some((Ok(line), state));
                }
                if state.finished {
                    return None;
                }

                let next = tokio::select! {
                    biased;
                    () = state.cancel.cancelled() => {
                        debug!("body read cancelled");
                        return None;
                    }
                    next = state.body.next() => next,
                };

                match next {
                    Some(Ok(bytes)) => {
                        state.framer.feed_bytes(&bytes, &mut state.parsed);
                        state.pending.extend_from_vec(&mut state.parsed);
                    }
                    Some(Err(err)) => {
                        state.finished = true;
                        return Some((Err(ChatError::Transport(err.to_string())), state));
                    }
                    None => {
                        state.finished = true;
                        state.framer.finish(&mut state.parsed);
                        state.pending.extend_from_vec(&mut state.parsed);
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_all(reads: &[&[u8]]) -> Vec<String> {
        let mut framer = LineFramer::new();
        let mut out = Vec::new();
        for read in reads {
            framer.feed_bytes(read, &mut out);
        }
        framer.finish(&mut out);
        out
    }

    #[test]
    fn test_lines_split_across_reads() {
        let lines = frame_all(&[b"data: {\"a\"", b":1}\ndata: [DO", b"NE]\n"]);
        assert_eq!(lines, vec!["data: {\"a\":1}", "data: [DONE]"]);
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let lines = frame_all(&[b"data: x\r\n\r\n: keep-alive\r\n"]);
        assert_eq!(lines, vec!["data: x", "", ": keep-alive"]);
    }

    #[test]
    fn test_unterminated_remainder_flushed_at_end() {
        let lines = frame_all(&[b"data: one\ndata: tw", b"o"]);
        assert_eq!(lines, vec!["data: one", "data: two"]);
    }

    #[test]
    fn test_multibyte_split_held_until_complete() {
        let text = "data: héllo 世界\n";
        let bytes = text.as_bytes();
        // Split inside 'é' (2 bytes) and inside '世' (3 bytes).
        let e_pos = text.find('é').expect("é");
        let cjk_pos = text.find('世').expect("世");
        let lines = frame_all(&[
            &bytes[..=e_pos],
            &bytes[e_pos + 1..=cjk_pos],
            &bytes[cjk_pos + 1..cjk_pos + 2],
            &bytes[cjk_pos + 2..],
        ]);
        assert_eq!(lines, vec!["data: héllo 世界"]);
    }

    #[test]
    fn test_every_split_point_is_equivalent() {
        let text = "data: {\"c\":\"ü→\"}\r\ndata: [DONE]\n".as_bytes();
        let whole = frame_all(&[text]);
        for split in 0..=text.len() {
            let (left, right) = text.split_at(split);
            assert_eq!(frame_all(&[left, right]), whole, "split at {split}");
        }
        let single_bytes: Vec<&[u8]> = text.chunks(1).collect();
        assert_eq!(frame_all(&single_bytes), whole);
    }

    #[test]
    fn test_invalid_utf8_becomes_replacement_char() {
        let lines = frame_all(&[b"data: a\xffb\n"]);
        assert_eq!(lines, vec!["data: a\u{FFFD}b"]);
    }

    #[test]
    fn test_truncated_sequence_at_end_of_stream() {
        let lines = frame_all(&[b"data: a\xe4\xb8"]);
        assert_eq!(lines, vec!["data: a\u{FFFD}"]);
    }

    #[tokio::test]
    async fn test_line_stream_ends_on_cancel() {
        let cancel = CancellationToken::new();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Bytes, String>>();
        let body = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        tx.send(Ok(Bytes::from_static(b"data: first\n")))
            .expect("send");
        let mut lines = Box::pin(line_stream(body, cancel.clone()));

        let first = lines.next().await.expect("first line").expect("ok");
        assert_eq!(first, "data: first");

        cancel.cancel();
        tx.send(Ok(Bytes::from_static(b"data: second\n")))
            .expect("send");
        assert!(lines.next().await.is_none());
    }

    #[tokio::test]
    async fn test_line_stream_surfaces_read_error_once() {
        let reads: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"data: partial\n")),
            Err("connection reset".to_string()),
        ];
        let lines: Vec<_> = line_stream(futures_util::stream::iter(reads), CancellationToken::new())
            .collect()
            .await;
        assert_eq!(lines.len(), 2);
        assert!(matches!(&lines[0], Ok(line) if line == "data: partial"));
        assert!(matches!(&lines[1], Err(ChatError::Transport(msg)) if msg == "connection reset"));
    }
}
