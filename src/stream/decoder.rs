use futures_util::{Stream, StreamExt};
use tracing::warn;

use crate::error::ChatError;
use crate::protocol::CompletionChunk;

/// Prefix carried by every SSE data line.
pub const DATA_PREFIX: &str = "data: ";
/// Payload that terminates a completion stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Result of decoding a single framed line.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedLine {
    Chunk(CompletionChunk),
    /// The `[DONE]` sentinel: the stream ended cleanly.
    Done,
    /// Comment, blank, non-data or malformed line.
    Skipped,
}

/// Decode one framed line.
///
/// Malformed JSON is logged and skipped; one bad event never aborts the
/// whole generation.
#[must_use]
pub fn decode_line(line: &str) -> DecodedLine {
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return DecodedLine::Skipped;
    };
    if payload.trim_end() == DONE_SENTINEL {
        return DecodedLine::Done;
    }
    match serde_json::from_str::<CompletionChunk>(payload) {
        Ok(chunk) => DecodedLine::Chunk(chunk),
        Err(err) => {
            let decode_err = ChatError::Decode(err.to_string());
            warn!(error = %decode_err, payload_len = payload.len(), "skipping malformed SSE event");
            DecodedLine::Skipped
        }
    }
}

/// Turn a line stream into a chunk stream, ending at `[DONE]`.
///
/// Errors from the line stream pass through; nothing is read after the
/// sentinel.
pub fn chunk_stream<S>(lines: S) -> impl Stream<Item = Result<CompletionChunk, ChatError>> + Send
where
    S: Stream<Item = Result<String, ChatError>> + Send + 'static,
{
    futures_util::stream::unfold(
        (Box::pin(lines), false),
        |(mut lines, done)| async move {
            if done {
                return None;
            }
            loop {
                match lines.next().await? {
                    Ok(line) => match decode_line(&line) {
                        DecodedLine::Chunk(chunk) => return Some((Ok(chunk), (lines, false))),
                        DecodedLine::Done => return None,
                        DecodedLine::Skipped => {}
                    },
                    Err(err) => return Some((Err(err), (lines, true))),
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::sse::LineFramer;

    fn decode_reads(reads: &[&[u8]]) -> Vec<CompletionChunk> {
        let mut framer = LineFramer::new();
        let mut lines = Vec::new();
        for read in reads {
            framer.feed_bytes(read, &mut lines);
        }
        framer.finish(&mut lines);
        let mut chunks = Vec::new();
        for line in &lines {
            match decode_line(line) {
                DecodedLine::Chunk(chunk) => chunks.push(chunk),
                DecodedLine::Done => break,
                DecodedLine::Skipped => {}
            }
        }
        chunks
    }

    #[test]
    fn test_non_data_lines_are_skipped() {
        assert_eq!(decode_line(": keep-alive"), DecodedLine::Skipped);
        assert_eq!(decode_line(""), DecodedLine::Skipped);
        assert_eq!(decode_line("event: ping"), DecodedLine::Skipped);
        assert_eq!(decode_line("data:{\"choices\":[]}"), DecodedLine::Skipped);
    }

    #[test]
    fn test_done_sentinel() {
        assert_eq!(decode_line("data: [DONE]"), DecodedLine::Done);
    }

    #[test]
    fn test_malformed_json_is_skipped() {
        assert_eq!(decode_line("data: {\"choices\": ["), DecodedLine::Skipped);
    }

    #[test]
    fn test_decode_is_idempotent() {
        let line = r#"data: {"id":"x","choices":[{"index":0,"delta":{"content":"Hel"}}]}"#;
        let first = decode_line(line);
        let second = decode_line(line);
        assert!(matches!(first, DecodedLine::Chunk(_)));
        assert_eq!(first, second);
    }

    #[test]
    fn test_chunking_invariance_including_multibyte_splits() {
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Grüße \"}}]}\n",
            ": comment\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"日本\"}}]}\r\n",
            "\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n",
            "data: [DONE]\n",
        )
        .as_bytes();
        let expected = decode_reads(&[body]);
        assert_eq!(expected.len(), 3);

        for split in 0..=body.len() {
            let (left, right) = body.split_at(split);
            assert_eq!(decode_reads(&[left, right]), expected, "split at {split}");
        }
        for width in [1usize, 2, 3, 5, 7] {
            let reads: Vec<&[u8]> = body.chunks(width).collect();
            assert_eq!(decode_reads(&reads), expected, "width {width}");
        }
    }

    #[tokio::test]
    async fn test_chunk_stream_stops_at_done() {
        let lines: Vec<Result<String, ChatError>> = vec![
            Ok(r#"data: {"choices":[{"delta":{"content":"a"}}]}"#.to_string()),
            Ok("data: not json".to_string()),
            Ok("data: [DONE]".to_string()),
            Ok(r#"data: {"choices":[{"delta":{"content":"after"}}]}"#.to_string()),
        ];
        let chunks: Vec<_> = chunk_stream(futures_util::stream::iter(lines))
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        let chunk = chunks[0].as_ref().expect("chunk");
        let delta = chunk.choices.as_ref().expect("choices")[0]
            .delta
            .as_ref()
            .expect("delta");
        assert_eq!(delta.content.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_chunk_stream_passes_transport_error_through() {
        let lines: Vec<Result<String, ChatError>> = vec![
            Ok(r#"data: {"choices":[]}"#.to_string()),
            Err(ChatError::Transport("reset".to_string())),
        ];
        let chunks: Vec<_> = chunk_stream(futures_util::stream::iter(lines))
            .collect()
            .await;
        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[1], Err(ChatError::Transport(_))));
    }
}
