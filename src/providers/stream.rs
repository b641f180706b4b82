//! Server-sent-events decoding for streamed completions
//!
//! Upstream bodies arrive as arbitrarily sized byte chunks. [`SseDecoder`]
//! carries the unterminated tail of the previous chunk, so only complete
//! lines are ever parsed, and a multi-byte character split across two chunks
//! is decoded once both halves are present.
//!
//! Each line is handled on its own:
//! - blank lines, `:` comments and `event:`/`id:`/`retry:` fields are skipped
//! - the `data:` prefix is stripped
//! - `[DONE]` ends the stream
//! - anything else must be a completion chunk carrying
//!   `choices[0].delta.content`
//!
//! A line that fails to parse produces [`StreamEvent::ParseError`] and
//! decoding carries on with the next line. So does valid JSON that is not a
//! completion chunk: an `error` object, or a payload without `choices`. A
//! chunk whose first delta has no text (the role-only opener, the finish
//! chunk) and a usage trailer with empty `choices` produce nothing.

use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;

/// Sentinel payload marking the end of a streamed completion
pub const DONE_SENTINEL: &str = "[DONE]";

const DATA_PREFIX: &str = "data:";

/// A decoded unit of the upstream stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental assistant text
    Delta(String),
    /// The sentinel line was seen; nothing follows
    Done,
    /// A line that could not be understood; decoding continues after it
    ParseError { line: String, reason: String },
}

#[cfg(test)]
impl StreamEvent {
    pub fn as_delta(&self) -> Option<&str> {
        match self {
            StreamEvent::Delta(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Option<Vec<ChunkChoice>>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

impl CompletionChunk {
    /// Text of the first delta, or why the payload is not a completion chunk
    fn into_content(self) -> Result<Option<String>, String> {
        if let Some(error) = self.error {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| error.to_string());
            return Err(format!("upstream error: {}", message));
        }

        let choices = self.choices.ok_or("payload has no choices array")?;
        let Some(choice) = choices.into_iter().next() else {
            return Ok(None);
        };
        let delta = choice.delta.ok_or("first choice has no delta")?;
        Ok(delta.content.filter(|content| !content.is_empty()))
    }
}

/// Incremental line splitter and event parser
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the sentinel has been decoded
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one chunk, returning the events of every line it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = self.decode_line(&line[..line.len() - 1]) {
                events.push(event);
                if self.done {
                    self.buffer.clear();
                    break;
                }
            }
        }
        events
    }

    /// Flush a final line the upstream closed without terminating
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done || self.buffer.is_empty() {
            self.buffer.clear();
            return Vec::new();
        }
        let line = std::mem::take(&mut self.buffer);
        self.decode_line(&line).into_iter().collect()
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<StreamEvent> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line,
            Err(e) => {
                return Some(StreamEvent::ParseError {
                    line: String::from_utf8_lossy(raw).into_owned(),
                    reason: e.to_string(),
                })
            }
        };

        if line.trim().is_empty() || line.starts_with(':') {
            return None;
        }
        if ["event:", "id:", "retry:"].iter().any(|field| line.starts_with(field)) {
            return None;
        }

        let payload = match line.strip_prefix(DATA_PREFIX) {
            Some(rest) => rest.strip_prefix(' ').unwrap_or(rest),
            None => line,
        };

        if payload.trim() == DONE_SENTINEL {
            self.done = true;
            return Some(StreamEvent::Done);
        }

        let parsed = serde_json::from_str::<CompletionChunk>(payload)
            .map_err(|e| e.to_string())
            .and_then(CompletionChunk::into_content);
        match parsed {
            Ok(content) => content.map(StreamEvent::Delta),
            Err(reason) => Some(StreamEvent::ParseError {
                line: line.to_string(),
                reason,
            }),
        }
    }
}

/// Turn a byte stream into a lazy, ordered stream of [`StreamEvent`]s.
///
/// The sequence ends after [`StreamEvent::Done`], when the body closes, or
/// after yielding the first transport error.
pub fn decode_events<S, B, E>(body: S) -> impl Stream<Item = Result<StreamEvent, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    async_stream::stream! {
        let mut decoder = SseDecoder::new();
        futures::pin_mut!(body);

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in decoder.push(bytes.as_ref()) {
                        yield Ok(event);
                    }
                    if decoder.is_done() {
                        return;
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        for event in decoder.finish() {
            yield Ok(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_line(content: &str) -> String {
        format!(
            "data: {}\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    fn body(contents: &[&str]) -> String {
        let mut body: String = contents.iter().map(|c| data_line(c)).collect();
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn decode_chunks(chunks: &[&[u8]]) -> Vec<StreamEvent> {
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(decoder.push(chunk));
        }
        events.extend(decoder.finish());
        events
    }

    fn expected(contents: &[&str]) -> Vec<StreamEvent> {
        let mut events: Vec<StreamEvent> = contents
            .iter()
            .map(|c| StreamEvent::Delta(c.to_string()))
            .collect();
        events.push(StreamEvent::Done);
        events
    }

    #[test]
    fn test_every_two_way_split_yields_same_events() {
        let contents = ["He", "llo", ", 世界", "!"];
        let raw = body(&contents);
        let bytes = raw.as_bytes();

        for split in 0..=bytes.len() {
            let events = decode_chunks(&[&bytes[..split], &bytes[split..]]);
            assert_eq!(events, expected(&contents), "split at byte {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let contents = ["π ≈ ", "3.14", "159"];
        let raw = body(&contents);
        let chunks: Vec<&[u8]> = raw.as_bytes().chunks(1).collect();

        assert_eq!(decode_chunks(&chunks), expected(&contents));
    }

    #[test]
    fn test_malformed_line_is_reported_and_skipped() {
        let raw = format!(
            "{}data: {{\"choices\": [{{\"delta\"\n{}{}data: [DONE]\n",
            data_line("one"),
            data_line("two"),
            data_line("three")
        );

        let events = decode_chunks(&[raw.as_bytes()]);
        let deltas: Vec<&str> = events.iter().filter_map(StreamEvent::as_delta).collect();
        let errors = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ParseError { .. }))
            .count();

        assert_eq!(deltas, vec!["one", "two", "three"]);
        assert_eq!(errors, 1);
        assert_eq!(events.last(), Some(&StreamEvent::Done));
    }

    #[test]
    fn test_nothing_after_sentinel() {
        let raw = format!("{}data: [DONE]\n{}", data_line("kept"), data_line("dropped"));
        let mut decoder = SseDecoder::new();

        let events = decoder.push(raw.as_bytes());
        assert_eq!(events, expected(&["kept"]));
        assert!(decoder.is_done());
        assert!(decoder.push(data_line("late").as_bytes()).is_empty());
    }

    #[test]
    fn test_ignores_comments_fields_and_empty_deltas() {
        let raw = concat!(
            ": keep-alive\r\n",
            "event: message\r\n",
            "id: 7\r\n",
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\r\n",
            "\r\n",
            "data:{\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\r\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\r\n",
            "data: [DONE]\r\n",
        );

        assert_eq!(decode_chunks(&[raw.as_bytes()]), expected(&["ok"]));
    }

    #[test]
    fn test_non_completion_payloads_are_reported() {
        let raw = format!(
            "{}{}{}{}",
            data_line("He"),
            "data: {\"error\":{\"message\":\"overloaded\"}}\n",
            "data: {\"foo\":1}\n",
            "data: [DONE]\n",
        );

        let events = decode_chunks(&[raw.as_bytes()]);
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], StreamEvent::Delta("He".into()));
        assert!(matches!(
            &events[1],
            StreamEvent::ParseError { line, reason }
                if line.contains("overloaded") && reason == "upstream error: overloaded"
        ));
        assert!(matches!(
            &events[2],
            StreamEvent::ParseError { line, .. } if line == "data: {\"foo\":1}"
        ));
        assert_eq!(events[3], StreamEvent::Done);
    }

    #[test]
    fn test_usage_trailer_is_silent() {
        let raw = format!(
            "{}data: {{\"choices\":[],\"usage\":{{\"total_tokens\":9}}}}\ndata: [DONE]\n",
            data_line("ok")
        );

        assert_eq!(decode_chunks(&[raw.as_bytes()]), expected(&["ok"]));
    }

    #[test]
    fn test_unterminated_final_line_is_flushed_on_close() {
        let raw = data_line("tail");
        let trimmed = raw.trim_end_matches('\n');

        let events = decode_chunks(&[trimmed.as_bytes()]);
        assert_eq!(events, vec![StreamEvent::Delta("tail".into())]);
    }

    #[tokio::test]
    async fn test_decode_events_stops_at_sentinel() {
        let raw = body(&["He", "llo"]);
        let (a, b) = raw.split_at(20);
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(a.as_bytes().to_vec()),
            Ok(b.as_bytes().to_vec()),
            Ok(data_line("never").into_bytes()),
        ];

        let events: Vec<StreamEvent> = decode_events(futures::stream::iter(chunks))
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(events, expected(&["He", "llo"]));
    }

    #[tokio::test]
    async fn test_decode_events_ends_on_transport_error() {
        let chunks: Vec<Result<Vec<u8>, String>> = vec![
            Ok(data_line("partial").into_bytes()),
            Err("connection reset".to_string()),
            Ok(data_line("unreachable").into_bytes()),
        ];

        let items: Vec<Result<StreamEvent, String>> =
            decode_events(futures::stream::iter(chunks)).collect().await;

        assert_eq!(
            items,
            vec![
                Ok(StreamEvent::Delta("partial".into())),
                Err("connection reset".to_string())
            ]
        );
    }
}
