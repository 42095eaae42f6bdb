use serde::Deserialize;
use tracing::{debug, warn};

use crate::provider::CompletionStream;
use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

/// Turn an Anthropic SSE response into a lazy stream of [`StreamEvent`]s.
///
/// The body is read only as the consumer polls; dropping the stream closes
/// the connection.
pub fn event_stream(resp: reqwest::Response) -> CompletionStream {
    Box::pin(async_stream::stream! {
        use futures_util::StreamExt;

        let mut decoder = SseDecoder::default();
        let mut byte_stream = resp.bytes_stream();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    yield StreamEvent::Error { message: e.to_string() };
                    return;
                }
            };

            for event in decoder.feed(&chunk) {
                let is_error = matches!(event, StreamEvent::Error { .. });
                yield event;
                if is_error {
                    return;
                }
            }
        }

        yield decoder.finish();
    })
}

/// Incremental decoder for Anthropic's SSE wire format.
///
/// Bytes are buffered until a full line is available so multi-byte
/// characters split across network chunks decode correctly.
#[derive(Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    current_event: String,
    model: String,
    tokens_in: u32,
    tokens_out: u32,
    stop_reason: String,
}

impl SseDecoder {
    /// Feed raw bytes and return the events completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let Ok(line) = std::str::from_utf8(&line) else {
                warn!("dropping non-UTF-8 SSE line");
                continue;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match parse_sse_line(line) {
                Some(SseParsed::Event(ev)) => self.current_event = ev,
                Some(SseParsed::Data(data)) => {
                    let event_type = std::mem::take(&mut self.current_event);
                    if let Some(event) = self.parse_data_block(&event_type, &data) {
                        events.push(event);
                    }
                    self.current_event = event_type;
                }
                None => {}
            }
        }

        events
    }

    /// Final usage event once the body is exhausted.
    pub fn finish(self) -> StreamEvent {
        StreamEvent::Done {
            model: self.model,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            stop_reason: self.stop_reason,
        }
    }

    fn parse_data_block(&mut self, event_type: &str, data: &str) -> Option<StreamEvent> {
        match event_type {
            "message_start" => {
                if let Ok(msg) = serde_json::from_str::<MessageStart>(data) {
                    self.model = msg.message.model;
                    self.tokens_in = msg.message.usage.input_tokens;
                }
                None
            }

            "content_block_delta" => {
                let delta = serde_json::from_str::<ContentBlockDelta>(data).ok()?;
                if delta.delta.delta_type != "text_delta" {
                    debug!(delta_type = %delta.delta.delta_type, "unhandled delta type");
                    return None;
                }
                let text = delta.delta.text?;
                debug!(len = text.len(), "stream text delta");
                Some(StreamEvent::TextDelta { text })
            }

            "message_delta" => {
                if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                    self.tokens_out = delta.usage.output_tokens;
                    if let Some(reason) = delta.delta.stop_reason {
                        self.stop_reason = reason;
                    }
                }
                None
            }

            "error" => {
                warn!(data, "anthropic stream error");
                Some(StreamEvent::Error {
                    message: data.to_string(),
                })
            }

            // content_block_start/stop, ping, message_stop: nothing to do
            _ => None,
        }
    }
}

// Anthropic SSE data types (private, deserialization only)

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Deserialize)]
struct MessageStartInner {
    model: String,
    usage: InputUsage,
}

#[derive(Deserialize)]
struct InputUsage {
    input_tokens: u32,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
    usage: OutputUsage,
}

#[derive(Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct OutputUsage {
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSCRIPT: &str = "event: message_start\n\
data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-test\",\"usage\":{\"input_tokens\":12}}}\n\
\n\
event: content_block_start\n\
data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\
\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\
\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" world\"}}\n\
\n\
event: message_delta\n\
data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"max_tokens\"},\"usage\":{\"output_tokens\":42}}\n\
\n\
event: message_stop\n\
data: {\"type\":\"message_stop\"}\n\n";

    fn texts(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn decodes_full_transcript() {
        let mut decoder = SseDecoder::default();
        let events = decoder.feed(TRANSCRIPT.as_bytes());
        assert_eq!(texts(&events), "Hello world");

        match decoder.finish() {
            StreamEvent::Done {
                model,
                tokens_in,
                tokens_out,
                stop_reason,
            } => {
                assert_eq!(model, "claude-test");
                assert_eq!(tokens_in, 12);
                assert_eq!(tokens_out, 42);
                assert_eq!(stop_reason, "max_tokens");
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn handles_lines_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        let bytes = TRANSCRIPT.as_bytes();
        let mut events = Vec::new();
        for chunk in bytes.chunks(7) {
            events.extend(decoder.feed(chunk));
        }
        assert_eq!(texts(&events), "Hello world");
    }

    #[test]
    fn multibyte_text_split_mid_character() {
        let data = "event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"你好\"}}\n";
        let bytes = data.as_bytes();
        // Split inside the 3-byte encoding of the first CJK character.
        let cut = data.find('你').unwrap() + 1;
        let mut decoder = SseDecoder::default();
        let mut events = decoder.feed(&bytes[..cut]);
        events.extend(decoder.feed(&bytes[cut..]));
        assert_eq!(texts(&events), "你好");
    }

    #[test]
    fn error_event_is_surfaced() {
        let mut decoder = SseDecoder::default();
        let events = decoder
            .feed(b"event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\"}}\n");
        assert!(matches!(events.as_slice(), [StreamEvent::Error { .. }]));
    }
}
