use bytes::{Bytes, BytesMut};
use futures::Stream;
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;

use crate::proxy::signature_store::{is_valid_signature, SignatureStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockType {
    Text,
    Thinking,
    ToolUse,
}

/// Re-frames the upstream SSE dialect into the client's event grammar.
/// Frames are forwarded with minimal parsing; only block transitions, the
/// finish frame and thought signatures need structural awareness.
pub struct StreamingState {
    model: String,
    fingerprint: String,
    signatures: Arc<SignatureStore>,
    message_start_sent: bool,
    message_stop_sent: bool,
    block_index: usize,
    open_block: Option<BlockType>,
    stop_reason: Option<&'static str>,
    saw_tool_use: bool,
    input_tokens: i64,
    output_tokens: i64,
    tool_counter: usize,
}

impl StreamingState {
    pub fn new(model: String, fingerprint: String, signatures: Arc<SignatureStore>) -> Self {
        Self {
            model,
            fingerprint,
            signatures,
            message_start_sent: false,
            message_stop_sent: false,
            block_index: 0,
            open_block: None,
            stop_reason: None,
            saw_tool_use: false,
            input_tokens: 0,
            output_tokens: 0,
            tool_counter: 0,
        }
    }

    fn emit(&self, event: &str, data: Value) -> Bytes {
        Bytes::from(format!("event: {}\ndata: {}\n\n", event, data))
    }

    fn emit_message_start(&mut self) -> Bytes {
        self.message_start_sent = true;
        self.emit(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            }),
        )
    }

    fn open_block(&mut self, block: BlockType, content_block: Value) -> Bytes {
        self.open_block = Some(block);
        self.emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block
            }),
        )
    }

    fn close_block(&mut self) -> Option<Bytes> {
        if self.open_block.take().is_none() {
            return None;
        }
        let event = self.emit(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": self.block_index}),
        );
        self.block_index += 1;
        Some(event)
    }

    fn ensure_block(&mut self, block: BlockType, content_block: Value, out: &mut Vec<Bytes>) {
        if self.open_block == Some(block) {
            return;
        }
        if let Some(stop) = self.close_block() {
            out.push(stop);
        }
        out.push(self.open_block(block, content_block));
    }

    fn delta(&self, payload: Value) -> Bytes {
        self.emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": payload
            }),
        )
    }

    fn process_part(&mut self, part: &Value, out: &mut Vec<Bytes>) {
        let sig = part
            .get("thoughtSignature")
            .or_else(|| part.get("thought_signature"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if is_valid_signature(sig) {
            self.signatures.store(&self.fingerprint, sig);
        }

        if let Some(call) = part.get("functionCall") {
            self.saw_tool_use = true;
            self.tool_counter += 1;
            let name = call.get("name").and_then(Value::as_str).unwrap_or("");
            let args = call.get("args").cloned().unwrap_or(json!({}));
            if let Some(stop) = self.close_block() {
                out.push(stop);
            }
            out.push(self.open_block(
                BlockType::ToolUse,
                json!({
                    "type": "tool_use",
                    "id": format!("toolu_{}_{}", self.tool_counter, uuid::Uuid::new_v4().simple()),
                    "name": name,
                    "input": {}
                }),
            ));
            out.push(self.delta(json!({
                "type": "input_json_delta",
                "partial_json": args.to_string()
            })));
            if let Some(stop) = self.close_block() {
                out.push(stop);
            }
            return;
        }

        let Some(text) = part.get("text").and_then(Value::as_str) else {
            // Signature-only frames carry no renderable content.
            return;
        };
        let is_thought = part
            .get("thought")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if is_thought {
            self.ensure_block(
                BlockType::Thinking,
                json!({"type": "thinking", "thinking": ""}),
                out,
            );
            out.push(self.delta(json!({"type": "thinking_delta", "thinking": text})));
            if is_valid_signature(sig) {
                out.push(self.delta(json!({"type": "signature_delta", "signature": sig})));
            }
        } else if !text.is_empty() {
            self.ensure_block(BlockType::Text, json!({"type": "text", "text": ""}), out);
            out.push(self.delta(json!({"type": "text_delta", "text": text})));
        }
    }

    fn record_usage(&mut self, payload: &Value) {
        if let Some(usage) = payload.get("usageMetadata") {
            let prompt = usage
                .get("promptTokenCount")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let cached = usage
                .get("cachedContentTokenCount")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            self.input_tokens = (prompt - cached).max(0);
            if let Some(out_tokens) = usage.get("candidatesTokenCount").and_then(Value::as_i64) {
                self.output_tokens = out_tokens;
            }
        }
    }

    /// One decoded upstream frame → zero or more client events.
    pub fn process_frame(&mut self, frame: &Value) -> Vec<Bytes> {
        let payload = frame.get("response").unwrap_or(frame);
        let mut out = Vec::new();

        if !self.message_start_sent {
            out.push(self.emit_message_start());
        }
        self.record_usage(payload);

        if let Some(parts) = payload
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
        {
            for part in parts {
                self.process_part(part, &mut out);
            }
        }

        if let Some(reason) = payload
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("finishReason"))
            .and_then(Value::as_str)
        {
            self.stop_reason = Some(match reason {
                "MAX_TOKENS" => "max_tokens",
                _ => "end_turn",
            });
        }

        out
    }

    /// Closes any open block and finishes the message. Idempotent so both
    /// the terminating frame and stream end can call it.
    pub fn finish(&mut self) -> Vec<Bytes> {
        if self.message_stop_sent {
            return Vec::new();
        }
        let mut out = Vec::new();
        if !self.message_start_sent {
            out.push(self.emit_message_start());
        }
        if let Some(stop) = self.close_block() {
            out.push(stop);
        }
        let stop_reason = if self.saw_tool_use {
            "tool_use"
        } else {
            self.stop_reason.unwrap_or("end_turn")
        };
        out.push(self.emit(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {
                    "input_tokens": self.input_tokens,
                    "output_tokens": self.output_tokens
                }
            }),
        ));
        out.push(self.emit("message_stop", json!({"type": "message_stop"})));
        self.message_stop_sent = true;
        out
    }
}

/// Turns the upstream byte stream into a client event stream. Dropping the
/// returned stream drops the upstream response with it, so a client
/// disconnect cancels the upstream read instead of orphaning it.
pub fn create_message_stream(
    mut upstream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    model: String,
    fingerprint: String,
    signatures: Arc<SignatureStore>,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>> {
    use futures::StreamExt;

    Box::pin(async_stream::stream! {
        let mut state = StreamingState::new(model, fingerprint, signatures);
        let mut buffer = BytesMut::new();

        while let Some(chunk) = upstream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("[Stream] Upstream read failed mid-stream: {}", e);
                    break;
                }
            };
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line_raw = buffer.split_to(pos + 1);
                let Ok(line) = std::str::from_utf8(&line_raw) else {
                    continue;
                };
                let line = line.trim();
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data.is_empty() {
                    continue;
                }
                if data == "[DONE]" {
                    for event in state.finish() {
                        yield Ok(event);
                    }
                    return;
                }
                let Ok(frame) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                for event in state.process_frame(&frame) {
                    yield Ok(event);
                }
            }
        }

        for event in state.finish() {
            yield Ok(event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn collect(frames: Vec<String>) -> String {
        let upstream = async_stream::stream! {
            for frame in frames {
                yield Ok::<Bytes, reqwest::Error>(Bytes::from(frame));
            }
        };
        let signatures = Arc::new(SignatureStore::new());
        let mut stream = create_message_stream(
            Box::pin(upstream),
            "claude-sonnet-4-5".to_string(),
            "fp-test".to_string(),
            signatures,
        );
        let mut out = String::new();
        while let Some(item) = stream.next().await {
            out.push_str(&String::from_utf8(item.unwrap().to_vec()).unwrap());
        }
        out
    }

    #[test]
    fn block_transitions_emit_stop_start_pairs() {
        let signatures = Arc::new(SignatureStore::new());
        let mut state = StreamingState::new(
            "m".to_string(),
            "fp".to_string(),
            signatures,
        );

        let thinking = json!({"candidates": [{"content": {"parts": [
            {"text": "pondering", "thought": true}
        ]}}]});
        let text = json!({"candidates": [{"content": {"parts": [
            {"text": "answer"}
        ]}}]});

        let first: Vec<String> = state
            .process_frame(&thinking)
            .iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect();
        assert!(first[0].contains("message_start"));
        assert!(first[1].contains("content_block_start"));
        assert!(first[1].contains("thinking"));

        let second: Vec<String> = state
            .process_frame(&text)
            .iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect();
        assert!(second[0].contains("content_block_stop"));
        assert!(second[1].contains("content_block_start"));
        assert!(second[2].contains("text_delta"));
    }

    #[tokio::test]
    async fn full_stream_translates_in_order() {
        let frame = json!({"response": {
            "candidates": [{
                "content": {"parts": [{"text": "Hello"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5}
        }});
        let out = collect(vec![format!("data: {}\n\n", frame)]).await;

        let start = out.find("message_start").unwrap();
        let block = out.find("content_block_start").unwrap();
        let delta = out.find("text_delta").unwrap();
        let finish = out.find("message_delta").unwrap();
        let stop = out.find("message_stop").unwrap();
        assert!(start < block && block < delta && delta < finish && finish < stop);
        assert!(out.contains("\"output_tokens\":5"));
        assert!(out.contains("\"stop_reason\":\"end_turn\""));
    }

    #[tokio::test]
    async fn interrupted_stream_still_closes_the_message() {
        let frame = json!({"candidates": [{"content": {"parts": [{"text": "partial"}]}}]});
        let out = collect(vec![format!("data: {}\n", frame)]).await;
        assert!(out.contains("partial"));
        assert!(out.contains("message_stop"));
    }

    #[tokio::test]
    async fn done_frame_terminates_the_stream() {
        let out = collect(vec!["data: [DONE]\n".to_string()]).await;
        assert!(out.contains("message_start"));
        assert!(out.contains("message_stop"));
    }

    #[tokio::test]
    async fn function_call_becomes_tool_use_block() {
        let frame = json!({"candidates": [{
            "content": {"parts": [
                {"functionCall": {"name": "get_weather", "args": {"city": "Oslo"}}}
            ]},
            "finishReason": "STOP"
        }]});
        let out = collect(vec![format!("data: {}\n", frame)]).await;
        assert!(out.contains("tool_use"));
        assert!(out.contains("get_weather"));
        assert!(out.contains("input_json_delta"));
        assert!(out.contains("\"stop_reason\":\"tool_use\""));
    }

    #[tokio::test]
    async fn signatures_are_harvested_from_stream() {
        let frame = json!({"candidates": [{"content": {"parts": [
            {"text": "t", "thought": true, "thoughtSignature": "signature_that_is_long_enough"}
        ]}}]});
        let upstream = async_stream::stream! {
            yield Ok::<Bytes, reqwest::Error>(Bytes::from(format!("data: {}\n", frame)));
        };
        let signatures = Arc::new(SignatureStore::new());
        let mut stream = create_message_stream(
            Box::pin(upstream),
            "m".to_string(),
            "fp-sig".to_string(),
            signatures.clone(),
        );
        while stream.next().await.is_some() {}
        assert_eq!(
            signatures.lookup("fp-sig").as_deref(),
            Some("signature_that_is_long_enough")
        );
    }
}
