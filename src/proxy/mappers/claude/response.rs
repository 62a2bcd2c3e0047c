use serde_json::{json, Value};

use crate::proxy::signature_store::{is_valid_signature, SignatureStore};

fn map_stop_reason(finish_reason: Option<&str>, saw_tool_use: bool) -> &'static str {
    if saw_tool_use {
        return "tool_use";
    }
    match finish_reason {
        Some("MAX_TOKENS") => "max_tokens",
        Some("STOP") | None | Some(_) => "end_turn",
    }
}

fn usage_from(gemini: &Value) -> Value {
    let usage = gemini.get("usageMetadata").cloned().unwrap_or(json!({}));
    let prompt = usage
        .get("promptTokenCount")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let cached = usage
        .get("cachedContentTokenCount")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let output = usage
        .get("candidatesTokenCount")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    json!({
        "input_tokens": (prompt - cached).max(0),
        "output_tokens": output,
    })
}

/// Walks a decoded upstream payload and records every thought signature it
/// carries under the conversation's fingerprint. Echoing a stored
/// signature back in a later turn is what keeps thinking mode alive.
pub fn harvest_signatures(gemini: &Value, fingerprint: &str, signatures: &SignatureStore) {
    let Some(parts) = candidate_parts(gemini) else {
        return;
    };
    for part in parts {
        let sig = part
            .get("thoughtSignature")
            .or_else(|| part.get("thought_signature"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if is_valid_signature(sig) {
            signatures.store(fingerprint, sig);
        }
    }
}

fn candidate_parts(gemini: &Value) -> Option<&Vec<Value>> {
    gemini
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()
}

/// Decoded dialect-B payload → a dialect-A message body.
pub fn translate_response(gemini: &Value, model: &str) -> Value {
    let mut content: Vec<Value> = Vec::new();
    let mut saw_tool_use = false;
    let mut tool_index = 0usize;

    if let Some(parts) = candidate_parts(gemini) {
        for part in parts {
            let is_thought = part
                .get("thought")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if is_thought {
                    let mut block = json!({"type": "thinking", "thinking": text});
                    if let Some(sig) = part.get("thoughtSignature").and_then(Value::as_str) {
                        block["signature"] = json!(sig);
                    }
                    content.push(block);
                } else if !text.is_empty() {
                    content.push(json!({"type": "text", "text": text}));
                }
                continue;
            }
            if let Some(call) = part.get("functionCall") {
                saw_tool_use = true;
                tool_index += 1;
                let name = call.get("name").and_then(Value::as_str).unwrap_or("");
                content.push(json!({
                    "type": "tool_use",
                    "id": format!("toolu_{}_{}", tool_index, uuid::Uuid::new_v4().simple()),
                    "name": name,
                    "input": call.get("args").cloned().unwrap_or(json!({}))
                }));
            }
        }
    }

    let finish_reason = gemini
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finishReason"))
        .and_then(Value::as_str);

    let id = gemini
        .get("responseId")
        .and_then(Value::as_str)
        .map(|r| format!("msg_{}", r))
        .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple()));

    json!({
        "id": id,
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": map_stop_reason(finish_reason, saw_tool_use),
        "stop_sequence": null,
        "usage": usage_from(gemini),
    })
}
