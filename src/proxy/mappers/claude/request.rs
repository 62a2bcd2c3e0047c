use serde_json::{json, Map, Value};
use std::collections::HashMap;

use super::models::*;
use crate::constants;
use crate::proxy::signature_store::{turn_fingerprint, SignatureStore};

/// Transformer output: the upstream body plus routing metadata.
#[derive(Debug, Clone)]
pub struct RoutedRequest {
    pub body: Value,
    pub resolved_model: String,
    pub used_internal_endpoint: bool,
}

/// Deterministic model routing; names without a table entry pass through
/// verbatim.
pub fn resolve_model_route(model: &str) -> String {
    for (from, to) in constants::MODEL_ROUTES {
        if *from == model {
            return (*to).to_string();
        }
    }
    model.to_string()
}

/// The thinking-capable class on the internal surface.
pub fn is_thinking_capable(model: &str) -> bool {
    model.starts_with("gemini-3") || model.starts_with("claude-")
}

/// Fingerprint of the conversation's latest user turn; signatures observed
/// in responses are stored under this key.
pub fn conversation_fingerprint(messages: &[Message]) -> String {
    let text = messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.text())
        .unwrap_or_default();
    turn_fingerprint(&text)
}

fn system_contains_identity(system: &Option<SystemPrompt>) -> bool {
    match system {
        Some(SystemPrompt::String(text)) => text.contains("Antigravity"),
        Some(SystemPrompt::Array(blocks)) => blocks
            .iter()
            .any(|b| b.block_type == "text" && b.text.contains("Antigravity")),
        None => false,
    }
}

/// Builds `systemInstruction.parts`: the identity block first unless the
/// caller already speaks as Antigravity, then the caller's own prompt. The
/// identity block is injected at most once per request.
fn build_system_instruction(system: &Option<SystemPrompt>) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    if !system_contains_identity(system) {
        parts.push(json!({"text": constants::identity_block()}));
    }
    match system {
        Some(SystemPrompt::String(text)) => parts.push(json!({"text": text})),
        Some(SystemPrompt::Array(blocks)) => {
            for block in blocks {
                if block.block_type == "text" {
                    parts.push(json!({"text": block.text}));
                }
            }
        }
        None => {}
    }
    json!({"role": "user", "parts": parts})
}

// The internal surface rejects draft-07 metadata keys inside tool schemas.
fn clean_tool_schema(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            map.remove("$schema");
            map.remove("additionalProperties");
            for (_, v) in map.iter_mut() {
                clean_tool_schema(v);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                clean_tool_schema(item);
            }
        }
        _ => {}
    }
}

fn build_tools(tools: &[Tool]) -> Value {
    let declarations: Vec<Value> = tools
        .iter()
        .map(|tool| {
            let mut schema = tool.input_schema.clone().unwrap_or(json!({
                "type": "object",
                "properties": {}
            }));
            clean_tool_schema(&mut schema);
            json!({
                "name": tool.name,
                "description": tool.description,
                "parameters": schema
            })
        })
        .collect();
    json!([{"functionDeclarations": declarations}])
}

fn tool_result_response(content: &Option<Value>) -> Value {
    match content {
        Some(Value::String(text)) => json!({"result": text}),
        Some(other) => json!({"result": other}),
        None => json!({"result": ""}),
    }
}

/// `messages[]` → `contents[]`, order preserved. Tool-call and tool-result
/// blocks become typed parts; signed thinking blocks are carried as thought
/// parts and unsigned ones are dropped.
fn build_contents(messages: &[Message]) -> Result<Vec<Value>, String> {
    let mut tool_id_to_name: HashMap<String, String> = HashMap::new();
    let mut contents = Vec::new();

    for message in messages {
        let role = if message.role == "assistant" {
            "model"
        } else {
            "user"
        };
        let mut parts: Vec<Value> = Vec::new();

        match &message.content {
            MessageContent::String(text) => {
                if !text.is_empty() {
                    parts.push(json!({"text": text}));
                }
            }
            MessageContent::Array(blocks) => {
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            if !text.is_empty() {
                                parts.push(json!({"text": text}));
                            }
                        }
                        ContentBlock::Thinking {
                            thinking,
                            signature,
                        } => match signature {
                            Some(sig)
                                if crate::proxy::signature_store::is_valid_signature(sig) =>
                            {
                                parts.push(json!({
                                    "text": thinking,
                                    "thought": true,
                                    "thoughtSignature": sig
                                }));
                            }
                            _ => {
                                tracing::debug!(
                                    "[Transform] Dropping unsigned thinking block from history"
                                );
                            }
                        },
                        ContentBlock::ToolUse { id, name, input } => {
                            tool_id_to_name.insert(id.clone(), name.clone());
                            parts.push(json!({
                                "functionCall": {"name": name, "args": input}
                            }));
                        }
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } => {
                            let name = tool_id_to_name
                                .get(tool_use_id)
                                .cloned()
                                .ok_or_else(|| {
                                    format!("tool_result references unknown tool_use id {}", tool_use_id)
                                })?;
                            parts.push(json!({
                                "functionResponse": {
                                    "name": name,
                                    "response": tool_result_response(content)
                                }
                            }));
                        }
                    }
                }
            }
        }

        if !parts.is_empty() {
            contents.push(json!({"role": role, "parts": parts}));
        }
    }

    Ok(contents)
}

fn build_generation_config(
    request: &ClaudeRequest,
    resolved_model: &str,
    signatures: &SignatureStore,
    fingerprint: &str,
) -> Value {
    let mut config = Map::new();

    if let Some(thinking) = &request.thinking {
        if thinking.is_enabled() && is_thinking_capable(resolved_model) {
            let tools_present = request
                .tools
                .as_ref()
                .map(|t| !t.is_empty())
                .unwrap_or(false);
            let has_signature =
                signatures.lookup(fingerprint).is_some() || signatures.has_valid();

            if tools_present && !has_signature {
                // Prior function-call turns without thought signatures make
                // the upstream reject thinking with a 400; degrade quietly.
                tracing::warn!(
                    "[Transform] Tools declared with no stored thought signature, dropping thinkingConfig"
                );
            } else {
                let budget = thinking.budget_tokens.unwrap_or(16000);
                config.insert(
                    "thinkingConfig".to_string(),
                    json!({"includeThoughts": true, "thinkingBudget": budget}),
                );
            }
        }
    }

    if let Some(max_tokens) = request.max_tokens {
        config.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        config.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        config.insert("topP".to_string(), json!(top_p));
    }
    if let Some(top_k) = request.top_k {
        config.insert("topK".to_string(), json!(top_k));
    }
    if let Some(stops) = &request.stop_sequences {
        if !stops.is_empty() {
            config.insert("stopSequences".to_string(), json!(stops));
        }
    }

    Value::Object(config)
}

/// Pure dialect rewrite: no I/O, the signature store is the only injected
/// dependency.
pub fn transform_request(
    request: &ClaudeRequest,
    project_id: &str,
    signatures: &SignatureStore,
) -> Result<RoutedRequest, String> {
    let resolved_model = resolve_model_route(&request.model);
    let fingerprint = conversation_fingerprint(&request.messages);

    let contents = build_contents(&request.messages)?;
    let system_instruction = build_system_instruction(&request.system);
    let generation_config =
        build_generation_config(request, &resolved_model, signatures, &fingerprint);

    let mut inner = json!({
        "contents": contents,
        "systemInstruction": system_instruction,
    });
    if !generation_config.as_object().map(Map::is_empty).unwrap_or(true) {
        inner["generationConfig"] = generation_config;
    }
    if let Some(tools) = &request.tools {
        if !tools.is_empty() {
            inner["tools"] = build_tools(tools);
            inner["toolConfig"] = json!({
                "functionCallingConfig": {"mode": "VALIDATED"}
            });
        }
    }
    if let Some(user_id) = request.metadata.as_ref().and_then(|m| m.user_id.as_ref()) {
        inner["sessionId"] = json!(user_id);
    }

    let body = json!({
        "project": project_id,
        "requestId": format!("agent-{}", uuid::Uuid::new_v4()),
        "request": inner,
        "model": resolved_model,
        "userAgent": "antigravity",
        "requestType": "agent",
    });

    Ok(RoutedRequest {
        body,
        resolved_model,
        used_internal_endpoint: true,
    })
}
