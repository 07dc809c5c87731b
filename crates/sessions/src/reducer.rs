//! Pure session-state reducer.
//!
//! `reduce(state, message, team_buffer)` applies one unified message and
//! returns `Some(new_state)` only when a field actually changed, so the
//! bridge can keep reference equality for unchanged states.  Every message,
//! not only the explicitly owned types, threads through the team-tools pass.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;

use bc_domain::message::{ContentBlock, MessageType, UnifiedMessage};
use bc_domain::state::{Capabilities, McpServerStatus, ModelUsage, SessionState};

use crate::team::{apply_team_tool, TeamCorrelationBuffer};

/// Apply one message.  `None` means nothing changed.
pub fn reduce(
    state: &SessionState,
    msg: &UnifiedMessage,
    team: &mut TeamCorrelationBuffer,
) -> Option<SessionState> {
    let mut next = state.clone();

    match msg.kind {
        MessageType::SessionInit => apply_session_init(&mut next, msg),
        MessageType::StatusChange => apply_status_change(&mut next, msg),
        MessageType::Result => apply_result(&mut next, msg),
        MessageType::ControlResponse => apply_control_response(&mut next, msg),
        _ => {}
    }

    apply_team_pass(&mut next, msg, team, Instant::now());

    if next == *state {
        None
    } else {
        Some(next)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Owned message types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn string_list(value: &Value) -> Option<Vec<String>> {
    value.as_array().map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect()
    })
}

/// Overwrite string/array fields when present; everything absent is
/// preserved.
fn apply_session_init(state: &mut SessionState, msg: &UnifiedMessage) {
    let meta = &msg.metadata;
    if let Some(model) = msg.meta_str("model") {
        state.model = Some(model.to_owned());
    }
    if let Some(cwd) = msg.meta_str("cwd") {
        state.cwd = Some(cwd.to_owned());
    }
    if let Some(tools) = meta.get("tools").and_then(string_list) {
        state.tools = tools;
    }
    if let Some(mode) = msg.meta_str("permissionMode") {
        state.permission_mode = Some(mode.to_owned());
    }
    if let Some(version) = msg.meta_str("claude_code_version") {
        state.claude_code_version = Some(version.to_owned());
    }
    if let Some(servers) = meta.get("mcp_servers").and_then(Value::as_array) {
        state.mcp_servers = servers
            .iter()
            .filter_map(|s| {
                Some(McpServerStatus {
                    name: s.get("name")?.as_str()?.to_owned(),
                    status: s
                        .get("status")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_owned(),
                })
            })
            .collect();
    }
    if let Some(agents) = meta.get("agents").and_then(string_list) {
        state.agents = agents;
    }
    if let Some(commands) = meta.get("slash_commands").and_then(string_list) {
        state.slash_commands = commands;
    }
    if let Some(skills) = meta.get("skills").and_then(string_list) {
        state.skills = skills;
    }
}

fn apply_status_change(state: &mut SessionState, msg: &UnifiedMessage) {
    if let Some(status) = msg.meta_str("status") {
        state.is_compacting = status == "compacting";
    }
    if let Some(mode) = msg.meta_str("permissionMode") {
        state.permission_mode = Some(mode.to_owned());
    }
}

fn apply_result(state: &mut SessionState, msg: &UnifiedMessage) {
    if let Some(cost) = msg.meta_f64("total_cost_usd") {
        state.total_cost_usd = cost;
    }
    if let Some(turns) = msg.meta_u64("num_turns") {
        state.num_turns = turns;
    }
    if let Some(duration) = msg.meta_u64("duration_ms") {
        state.last_duration_ms = Some(duration);
    }
    if let Some(duration) = msg.meta_u64("duration_api_ms") {
        state.last_duration_api_ms = Some(duration);
    }
    if let Some(added) = msg.meta_u64("total_lines_added") {
        state.total_lines_added = added;
    }
    if let Some(removed) = msg.meta_u64("total_lines_removed") {
        state.total_lines_removed = removed;
    }

    if let Some(usage_obj) = msg.metadata.get("modelUsage").and_then(Value::as_object) {
        let mut usage_map = HashMap::new();
        let mut percent = None;
        for (model, usage) in usage_obj {
            let entry = ModelUsage {
                input_tokens: usage.get("inputTokens").and_then(Value::as_u64).unwrap_or(0),
                output_tokens: usage
                    .get("outputTokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                context_window: usage
                    .get("contextWindow")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            };
            if entry.context_window > 0 {
                let used = (entry.input_tokens + entry.output_tokens) as f64;
                percent = Some(
                    ((used / entry.context_window as f64) * 100.0).round() as u8,
                );
            }
            usage_map.insert(model.clone(), entry);
        }
        if let Some(percent) = percent {
            state.context_used_percent = percent.min(100);
        }
        state.last_model_usage = Some(usage_map);
    }
}

fn apply_control_response(state: &mut SessionState, msg: &UnifiedMessage) {
    let Some(response) = msg.metadata.get("response") else {
        return;
    };
    if response.get("subtype").and_then(Value::as_str) != Some("success") {
        return;
    }
    let Some(body) = response.get("response").and_then(Value::as_object) else {
        return;
    };
    if !body.contains_key("commands") && !body.contains_key("models") {
        return;
    }
    state.capabilities = Some(Capabilities {
        commands: body
            .get("commands")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default(),
        models: body
            .get("models")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default(),
        account: body.get("account").cloned(),
        received_at: msg.timestamp,
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Team pass
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn apply_team_pass(
    state: &mut SessionState,
    msg: &UnifiedMessage,
    team: &mut TeamCorrelationBuffer,
    now: Instant,
) {
    for block in &msg.content {
        match block {
            ContentBlock::ToolUse { id, name, input } => {
                team.buffer_tool_use(id, name, input, now);
            }
            ContentBlock::ToolResult {
                tool_use_id,
                is_error,
                ..
            } => {
                if let Some(entry) = team.correlate(tool_use_id, now) {
                    if is_error != &Some(true) {
                        apply_team_tool(state, &entry.name, &entry.input);
                    }
                }
            }
            _ => {}
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
