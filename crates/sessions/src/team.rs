//! Team-tool correlation.
//!
//! Agent teams mutate shared state through tool calls (`TeamCreate`,
//! `TaskUpdate`, …).  A `tool_use` block alone proves nothing, since the tool
//! may still fail, so uses are buffered here and applied only when the matching
//! `tool_result` arrives without an error.  Uncorrelated entries expire
//! after a TTL so the buffer cannot grow unbounded.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;

use bc_domain::state::{SessionState, TeamMember, TeamState, TeamTask};

pub const TEAM_TOOL_TTL: Duration = Duration::from_secs(30);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Recognition
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const TEAM_TOOLS: &[&str] = &[
    "TeamCreate",
    "TeamDelete",
    "TeamAddMember",
    "TeamRemoveMember",
    "TaskCreate",
    "TaskUpdate",
    "TaskComplete",
];

/// Resolve a tool name to its team operation, accepting both the bare form
/// and the `mcp__team__` MCP prefix.
pub fn team_tool_name(name: &str) -> Option<&str> {
    let bare = name.strip_prefix("mcp__team__").unwrap_or(name);
    TEAM_TOOLS.iter().find(|t| **t == bare).copied()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Correlation buffer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct BufferedToolUse {
    pub name: String,
    pub input: Value,
    inserted_at: Instant,
}

/// Pairs team `tool_use` blocks with their eventual `tool_result`.
pub struct TeamCorrelationBuffer {
    ttl: Duration,
    entries: HashMap<String, BufferedToolUse>,
}

impl Default for TeamCorrelationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TeamCorrelationBuffer {
    pub fn new() -> Self {
        Self::with_ttl(TEAM_TOOL_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Buffer a tool_use block when it is a recognized team tool.  Returns
    /// true when buffered.
    pub fn buffer_tool_use(&mut self, id: &str, name: &str, input: &Value, now: Instant) -> bool {
        let Some(tool) = team_tool_name(name) else {
            return false;
        };
        self.prune(now);
        self.entries.insert(
            id.to_owned(),
            BufferedToolUse {
                name: tool.to_owned(),
                input: input.clone(),
                inserted_at: now,
            },
        );
        true
    }

    /// Take the buffered use matching a tool_result, if still fresh.
    pub fn correlate(&mut self, tool_use_id: &str, now: Instant) -> Option<BufferedToolUse> {
        self.prune(now);
        self.entries.remove(tool_use_id)
    }

    fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| now.duration_since(entry.inserted_at) <= ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Team-state application
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn input_str<'a>(input: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| input.get(k).and_then(Value::as_str))
}

/// Apply a confirmed team tool to the session state.  Returns true when any
/// field changed.
pub fn apply_team_tool(state: &mut SessionState, name: &str, input: &Value) -> bool {
    match name {
        "TeamCreate" => {
            let team_name = input_str(input, &["name", "team_name"]).unwrap_or("team");
            state.team = Some(TeamState {
                name: team_name.to_owned(),
                role: input_str(input, &["role"]).unwrap_or("lead").to_owned(),
                members: Vec::new(),
                tasks: Vec::new(),
            });
            true
        }
        "TeamDelete" => {
            if state.team.is_none() && state.agents.is_empty() {
                return false;
            }
            state.team = None;
            state.agents = Vec::new();
            true
        }
        "TeamAddMember" => {
            let Some(member_name) = input_str(input, &["name", "member"]) else {
                return false;
            };
            let Some(team) = state.team.as_mut() else {
                return false;
            };
            if team.members.iter().any(|m| m.name == member_name) {
                return false;
            }
            team.members.push(TeamMember {
                name: member_name.to_owned(),
                agent_type: input_str(input, &["agent_type"]).map(str::to_owned),
            });
            state.agents.push(member_name.to_owned());
            true
        }
        "TeamRemoveMember" => {
            let Some(member_name) = input_str(input, &["name", "member"]) else {
                return false;
            };
            let Some(team) = state.team.as_mut() else {
                return false;
            };
            let before = team.members.len();
            team.members.retain(|m| m.name != member_name);
            state.agents.retain(|a| a != member_name);
            before != team.members.len()
        }
        "TaskCreate" => {
            let Some(team) = state.team.as_mut() else {
                return false;
            };
            let Some(subject) = input_str(input, &["subject", "title"]) else {
                return false;
            };
            let id = input_str(input, &["id", "task_id"])
                .map(str::to_owned)
                .unwrap_or_else(|| (team.tasks.len() + 1).to_string());
            team.tasks.push(TeamTask {
                id,
                subject: subject.to_owned(),
                status: input_str(input, &["status"]).unwrap_or("pending").to_owned(),
                owner: input_str(input, &["owner"]).map(str::to_owned),
            });
            true
        }
        "TaskUpdate" => {
            let Some(team) = state.team.as_mut() else {
                return false;
            };
            let Some(id) = input_str(input, &["id", "task_id"]) else {
                return false;
            };
            let Some(task) = team.tasks.iter_mut().find(|t| t.id == id) else {
                return false;
            };
            let mut changed = false;
            if let Some(status) = input_str(input, &["status"]) {
                if task.status != status {
                    task.status = status.to_owned();
                    changed = true;
                }
            }
            if let Some(subject) = input_str(input, &["subject", "title"]) {
                if task.subject != subject {
                    task.subject = subject.to_owned();
                    changed = true;
                }
            }
            if let Some(owner) = input_str(input, &["owner"]) {
                if task.owner.as_deref() != Some(owner) {
                    task.owner = Some(owner.to_owned());
                    changed = true;
                }
            }
            changed
        }
        "TaskComplete" => {
            let Some(team) = state.team.as_mut() else {
                return false;
            };
            let Some(id) = input_str(input, &["id", "task_id"]) else {
                return false;
            };
            let Some(task) = team.tasks.iter_mut().find(|t| t.id == id) else {
                return false;
            };
            if task.status == "completed" {
                return false;
            }
            task.status = "completed".to_owned();
            true
        }
        _ => false,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recognizes_bare_and_prefixed_names() {
        assert_eq!(team_tool_name("TeamCreate"), Some("TeamCreate"));
        assert_eq!(team_tool_name("mcp__team__TaskUpdate"), Some("TaskUpdate"));
        assert_eq!(team_tool_name("Bash"), None);
    }

    #[test]
    fn buffer_and_correlate() {
        let mut buffer = TeamCorrelationBuffer::new();
        let now = Instant::now();
        assert!(buffer.buffer_tool_use("t1", "TeamCreate", &json!({"name": "alpha"}), now));
        assert!(!buffer.buffer_tool_use("t2", "Bash", &json!({}), now));
        assert_eq!(buffer.len(), 1);

        let entry = buffer.correlate("t1", now).unwrap();
        assert_eq!(entry.name, "TeamCreate");
        assert!(buffer.is_empty());
        assert!(buffer.correlate("t1", now).is_none());
    }

    #[test]
    fn uncorrelated_entries_expire() {
        let mut buffer = TeamCorrelationBuffer::with_ttl(Duration::from_millis(10));
        let now = Instant::now();
        buffer.buffer_tool_use("t1", "TaskCreate", &json!({"subject": "x"}), now);
        assert!(buffer
            .correlate("t1", now + Duration::from_millis(50))
            .is_none());
    }

    #[test]
    fn team_create_and_delete() {
        let mut state = SessionState::new("s1");
        assert!(apply_team_tool(
            &mut state,
            "TeamCreate",
            &json!({"name": "alpha", "role": "lead"})
        ));
        assert_eq!(state.team.as_ref().unwrap().name, "alpha");

        state.agents = vec!["worker".into()];
        assert!(apply_team_tool(&mut state, "TeamDelete", &json!({})));
        assert!(state.team.is_none());
        assert!(state.agents.is_empty());
        // Second delete is a no-op.
        assert!(!apply_team_tool(&mut state, "TeamDelete", &json!({})));
    }

    #[test]
    fn member_lifecycle_mirrors_agents() {
        let mut state = SessionState::new("s1");
        apply_team_tool(&mut state, "TeamCreate", &json!({"name": "alpha"}));

        assert!(apply_team_tool(
            &mut state,
            "TeamAddMember",
            &json!({"name": "researcher", "agent_type": "general"})
        ));
        assert_eq!(state.agents, vec!["researcher"]);
        // Duplicate add is a no-op.
        assert!(!apply_team_tool(
            &mut state,
            "TeamAddMember",
            &json!({"name": "researcher"})
        ));

        assert!(apply_team_tool(
            &mut state,
            "TeamRemoveMember",
            &json!({"name": "researcher"})
        ));
        assert!(state.agents.is_empty());
        assert!(state.team.as_ref().unwrap().members.is_empty());
    }

    #[test]
    fn task_lifecycle() {
        let mut state = SessionState::new("s1");
        apply_team_tool(&mut state, "TeamCreate", &json!({"name": "alpha"}));

        assert!(apply_team_tool(
            &mut state,
            "TaskCreate",
            &json!({"id": "7", "subject": "write tests"})
        ));
        assert!(apply_team_tool(
            &mut state,
            "TaskUpdate",
            &json!({"id": "7", "status": "in_progress", "owner": "researcher"})
        ));
        let task = &state.team.as_ref().unwrap().tasks[0];
        assert_eq!(task.status, "in_progress");
        assert_eq!(task.owner.as_deref(), Some("researcher"));

        assert!(apply_team_tool(&mut state, "TaskComplete", &json!({"id": "7"})));
        assert_eq!(state.team.as_ref().unwrap().tasks[0].status, "completed");
        assert!(!apply_team_tool(&mut state, "TaskComplete", &json!({"id": "7"})));
    }

    #[test]
    fn task_ops_without_team_are_noops() {
        let mut state = SessionState::new("s1");
        assert!(!apply_team_tool(
            &mut state,
            "TaskCreate",
            &json!({"subject": "x"})
        ));
        assert!(!apply_team_tool(
            &mut state,
            "TeamAddMember",
            &json!({"name": "m"})
        ));
    }
}
