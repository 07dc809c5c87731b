//! Slash-command dispatch.
//!
//! A `/command` walks an ordered responsibility chain: locally emulated →
//! adapter-native → passthrough → unsupported.  The routing decision and the
//! emulated bodies are pure; the bridge performs the side effects.

use serde_json::Value;

use bc_domain::state::{Capabilities, CommandInfo};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-session catalog of known commands, fed by the capabilities handshake
/// and `session_init`'s `slash_commands` list.
#[derive(Default)]
pub struct SlashCommandRegistry {
    commands: Vec<CommandInfo>,
}

impl SlashCommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command, keeping the first-seen description for duplicates.
    pub fn register(&mut self, command: CommandInfo) {
        if !self.commands.iter().any(|c| c.name == command.name) {
            self.commands.push(command);
        }
    }

    pub fn register_all(&mut self, commands: &[CommandInfo]) {
        for command in commands {
            self.register(command.clone());
        }
    }

    pub fn register_names(&mut self, names: &[String]) {
        for name in names {
            self.register(CommandInfo {
                name: name.clone(),
                description: String::new(),
            });
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.iter().any(|c| c.name == name)
    }

    pub fn list(&self) -> &[CommandInfo] {
        &self.commands
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chain routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which handler claims a command.  Evaluated in order; the first match
/// wins, and `Unsupported` always handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlashRoute {
    Emulated,
    AdapterNative,
    Passthrough,
    Unsupported,
}

/// Commands always answered locally.
pub const LOCAL_COMMANDS: &[&str] = &["/help", "/clear"];

pub fn route(command: &str, claims_native: bool, supports_passthrough: bool) -> SlashRoute {
    let name = command.split_whitespace().next().unwrap_or(command);
    if LOCAL_COMMANDS.contains(&name) {
        SlashRoute::Emulated
    } else if claims_native {
        SlashRoute::AdapterNative
    } else if supports_passthrough {
        SlashRoute::Passthrough
    } else {
        SlashRoute::Unsupported
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Emulated bodies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Render the `/help` catalog: capabilities commands when present, the
/// `slash_commands` list otherwise, augmented with registry entries not
/// already listed.
pub fn help_body(
    capabilities: Option<&Capabilities>,
    slash_commands: &[String],
    registry: &SlashCommandRegistry,
) -> String {
    let mut commands: Vec<CommandInfo> = match capabilities {
        Some(caps) if !caps.commands.is_empty() => caps.commands.clone(),
        _ => slash_commands
            .iter()
            .map(|name| CommandInfo {
                name: name.clone(),
                description: String::new(),
            })
            .collect(),
    };
    for extra in registry.list() {
        if !commands.iter().any(|c| c.name == extra.name) {
            commands.push(extra.clone());
        }
    }

    let mut body = String::from("Available commands:\n");
    for command in &commands {
        body.push_str("  ");
        body.push_str(&command.name);
        if !command.description.is_empty() {
            body.push_str("  ");
            body.push_str(&command.description);
        }
        body.push('\n');
    }
    body
}

/// Render the `/clear` acknowledgement.
pub fn clear_body() -> String {
    "Conversation display cleared.".to_owned()
}

/// Best-effort text extraction from a result payload, for passthrough
/// command output.
pub fn result_body(captured: &str, result_meta: &Value) -> String {
    if !captured.is_empty() {
        return captured.to_owned();
    }
    result_meta
        .get("result")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_owned()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_order() {
        assert_eq!(route("/help", true, true), SlashRoute::Emulated);
        assert_eq!(route("/clear", false, false), SlashRoute::Emulated);
        assert_eq!(route("/cost", true, true), SlashRoute::AdapterNative);
        assert_eq!(route("/cost", false, true), SlashRoute::Passthrough);
        assert_eq!(route("/cost", false, false), SlashRoute::Unsupported);
    }

    #[test]
    fn route_ignores_arguments() {
        assert_eq!(route("/help verbose", false, false), SlashRoute::Emulated);
    }

    #[test]
    fn registry_dedupes_by_name() {
        let mut registry = SlashCommandRegistry::new();
        registry.register(CommandInfo {
            name: "/cost".into(),
            description: "Show cost".into(),
        });
        registry.register(CommandInfo {
            name: "/cost".into(),
            description: "other".into(),
        });
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.list()[0].description, "Show cost");
        assert!(registry.contains("/cost"));
        assert!(!registry.contains("/nope"));
    }

    #[test]
    fn help_body_from_capabilities() {
        let caps = Capabilities {
            commands: vec![CommandInfo {
                name: "/help".into(),
                description: "Help".into(),
            }],
            models: vec![],
            account: None,
            received_at: 0,
        };
        let body = help_body(Some(&caps), &[], &SlashCommandRegistry::new());
        assert!(body.contains("  /help"));
        assert!(body.contains("Help"));
    }

    #[test]
    fn help_body_falls_back_to_slash_commands() {
        let body = help_body(
            None,
            &["/help".to_string(), "/cost".to_string()],
            &SlashCommandRegistry::new(),
        );
        assert!(body.contains("  /help"));
        assert!(body.contains("  /cost"));
    }

    #[test]
    fn help_body_augments_from_registry() {
        let mut registry = SlashCommandRegistry::new();
        registry.register(CommandInfo {
            name: "/review".into(),
            description: String::new(),
        });
        let body = help_body(None, &["/help".to_string()], &registry);
        assert!(body.contains("  /help"));
        assert!(body.contains("  /review"));
    }

    #[test]
    fn result_body_prefers_captured_text() {
        let meta = serde_json::json!({"result": "from result"});
        assert_eq!(result_body("captured", &meta), "captured");
        assert_eq!(result_body("", &meta), "from result");
        assert_eq!(result_body("", &serde_json::json!({})), "");
    }
}
