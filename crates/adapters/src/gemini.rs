//! Gemini adapter.
//!
//! The Gemini CLI speaks ACP when launched with `--experimental-acp`, so the
//! adapter is the ACP adapter under a different name and launch line.

use crate::acp::AcpAdapter;

/// Build the Gemini backend adapter.
pub fn gemini_adapter() -> AcpAdapter {
    AcpAdapter::named("gemini", "gemini", vec!["--experimental-acp".into()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::BackendAdapter;

    #[test]
    fn named_and_flagged() {
        let adapter = gemini_adapter();
        assert_eq!(adapter.name(), "gemini");
        // Capability set inherited from ACP.
        assert!(adapter.capabilities().permissions);
        assert!(!adapter.capabilities().slash_commands);
    }
}
