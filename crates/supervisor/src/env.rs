//! Child-process environment sanitation.
//!
//! Agent CLIs inherit the broker's environment minus a configured deny-list
//! and minus the marker variable the Claude CLI sets in its own children.
//! Leaving that one in place makes a spawned CLI believe it is nested inside
//! another agent and recurse.

/// Always stripped, regardless of configuration.
pub const LOOP_GUARD_ENV: &str = "CLAUDECODE";

/// Build the environment for a child process: current process env, minus the
/// deny-list and [`LOOP_GUARD_ENV`], plus adapter-provided extras (extras win
/// over inherited values).
pub fn sanitized_env(
    deny_list: &[String],
    extra: &[(String, String)],
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars()
        .filter(|(key, _)| key != LOOP_GUARD_ENV && !deny_list.iter().any(|d| d == key))
        .filter(|(key, _)| !extra.iter().any(|(k, _)| k == key))
        .collect();
    env.extend(extra.iter().cloned());
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_loop_guard() {
        std::env::set_var(LOOP_GUARD_ENV, "1");
        let env = sanitized_env(&[], &[]);
        assert!(!env.iter().any(|(k, _)| k == LOOP_GUARD_ENV));
        std::env::remove_var(LOOP_GUARD_ENV);
    }

    #[test]
    fn strips_deny_listed_keys() {
        std::env::set_var("BC_TEST_SECRET", "hunter2");
        let env = sanitized_env(&["BC_TEST_SECRET".to_string()], &[]);
        assert!(!env.iter().any(|(k, _)| k == "BC_TEST_SECRET"));
        std::env::remove_var("BC_TEST_SECRET");
    }

    #[test]
    fn extras_override_inherited() {
        std::env::set_var("BC_TEST_PATHY", "inherited");
        let env = sanitized_env(&[], &[("BC_TEST_PATHY".to_string(), "override".to_string())]);
        let values: Vec<_> = env
            .iter()
            .filter(|(k, _)| k == "BC_TEST_PATHY")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(values, vec!["override"]);
        std::env::remove_var("BC_TEST_PATHY");
    }

    #[test]
    fn keeps_everything_else() {
        std::env::set_var("BC_TEST_KEEP", "yes");
        let env = sanitized_env(&["OTHER".to_string()], &[]);
        assert!(env.iter().any(|(k, v)| k == "BC_TEST_KEEP" && v == "yes"));
        std::env::remove_var("BC_TEST_KEEP");
    }
}
