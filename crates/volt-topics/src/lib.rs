//! Canonical broker topic layout shared across the runtime.
//!
//! All intra-runtime traffic lives below a configurable internal prefix
//! (`<prefix>/...`); user-visible MQTT traffic lives below a separate external
//! prefix. This crate centralizes how those topics are built so the manager,
//! the bus and the tests stay in sync, and provides the MQTT wildcard
//! matching (`+` single level, `#` multi level) used by the dispatcher.

/// Suffix of the per-module ready topic and name of the global ready topic.
pub const READY: &str = "ready";

/// Joins non-empty segments with `/`. The prefix is expected without a
/// trailing slash (settings normalize this on load).
fn join(parts: &[&str]) -> String {
    let mut out = String::new();
    for part in parts {
        if part.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

/// `<prefix>/ready` - the global ready signal.
pub fn global_ready(prefix: &str) -> String {
    join(&[prefix, READY])
}

/// `<prefix>/modules/<module_id>`
pub fn module_prefix(prefix: &str, module_id: &str) -> String {
    join(&[prefix, "modules", module_id])
}

/// `<prefix>/modules/<module_id>/ready` - the per-module ready signal.
pub fn module_ready(prefix: &str, module_id: &str) -> String {
    join(&[prefix, "modules", module_id, READY])
}

/// `<prefix>/modules/<module_id>/<impl_id>`
pub fn impl_prefix(prefix: &str, module_id: &str, impl_id: &str) -> String {
    join(&[prefix, "modules", module_id, impl_id])
}

/// `<prefix>/modules/<target>/<impl>/cmd/<name>` - command request topic.
pub fn cmd_request(prefix: &str, module_id: &str, impl_id: &str, cmd: &str) -> String {
    join(&[prefix, "modules", module_id, impl_id, "cmd", cmd])
}

/// `<prefix>/modules/<origin>/<impl>/cmd/<name>/<call_id>` - where the target
/// answers a specific call.
pub fn cmd_result(prefix: &str, module_id: &str, impl_id: &str, cmd: &str, call_id: &str) -> String {
    join(&[prefix, "modules", module_id, impl_id, "cmd", cmd, call_id])
}

/// `<prefix>/modules/<module_id>/<impl_id>/var/<name>` - variable publishes.
pub fn var_publish(prefix: &str, module_id: &str, impl_id: &str, var: &str) -> String {
    join(&[prefix, "modules", module_id, impl_id, "var", var])
}

/// `<prefix>/modules/<module_id>/<impl_id>/error/raise`
pub fn error_raise(prefix: &str, module_id: &str, impl_id: &str) -> String {
    join(&[prefix, "modules", module_id, impl_id, "error", "raise"])
}

/// `<prefix>/modules/<module_id>/<impl_id>/error/clear`
pub fn error_clear(prefix: &str, module_id: &str, impl_id: &str) -> String {
    join(&[prefix, "modules", module_id, impl_id, "error", "clear"])
}

/// Raise topics of every module/implementation, for the global error bus.
pub fn error_raise_all(prefix: &str) -> String {
    join(&[prefix, "modules", "+", "+", "error", "raise"])
}

/// Clear topics of every module/implementation, for the global error bus.
pub fn error_clear_all(prefix: &str) -> String {
    join(&[prefix, "modules", "+", "+", "error", "clear"])
}

/// Checks whether a concrete `topic` matches a subscription `filter`.
///
/// Follows the MQTT filter rules: `+` matches exactly one level, `#` matches
/// the rest of the topic and, as a trailing `/#`, also zero levels (so `a/#`
/// matches `a` itself).
pub fn matches(topic: &str, filter: &str) -> bool {
    if topic == filter {
        return true;
    }

    // a trailing "/#" also covers the parent level itself
    if let Some(parent) = filter.strip_suffix("/#") {
        if matches(topic, parent) {
            return true;
        }
    }

    let topic_parts: Vec<&str> = topic.split('/').collect();
    let filter_parts: Vec<&str> = filter.split('/').collect();

    for (idx, part) in topic_parts.iter().enumerate() {
        match filter_parts.get(idx) {
            None => return false,
            Some(&"+") => continue,
            Some(&"#") => return true,
            Some(p) if p == part => continue,
            Some(_) => return false,
        }
    }

    topic_parts.len() == filter_parts.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_module_topics() {
        assert_eq!(module_ready("volt", "store"), "volt/modules/store/ready");
        assert_eq!(
            cmd_request("volt", "store", "main", "open"),
            "volt/modules/store/main/cmd/open"
        );
        assert_eq!(
            cmd_result("volt", "ui", "main", "open", "17"),
            "volt/modules/ui/main/cmd/open/17"
        );
        assert_eq!(global_ready("volt"), "volt/ready");
    }

    #[test]
    fn empty_prefix_produces_bare_topics() {
        assert_eq!(module_ready("", "store"), "modules/store/ready");
        assert_eq!(global_ready(""), "ready");
    }

    #[test]
    fn verbatim_topics_match() {
        assert!(matches("a/b/c", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
        assert!(!matches("a/b", "a/b/c"));
    }

    #[test]
    fn single_level_wildcard_matches_one_level() {
        assert!(matches("a/b/c", "a/+/c"));
        assert!(matches("a/b", "a/+"));
        assert!(!matches("a/b/c", "a/+"));
        assert!(!matches("a", "a/+"));
    }

    #[test]
    fn multi_level_wildcard_matches_remainder() {
        assert!(matches("a/b/c", "a/#"));
        assert!(matches("a/b", "#"));
        assert!(matches("a", "a/#"));
        assert!(!matches("b/c", "a/#"));
    }

    #[test]
    fn error_fanout_filter_matches_raise_topics() {
        let filter = error_raise_all("volt");
        assert!(matches(&error_raise("volt", "evse", "main"), &filter));
        assert!(!matches(&error_clear("volt", "evse", "main"), &filter));
    }
}
