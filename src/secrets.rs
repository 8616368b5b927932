//! Sensitive-environment-variable filtering, shared by the Hook Runner and
//! the Process Supervisor — both strip the same blocklist before handing an
//! environment to a child process, per spec.md §4.3/§4.5.

/// Returns true when `key` should never reach a spawned child's environment
/// or a log line: any key containing `API_KEY`, `TOKEN`, or `SECRET`
/// (case-insensitive), per spec.md §4.3's configurable minimum.
pub fn is_sensitive(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    ["API_KEY", "TOKEN", "SECRET"]
        .iter()
        .any(|s| upper.contains(s))
}
