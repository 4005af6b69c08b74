//! `[user@]host:path` parsing for command-line operands

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpec {
    /// Host as handed to ssh, including any `user@`
    pub host: String,
    pub path: String,
}

/// Parse a remote operand. Local paths (no colon before the first slash)
/// give `None`.
pub fn parse_remote(operand: &str) -> Option<RemoteSpec> {
    let s = operand.trim();
    let colon = s.find(':')?;
    if let Some(slash) = s.find('/') {
        if slash < colon {
            return None;
        }
    }
    let (host, path) = (&s[..colon], &s[colon + 1..]);
    if host.is_empty() || host.ends_with('@') {
        return None;
    }
    Some(RemoteSpec {
        host: host.to_string(),
        path: if path.is_empty() {
            ".".to_string()
        } else {
            path.to_string()
        },
    })
}
