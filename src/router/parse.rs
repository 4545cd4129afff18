// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! `@name` addressing syntax.

use once_cell::sync::Lazy;
use regex::Regex;

/// `@word` followed by whitespace and a non-empty remainder. `(?s)` lets the
/// remainder span lines.
static ADDRESS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^@(\w+)\s+(.+)$").expect("address regex is valid"));

/// Name that addresses every registered agent.
pub const BROADCAST_NAME: &str = "all";

/// A user message after addressing has been stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    /// The input exactly as received.
    pub original: String,
    /// Text to hand to the agent.
    pub content: String,
    /// Lower-cased `@name`, when one was given (and was not `@all`).
    pub target_agent: Option<String>,
    /// Set by `@all`.
    pub target_all: bool,
}

/// Split `raw` into addressing and content.
pub fn parse_message(raw: &str) -> ParsedMessage {
    let trimmed = raw.trim();

    if let Some(caps) = ADDRESS_REGEX.captures(trimmed) {
        let name = caps[1].to_lowercase();
        let content = caps[2].to_string();
        let target_all = name == BROADCAST_NAME;
        return ParsedMessage {
            original: raw.to_string(),
            content,
            target_agent: if target_all { None } else { Some(name) },
            target_all,
        };
    }

    ParsedMessage {
        original: raw.to_string(),
        content: trimmed.to_string(),
        target_agent: None,
        target_all: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_address() {
        let parsed = parse_message("@Coder fix the bug");
        assert_eq!(parsed.target_agent.as_deref(), Some("coder"));
        assert_eq!(parsed.content, "fix the bug");
        assert!(!parsed.target_all);
        assert_eq!(parsed.original, "@Coder fix the bug");
    }

    #[test]
    fn test_broadcast_address() {
        let parsed = parse_message("  @ALL status?  ");
        assert!(parsed.target_all);
        assert!(parsed.target_agent.is_none());
        assert_eq!(parsed.content, "status?");
        assert_eq!(parsed.original, "  @ALL status?  ");
    }

    #[test]
    fn test_multiline_remainder_captured() {
        let parsed = parse_message("@writer first line\nsecond line");
        assert_eq!(parsed.target_agent.as_deref(), Some("writer"));
        assert_eq!(parsed.content, "first line\nsecond line");
    }

    #[test]
    fn test_unaddressed_is_trimmed() {
        let parsed = parse_message("   hello there \n");
        assert_eq!(parsed.content, "hello there");
        assert!(parsed.target_agent.is_none());
        assert!(!parsed.target_all);
    }

    #[test]
    fn test_bare_mention_is_not_addressing() {
        let parsed = parse_message("@coder");
        assert!(parsed.target_agent.is_none());
        assert_eq!(parsed.content, "@coder");

        let parsed = parse_message("email me @ home");
        assert!(parsed.target_agent.is_none());
    }
}
