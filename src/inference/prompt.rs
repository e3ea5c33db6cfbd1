//! Prompt construction: chat messages → one sanitized backend prompt.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Maximum characters kept from any single sanitized text segment.
pub const MAX_SEGMENT_CHARS: usize = 1000;

static DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s.,!?-]").expect("sanitizer pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Capitalized label used in the rendered prompt.
    pub fn label(self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

/// Input accepted by [`PromptBuilder::build`].
#[derive(Debug, Clone, Copy)]
pub enum PromptInput<'a> {
    Text(&'a str),
    Messages(&'a [Message]),
}

/// Strip everything outside word characters, whitespace and `. , ! ? -`,
/// then keep at most [`MAX_SEGMENT_CHARS`] characters.
pub fn sanitize(text: &str) -> String {
    let stripped = DISALLOWED.replace_all(text, "");
    stripped.chars().take(MAX_SEGMENT_CHARS).collect()
}

/// Renders conversations and frames them with the backend preamble.
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    preamble: String,
}

impl PromptBuilder {
    pub fn new(preamble: impl Into<String>) -> Self {
        Self {
            preamble: preamble.into(),
        }
    }

    /// Sanitize and render the input. Messages become `"{Role}: {content}"`
    /// lines separated by a blank line.
    pub fn build(&self, input: PromptInput<'_>) -> String {
        match input {
            PromptInput::Text(text) => sanitize(text),
            PromptInput::Messages(messages) => messages
                .iter()
                .map(|m| format!("{}: {}", m.role, sanitize(&m.content)))
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }

    /// Wrap a rendered body into the exact text sent to the backend.
    pub fn frame(&self, body: &str) -> String {
        if self.preamble.is_empty() {
            format!("{body}\n\nAssistant:")
        } else {
            format!("{}\n\n{body}\n\nAssistant:", self.preamble)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn only_allowed(s: &str) -> bool {
        s.chars().all(|c| {
            c.is_alphanumeric() || c == '_' || c.is_whitespace() || ".,!?-".contains(c)
        })
    }

    #[test]
    fn test_sanitize_strips_control_and_markup() {
        assert_eq!(sanitize("Hi <script>alert('x')</script>!"), "Hi scriptalertxscript!");
        assert_eq!(sanitize("a{b}c\u{0007}"), "abc");
        assert_eq!(sanitize("well, ok - fine? yes."), "well, ok - fine? yes.");
    }

    #[test]
    fn test_sanitize_keeps_unicode_words() {
        assert_eq!(sanitize("héllo wörld №1"), "héllo wörld 1");
    }

    #[test]
    fn test_sanitize_truncates_by_chars() {
        let long = "é".repeat(MAX_SEGMENT_CHARS + 50);
        let out = sanitize(&long);
        assert_eq!(out.chars().count(), MAX_SEGMENT_CHARS);
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let once = sanitize("Tell me: {\"json\": [1, 2]} & more; please!");
        assert_eq!(sanitize(&once), once);
        assert!(only_allowed(&once));
    }

    #[test]
    fn test_build_messages() {
        let builder = PromptBuilder::default();
        let messages = vec![
            Message::system("Be brief."),
            Message::user("Hi <there>"),
            Message::new(Role::Assistant, "Hello!"),
        ];
        assert_eq!(
            builder.build(PromptInput::Messages(&messages)),
            "System: Be brief.\n\nUser: Hi there\n\nAssistant: Hello!"
        );
    }

    #[test]
    fn test_build_each_segment_truncated() {
        let builder = PromptBuilder::default();
        let messages = vec![Message::user("x".repeat(1500)), Message::user("y".repeat(1500))];
        let prompt = builder.build(PromptInput::Messages(&messages));
        let segments: Vec<&str> = prompt.split("\n\n").collect();
        assert_eq!(segments.len(), 2);
        for seg in segments {
            assert_eq!(seg.len(), "User: ".len() + MAX_SEGMENT_CHARS);
        }
    }

    #[test]
    fn test_build_empty_and_text() {
        let builder = PromptBuilder::default();
        assert_eq!(builder.build(PromptInput::Messages(&[])), "");
        assert_eq!(builder.build(PromptInput::Text("what's up?")), "whats up?");
    }

    #[test]
    fn test_frame() {
        assert_eq!(PromptBuilder::new("").frame("User: Hi"), "User: Hi\n\nAssistant:");
        assert_eq!(
            PromptBuilder::new("Be nice.").frame("User: Hi"),
            "Be nice.\n\nUser: Hi\n\nAssistant:"
        );
    }

    #[test]
    fn test_role_serde() {
        let m: Message = serde_json::from_str(r#"{"role":"assistant","content":"ok"}"#).unwrap();
        assert_eq!(m.role, Role::Assistant);
        assert!(serde_json::from_str::<Message>(r#"{"role":"tool","content":"x"}"#).is_err());
    }
}
