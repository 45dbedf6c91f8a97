//! Parsing of raw command lines.
//!
//! A line is `<verb>[ <argument-text>]`. The verb is the first
//! whitespace-delimited token; the rest of the line, with leading whitespace
//! removed, is handed to the command untouched. Commands that need structured
//! arguments (such as `tell`) split it themselves.

/// Command verbs understood by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    Who,
    Name,
    Tell,
    Yell,
    Exit,
    /// Anything else; carries the verb as typed.
    Unknown(String),
}

const VERBS: &[(&str, Verb)] = &[
    ("who", Verb::Who),
    ("name", Verb::Name),
    ("tell", Verb::Tell),
    ("yell", Verb::Yell),
    ("exit", Verb::Exit),
];

impl Verb {
    /// Look up a verb token. Matching is case-sensitive.
    pub fn lookup(token: &str) -> Self {
        VERBS
            .iter()
            .find(|(name, _)| *name == token)
            .map(|(_, verb)| verb.clone())
            .unwrap_or_else(|| Verb::Unknown(token.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Verb::Who => "who",
            Verb::Name => "name",
            Verb::Tell => "tell",
            Verb::Yell => "yell",
            Verb::Exit => "exit",
            Verb::Unknown(token) => token,
        }
    }
}

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: Verb,
    /// Everything after the verb; empty when no argument was given.
    pub args: String,
}

impl Command {
    /// Parse one line (without its terminator).
    ///
    /// Returns `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_start();
        let (token, rest) = match line.find(char::is_whitespace) {
            Some(pos) => (&line[..pos], line[pos..].trim_start()),
            None => (line, ""),
        };
        if token.is_empty() {
            return None;
        }
        Some(Self {
            verb: Verb::lookup(token),
            args: rest.to_string(),
        })
    }
}
