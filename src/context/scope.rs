use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Where a collector may look for context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    File,
    Code,
    Sense,
    Project,
    Web,
}

impl Scope {
    pub const ALL: [Scope; 5] = [
        Scope::File,
        Scope::Code,
        Scope::Sense,
        Scope::Project,
        Scope::Web,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::File => "file",
            Scope::Code => "code",
            Scope::Sense => "sense",
            Scope::Project => "project",
            Scope::Web => "web",
        }
    }

    /// First scope whose name starts with `text`, case-insensitively.
    pub fn from_prefix(text: &str) -> Option<Self> {
        if text.is_empty() {
            return None;
        }
        let text = text.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|scope| scope.as_str().starts_with(&text))
    }
}

/// Strip a leading `@name+name ` prefix from `content` and return the scopes
/// it names. Without a well-formed prefix `content` is left untouched.
pub fn parse_scopes(content: &mut String) -> HashSet<Scope> {
    let Some(rest) = content.strip_prefix('@') else {
        return HashSet::new();
    };
    let Some((names, body)) = rest.split_once(' ') else {
        return HashSet::new();
    };
    if !names
        .split('+')
        .all(|name| name.chars().all(char::is_alphabetic))
    {
        return HashSet::new();
    }

    let scopes = names.split('+').filter_map(Scope::from_prefix).collect();
    *content = body.trim_start_matches(' ').to_string();
    scopes
}
