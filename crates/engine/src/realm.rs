//! Ordered realm rules: the first rule whose pattern matches a User-Name
//! wins, in the same "scan an ordered `Vec`, first match wins, fall through"
//! shape routing dispatch uses elsewhere in this proxy.

use regex::Regex;

/// What a matched realm rule does with the request.
#[derive(Debug, Clone)]
pub enum RealmAction {
    /// Forward to the named upstream.
    Forward(String),
    /// No destination configured: reject, optionally with a message.
    Reject(Option<String>),
}

#[derive(Debug, Clone)]
pub struct RealmRule {
    pattern: Regex,
    action: RealmAction,
}

impl RealmRule {
    /// Builds a rule from a configured realm name and its resolved action.
    /// `name` follows §4.4: literal `*` matches everything; `/pattern/` (or
    /// a bare leading `/`) is a regex matched against the whole User-Name;
    /// anything else is a domain literal compiled to `@D$` with `.` escaped.
    pub fn compile(name: &str, action: RealmAction) -> Result<Self, regex::Error> {
        let pattern = if name == "*" {
            Regex::new("(?i)^.*$")?
        } else if let Some(inner) = name.strip_prefix('/') {
            let inner = inner.strip_suffix('/').unwrap_or(inner);
            Regex::new(&format!("(?i)^{inner}$"))?
        } else {
            let escaped = regex::escape(name);
            Regex::new(&format!("(?i)@{escaped}$"))?
        };

        Ok(Self { pattern, action })
    }

    pub fn matches(&self, user_name: &str) -> bool {
        self.pattern.is_match(user_name)
    }
}

/// First-match-wins ordered realm table.
#[derive(Debug, Default, Clone)]
pub struct RealmTable {
    rules: Vec<RealmRule>,
}

impl RealmTable {
    pub fn new(rules: Vec<RealmRule>) -> Self {
        Self { rules }
    }

    /// Evaluates rules in configuration order; returns the first match's
    /// action, or `None` if no rule matches (silent drop per §4.4).
    pub fn resolve(&self, user_name: &str) -> Option<&RealmAction> {
        self.rules
            .iter()
            .find(|rule| rule.matches(user_name))
            .map(|rule| &rule.action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_wins() {
        let rules = vec![
            RealmRule::compile("example.com", RealmAction::Forward("U".into())).unwrap(),
            RealmRule::compile("*", RealmAction::Reject(None)).unwrap(),
        ];
        let table = RealmTable::new(rules);

        match table.resolve("alice@example.com") {
            Some(RealmAction::Forward(name)) => assert_eq!(name, "U"),
            other => panic!("unexpected match: {other:?}"),
        }
        match table.resolve("bob@elsewhere.com") {
            Some(RealmAction::Reject(None)) => {}
            other => panic!("unexpected match: {other:?}"),
        }
    }

    #[test]
    fn no_matching_rule_is_none() {
        let rules = vec![RealmRule::compile("example.com", RealmAction::Forward("U".into())).unwrap()];
        let table = RealmTable::new(rules);
        assert!(table.resolve("bob@other.com").is_none());
    }

    #[test]
    fn regex_rule_matches_whole_username() {
        let rules = vec![RealmRule::compile(r"/@.*\.bv$/", RealmAction::Reject(Some("Blocked".into()))).unwrap()];
        let table = RealmTable::new(rules);
        match table.resolve("x@foo.bv") {
            Some(RealmAction::Reject(Some(msg))) => assert_eq!(msg, "Blocked"),
            other => panic!("unexpected match: {other:?}"),
        }
    }

    #[test]
    fn is_case_insensitive() {
        let rules = vec![RealmRule::compile("Example.COM", RealmAction::Forward("U".into())).unwrap()];
        let table = RealmTable::new(rules);
        assert!(table.resolve("alice@example.com").is_some());
    }
}
