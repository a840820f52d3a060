//! Topic names, topic filters and wildcard matching.
//!
//! A topic filter may use `+` (exactly one level) and `#` (any number of
//! trailing levels, including none). Filters starting with a wildcard never
//! match topic names starting with `$`.

use regex::Regex;

/// Single-level wildcard.
pub const SINGLE_LEVEL: &str = "+";
/// Multi-level wildcard.
pub const MULTI_LEVEL: &str = "#";

const SHARE_PREFIX: &str = "$share/";

/// Check topic filter syntax.
///
/// `#` may only appear as a whole final level, `+` only as a whole level, and
/// `$` only as the very first character. `"+"` and `"#"` are always valid.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter == SINGLE_LEVEL || filter == MULTI_LEVEL {
        return true;
    }
    if filter.is_empty() {
        return false;
    }
    if filter.char_indices().any(|(i, c)| c == '$' && i != 0) {
        return false;
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();
        if level.contains('#') && (level != MULTI_LEVEL || !is_last) {
            return false;
        }
        if level.contains('+') && level != SINGLE_LEVEL {
            return false;
        }
    }
    true
}

/// Cheap syntactic check: does the filter contain a wildcard character.
pub fn is_wildcard(filter: &str) -> bool {
    filter.contains(['+', '#'])
}

/// Check a topic name carried in PUBLISH.
pub fn is_valid_topic_name(topic: &str) -> bool {
    !topic.is_empty() && !is_wildcard(topic)
}

/// True for `$share/{group}/{filter}` shared subscription filters.
pub fn is_shared(filter: &str) -> bool {
    filter.starts_with(SHARE_PREFIX)
}

/// Compiled topic filter.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Literal filter, compared by string equality.
    Exact(String),
    /// Wildcard filter translated into an anchored regular expression.
    Pattern {
        filter: String,
        regex: Regex,
        /// Leading wildcard: topics starting with `$` never match.
        guard_system: bool,
    },
}

impl Matcher {
    /// Compile a filter, or `None` if the filter is invalid.
    pub fn compile(filter: &str) -> Option<Matcher> {
        if !is_valid_filter(filter) {
            return None;
        }
        if !is_wildcard(filter) {
            return Some(Matcher::Exact(filter.to_string()));
        }

        let mut pattern = String::from("^");
        for (i, level) in filter.split('/').enumerate() {
            match level {
                MULTI_LEVEL if i == 0 => pattern.push_str(".*"),
                MULTI_LEVEL => pattern.push_str("(?:/.*)?"),
                _ => {
                    if i > 0 {
                        pattern.push('/');
                    }
                    if level == SINGLE_LEVEL {
                        pattern.push_str("[^/]*");
                    } else {
                        pattern.push_str(&regex::escape(level));
                    }
                }
            }
        }
        pattern.push('$');

        let regex = Regex::new(&pattern).ok()?;
        Some(Matcher::Pattern {
            filter: filter.to_string(),
            regex,
            guard_system: filter.starts_with(['+', '#']),
        })
    }

    pub fn filter(&self) -> &str {
        match self {
            Matcher::Exact(filter) => filter,
            Matcher::Pattern { filter, .. } => filter,
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Matcher::Exact(filter) => filter == topic,
            Matcher::Pattern {
                regex,
                guard_system,
                ..
            } => {
                if *guard_system && topic.starts_with('$') {
                    return false;
                }
                regex.is_match(topic)
            }
        }
    }
}

/// Match a single topic against a filter without keeping the compiled form.
pub fn matches(filter: &str, topic: &str) -> bool {
    Matcher::compile(filter).is_some_and(|m| m.matches(topic))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_filters() {
        for filter in [
            "+", "#", "a", "a/b", "a/+", "a/#", "+/b", "+/+/#", "/", "a//b", "$SYS/#", "$share/g/a",
        ] {
            assert!(is_valid_filter(filter), "{filter} should be valid");
        }
    }

    #[test]
    fn test_invalid_filters() {
        for filter in ["", "a/#/b", "a#", "#/a", "a+", "a/b+/c", "a/$b", "a$", "##", "++"] {
            assert!(!is_valid_filter(filter), "{filter} should be invalid");
        }
    }

    #[test]
    fn test_multi_level_matching() {
        let m = Matcher::compile("sport/#").unwrap();
        for topic in ["sport", "sport/", "sport/tennis", "sport/tennis/player1"] {
            assert!(m.matches(topic), "sport/# should match {topic}");
        }
        assert!(!m.matches("sports"));
        assert!(!m.matches("other/sport"));
    }

    #[test]
    fn test_single_level_matching() {
        let m = Matcher::compile("sport/+").unwrap();
        assert!(m.matches("sport/tennis"));
        assert!(!m.matches("sport"));
        assert!(!m.matches("sport/tennis/player1"));

        let m = Matcher::compile("+/tennis").unwrap();
        assert!(m.matches("sport/tennis"));
        assert!(!m.matches("/tennis/extra"));
    }

    #[test]
    fn test_literal_levels_are_escaped() {
        let m = Matcher::compile("a.b/+").unwrap();
        assert!(m.matches("a.b/c"));
        assert!(!m.matches("axb/c"));
    }

    #[test]
    fn test_system_topics() {
        assert!(!matches("#", "$SYS/broker/uptime"));
        assert!(!matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(matches("$SYS/#", "$SYS/broker/uptime"));
        assert!(matches("#", "any/topic"));
    }

    #[test]
    fn test_exact_matcher() {
        let m = Matcher::compile("home/kitchen/temp").unwrap();
        assert!(matches!(m, Matcher::Exact(_)));
        assert!(m.matches("home/kitchen/temp"));
        assert!(!m.matches("home/kitchen"));
        assert!(Matcher::compile("a/#/b").is_none());
    }

    #[test]
    fn test_topic_names() {
        assert!(is_valid_topic_name("a/b"));
        assert!(!is_valid_topic_name(""));
        assert!(!is_valid_topic_name("a/+"));
        assert!(!is_valid_topic_name("a/#"));
        assert!(is_shared("$share/group/a/b"));
        assert!(!is_shared("$SYS/a"));
    }
}
