use std::str::FromStr;

use crate::error::RelayError;

const SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `+`: exactly one level.
    SingleLevel,
    /// `#`: zero or more trailing levels. Always the last segment.
    MultiLevel,
}

/// A compiled topic pattern.
///
/// Exact topics compile to literal segments only, so one type serves both
/// exact subscriptions and `+`/`#` patterns. Compilation validates the
/// pattern; matching never fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pattern: String,
    segments: Vec<Segment>,
}

impl TopicFilter {
    pub fn compile(pattern: &str) -> Result<Self, RelayError> {
        if pattern.is_empty() {
            return Err(RelayError::invalid_pattern(pattern, "empty pattern"));
        }
        if pattern.contains('\0') {
            return Err(RelayError::invalid_pattern(pattern, "NUL character"));
        }

        let levels: Vec<&str> = pattern.split(SEPARATOR).collect();
        let last = levels.len() - 1;
        let mut segments = Vec::with_capacity(levels.len());

        for (i, level) in levels.iter().enumerate() {
            let segment = match *level {
                MULTI_LEVEL if i == last => Segment::MultiLevel,
                MULTI_LEVEL => {
                    return Err(RelayError::invalid_pattern(
                        pattern,
                        "'#' is only allowed as the last level",
                    ));
                }
                SINGLE_LEVEL => Segment::SingleLevel,
                other if other.contains('#') => {
                    return Err(RelayError::invalid_pattern(
                        pattern,
                        "'#' must occupy a whole level",
                    ));
                }
                other if other.contains('+') => {
                    return Err(RelayError::invalid_pattern(
                        pattern,
                        "'+' must occupy a whole level",
                    ));
                }
                other => Segment::Literal(other.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            pattern: pattern.to_string(),
            segments,
        })
    }

    pub fn matches(&self, topic: &str) -> bool {
        // Wildcards in the first level don't reach `$`-prefixed system topics.
        if topic.starts_with('$') && !matches!(self.segments.first(), Some(Segment::Literal(_))) {
            return false;
        }

        let mut levels = topic.split(SEPARATOR);
        for segment in &self.segments {
            match segment {
                Segment::MultiLevel => return true,
                Segment::SingleLevel => {
                    if levels.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(expected) => match levels.next() {
                    Some(level) if level == expected => {}
                    _ => return false,
                },
            }
        }
        levels.next().is_none()
    }

    pub fn is_wildcard(&self) -> bool {
        self.segments.iter().any(|s| !matches!(s, Segment::Literal(_)))
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl FromStr for TopicFilter {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::compile(s)
    }
}

impl std::fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.pattern)
    }
}

/// One-shot match. Prefer compiling once when matching many topics.
pub fn matches(pattern: &str, topic: &str) -> Result<bool, RelayError> {
    Ok(TopicFilter::compile(pattern)?.matches(topic))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(pattern: &str, topic: &str) -> bool {
        matches(pattern, topic).unwrap()
    }

    #[test]
    fn single_level_wildcard_matches_one_level() {
        assert!(m("sensors/+/temp", "sensors/3/temp"));
        assert!(!m("sensors/+/temp", "sensors/3/4/temp"));
        assert!(!m("sensors/+/temp", "sensors/temp"));
        assert!(m("+", "a"));
        assert!(!m("+", "a/b"));
    }

    #[test]
    fn multi_level_wildcard_matches_trailing_levels() {
        assert!(m("sensors/#", "sensors/3/4/temp"));
        assert!(m("sensors/#", "sensors"));
        assert!(m("#", "anything/at/all"));
        assert!(!m("sensors/#", "actuators/1"));
    }

    #[test]
    fn exact_topics_match_only_themselves() {
        assert!(m("orders", "orders"));
        assert!(!m("orders", "orders/1"));
        assert!(!m("orders/1", "orders"));
        assert!(m("a//b", "a//b"));
    }

    #[test]
    fn wildcards_skip_dollar_topics() {
        assert!(!m("#", "$SYS/uptime"));
        assert!(!m("+/uptime", "$SYS/uptime"));
        assert!(m("$SYS/#", "$SYS/uptime"));
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        for bad in ["", "a/#/b", "a/b#", "a+/b", "#/a", "a/\0"] {
            assert!(
                matches!(TopicFilter::compile(bad), Err(RelayError::InvalidPattern { .. })),
                "pattern {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn wildcard_detection() {
        assert!(TopicFilter::compile("a/+").unwrap().is_wildcard());
        assert!(TopicFilter::compile("#").unwrap().is_wildcard());
        assert!(!TopicFilter::compile("a/b").unwrap().is_wildcard());
    }
}
