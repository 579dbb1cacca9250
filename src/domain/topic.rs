use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicPatternError {
    #[error("topic pattern is empty")]
    Empty,
    #[error("multi-level wildcard '#' must be the last level")]
    MultiLevelNotLast,
    #[error("wildcard must occupy a whole level: {0:?}")]
    PartialWildcard(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Literal(String),
    /// `+`, matches exactly one level.
    Single,
    /// `#`, matches the remainder of the topic. Always last.
    Multi,
}

/// Hierarchical topic filter with `+` (single-level) and trailing `#`
/// (multi-level) wildcards, e.g. `garbage/#` or `garbage/+/level`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    levels: Vec<Level>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, TopicPatternError> {
        if pattern.is_empty() {
            return Err(TopicPatternError::Empty);
        }

        let parts: Vec<&str> = pattern.split('/').collect();
        let mut levels = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let level = match *part {
                "#" => {
                    if i != parts.len() - 1 {
                        return Err(TopicPatternError::MultiLevelNotLast);
                    }
                    Level::Multi
                }
                "+" => Level::Single,
                literal => {
                    if literal.contains('#') || literal.contains('+') {
                        return Err(TopicPatternError::PartialWildcard(literal.to_string()));
                    }
                    Level::Literal(literal.to_string())
                }
            };
            levels.push(level);
        }

        Ok(Self {
            raw: pattern.to_string(),
            levels,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, topic: &str) -> bool {
        if topic.is_empty() {
            return false;
        }

        let mut topic_levels = topic.split('/');
        for level in &self.levels {
            match level {
                Level::Multi => return true,
                Level::Single => {
                    if topic_levels.next().is_none() {
                        return false;
                    }
                }
                Level::Literal(expected) => match topic_levels.next() {
                    Some(actual) if actual == expected => {}
                    _ => return false,
                },
            }
        }

        topic_levels.next().is_none()
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}
