//! Topics and subscription patterns.

use std::fmt;
use std::str::FromStr;

use crate::MqError;

/// A hierarchical event address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(Vec<String>);

impl Topic {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// The last segment, which names the event.
    pub fn event(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Build a [`Topic`] from anything that implements `Display`.
///
/// ```ignore
/// let topic = topic!("buildrequests", brid, "claimed");
/// ```
#[macro_export]
macro_rules! topic {
    ($($segment:expr),+ $(,)?) => {
        $crate::Topic::new([$($segment.to_string()),+])
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

/// A subscription filter: literal segments or `*`, matched pairwise against
/// topics of the same length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern(Vec<Segment>);

impl TopicPattern {
    pub fn matches(&self, topic: &Topic) -> bool {
        self.0.len() == topic.0.len()
            && self
                .0
                .iter()
                .zip(&topic.0)
                .all(|(pattern, segment)| match pattern {
                    Segment::Wildcard => true,
                    Segment::Literal(literal) => literal == segment,
                })
    }
}

impl FromStr for TopicPattern {
    type Err = MqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(MqError::InvalidPattern("empty pattern".to_string()));
        }
        s.split('.')
            .map(|segment| match segment {
                "" => Err(MqError::InvalidPattern(format!("empty segment in '{}'", s))),
                "*" => Ok(Segment::Wildcard),
                literal => Ok(Segment::Literal(literal.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(TopicPattern)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let segments: Vec<&str> = self
            .0
            .iter()
            .map(|segment| match segment {
                Segment::Wildcard => "*",
                Segment::Literal(literal) => literal.as_str(),
            })
            .collect();
        write!(f, "{}", segments.join("."))
    }
}
