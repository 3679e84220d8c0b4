use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_POSITIVE: &str = "❤️,👍️,💯,🍌,🎉,💞,💗,💓,💖,💘,💝,💕,😻,😍,❤️‍🔥";
pub const DEFAULT_NEGATIVE: &str = "👎️,💔,😠,👿,🙁,☹️,🤬,☠️,💀";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Up,
    Down,
}

impl Vote {
    pub fn weight(self) -> i64 {
        match self {
            Vote::Up => 1,
            Vote::Down => -1,
        }
    }
}

// Emoji often arrive with or without a variation selector.
fn normalize(marker: &str) -> String {
    marker
        .trim()
        .chars()
        .filter(|c| !matches!(c, '\u{FE0E}' | '\u{FE0F}'))
        .collect()
}

fn collect<I, S>(markers: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    markers
        .into_iter()
        .map(|m| normalize(m.as_ref()))
        .filter(|m| !m.is_empty())
        .collect()
}

/// Two disjoint marker sets mapping a reaction annotation to a vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionMarkers {
    positive: HashSet<String>,
    negative: HashSet<String>,
}

impl ReactionMarkers {
    pub fn new<I, J, S, T>(positive: I, negative: J) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        let positive = collect(positive);
        let negative = collect(negative);
        let mut overlap: Vec<&String> = positive.intersection(&negative).collect();
        overlap.sort();
        if let Some(first) = overlap.first() {
            return Err(ConfigError::OverlappingMarker((*first).clone()));
        }
        Ok(Self { positive, negative })
    }

    /// Comma-separated lists, as they appear in configuration.
    pub fn parse(positive: &str, negative: &str) -> Result<Self, ConfigError> {
        Self::new(positive.split(','), negative.split(','))
    }

    pub fn defaults() -> Result<Self, ConfigError> {
        Self::parse(DEFAULT_POSITIVE, DEFAULT_NEGATIVE)
    }

    pub fn classify(&self, annotation: &str) -> Option<Vote> {
        let key = normalize(annotation);
        if self.positive.contains(&key) {
            Some(Vote::Up)
        } else if self.negative.contains(&key) {
            Some(Vote::Down)
        } else {
            None
        }
    }
}
