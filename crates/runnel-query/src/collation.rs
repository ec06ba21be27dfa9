use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// String comparison rules for a filter.
///
/// Only the comparison strength is honoured: strengths 1 and 2 compare
/// case-insensitively, 3 and above compare code points. The `"simple"` locale
/// always compares code points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collation {
    pub locale: String,
    #[serde(default = "default_strength")]
    pub strength: u8,
}

fn default_strength() -> u8 {
    3
}

impl Default for Collation {
    fn default() -> Self {
        Self::simple()
    }
}

impl Collation {
    pub fn simple() -> Self {
        Self {
            locale: "simple".into(),
            strength: 3,
        }
    }

    pub fn new(locale: impl Into<String>, strength: u8) -> Self {
        Self {
            locale: locale.into(),
            strength,
        }
    }

    pub fn is_simple(&self) -> bool {
        self.locale == "simple"
    }

    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        if self.is_simple() || self.strength >= 3 {
            return a.cmp(b);
        }
        a.chars()
            .flat_map(char::to_lowercase)
            .cmp(b.chars().flat_map(char::to_lowercase))
    }
}
