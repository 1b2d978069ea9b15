//! Proficiency label space
//!
//! The default head predicts four ordered skill levels. Other label-space
//! sizes are allowed by configuration; then only the raw class index is
//! meaningful.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Skill proficiency level, ordered from least to most skilled
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProficiencyLevel {
    Novice = 0,
    EarlyExpert = 1,
    IntermediateExpert = 2,
    LateExpert = 3,
}

impl ProficiencyLevel {
    /// Number of levels
    pub const COUNT: usize = 4;

    /// All levels in class-index order
    pub fn all() -> &'static [ProficiencyLevel] {
        &[
            ProficiencyLevel::Novice,
            ProficiencyLevel::EarlyExpert,
            ProficiencyLevel::IntermediateExpert,
            ProficiencyLevel::LateExpert,
        ]
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::all().get(index).copied()
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Parse an annotation label such as "Early Expert" or "late expert"
    pub fn parse(label: &str) -> Option<Self> {
        let normalized: String = label
            .split_whitespace()
            .map(|w| w.to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join(" ");
        match normalized.as_str() {
            "novice" => Some(ProficiencyLevel::Novice),
            "early expert" => Some(ProficiencyLevel::EarlyExpert),
            "intermediate expert" => Some(ProficiencyLevel::IntermediateExpert),
            "late expert" => Some(ProficiencyLevel::LateExpert),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProficiencyLevel::Novice => "Novice",
            ProficiencyLevel::EarlyExpert => "Early Expert",
            ProficiencyLevel::IntermediateExpert => "Intermediate Expert",
            ProficiencyLevel::LateExpert => "Late Expert",
        }
    }
}

impl fmt::Display for ProficiencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_labels() {
        assert_eq!(ProficiencyLevel::parse("Novice"), Some(ProficiencyLevel::Novice));
        assert_eq!(
            ProficiencyLevel::parse("early expert"),
            Some(ProficiencyLevel::EarlyExpert)
        );
        assert_eq!(
            ProficiencyLevel::parse("  Intermediate   Expert "),
            Some(ProficiencyLevel::IntermediateExpert)
        );
        assert_eq!(ProficiencyLevel::parse("Grandmaster"), None);
    }

    #[test]
    fn test_index_mapping() {
        for (i, level) in ProficiencyLevel::all().iter().enumerate() {
            assert_eq!(level.index(), i);
            assert_eq!(ProficiencyLevel::from_index(i), Some(*level));
            assert_eq!(ProficiencyLevel::parse(level.as_str()), Some(*level));
        }
        assert_eq!(ProficiencyLevel::from_index(ProficiencyLevel::COUNT), None);
    }
}
