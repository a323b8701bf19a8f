//! Rotary pairing styles.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RotaryError;

/// Which feature indices are paired for rotation within a head.
///
/// The style is resolved once per call, outside the per-element loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotaryStyle {
    /// GPT-NeoX layout: element `i` pairs with `i + rot_dim / 2`
    /// (contiguous halves).
    #[default]
    #[serde(alias = "gpt-neox", alias = "contiguous-halves")]
    Neox,
    /// GPT-J layout: element `2i` pairs with `2i + 1` (interleaved pairs).
    #[serde(alias = "gptj", alias = "interleaved")]
    GptJ,
}

impl RotaryStyle {
    /// Map the legacy `is_neox` flag onto a style.
    #[must_use]
    pub fn from_is_neox(is_neox: bool) -> Self {
        if is_neox { Self::Neox } else { Self::GptJ }
    }

    #[must_use]
    pub fn is_neox(self) -> bool {
        matches!(self, Self::Neox)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Neox => "neox",
            Self::GptJ => "gpt-j",
        }
    }
}

impl fmt::Display for RotaryStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RotaryStyle {
    type Err = RotaryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "neox" | "gpt-neox" | "gptneox" | "contiguous-halves" => Ok(Self::Neox),
            "gptj" | "gpt-j" | "interleaved" => Ok(Self::GptJ),
            _ => Err(RotaryError::UnknownStyle(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_spellings() {
        assert_eq!("neox".parse::<RotaryStyle>().unwrap(), RotaryStyle::Neox);
        assert_eq!("GPT-NeoX".parse::<RotaryStyle>().unwrap(), RotaryStyle::Neox);
        assert_eq!("gptj".parse::<RotaryStyle>().unwrap(), RotaryStyle::GptJ);
        assert_eq!(" interleaved ".parse::<RotaryStyle>().unwrap(), RotaryStyle::GptJ);
        assert!(matches!("llama".parse::<RotaryStyle>(), Err(RotaryError::UnknownStyle(_))));
    }

    #[test]
    fn legacy_flag_round_trips() {
        assert_eq!(RotaryStyle::from_is_neox(true), RotaryStyle::Neox);
        assert_eq!(RotaryStyle::from_is_neox(false), RotaryStyle::GptJ);
        assert!(RotaryStyle::Neox.is_neox());
        assert!(!RotaryStyle::GptJ.is_neox());
    }

    #[test]
    fn display_matches_as_str() {
        assert_eq!(RotaryStyle::GptJ.to_string(), "gpt-j");
        assert_eq!(RotaryStyle::default().to_string(), "neox");
    }
}
