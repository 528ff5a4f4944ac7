// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typo detection for unknown document fields.
//!
//! Unknown keys are compared against the set of keys valid at that location
//! using normalized Levenshtein similarity. Matches at or above 0.7 become
//! suggestions; at or above 0.85 the key is flagged as a likely typo.

use strsim::normalized_levenshtein;

/// Similarity floor for offering a suggestion at all.
pub const SUGGESTION_THRESHOLD: f64 = 0.7;

/// Similarity at which the unknown key is treated as a likely typo.
pub const LIKELY_TYPO_THRESHOLD: f64 = 0.85;

/// Outcome of matching an unknown key against the known set.
#[derive(Debug, Clone, PartialEq)]
pub struct TypoMatch {
    /// The closest known key.
    pub candidate: String,
    /// Similarity ratio in `[0, 1]`.
    pub ratio: f64,
    /// Whether the ratio clears [`LIKELY_TYPO_THRESHOLD`].
    pub likely_typo: bool,
}

/// Finds the closest known key to `unknown`, if any clears the
/// suggestion threshold.
pub fn closest_match(unknown: &str, known: &[&str]) -> Option<TypoMatch> {
    let mut best: Option<(f64, &str)> = None;
    for candidate in known {
        let ratio = normalized_levenshtein(unknown, candidate);
        match best {
            Some((best_ratio, _)) if ratio <= best_ratio => {}
            _ => best = Some((ratio, candidate)),
        }
    }
    let (ratio, candidate) = best?;
    if ratio < SUGGESTION_THRESHOLD {
        return None;
    }
    Some(TypoMatch {
        candidate: candidate.to_string(),
        ratio,
        likely_typo: ratio >= LIKELY_TYPO_THRESHOLD,
    })
}

/// Renders a hint line for an unknown key, when a suggestion exists.
pub fn suggestion_hint(unknown: &str, known: &[&str]) -> Option<String> {
    closest_match(unknown, known).map(|m| {
        if m.likely_typo {
            format!("did you mean '{}'?", m.candidate)
        } else {
            format!("closest known field is '{}'", m.candidate)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP_KEYS: &[&str] = &[
        "id", "uses", "name", "with", "needs", "when", "retry", "timeout",
        "continueOnError", "env", "outputs",
    ];

    #[test]
    fn near_identical_key_is_likely_typo() {
        let m = closest_match("timout", STEP_KEYS).unwrap();
        assert_eq!(m.candidate, "timeout");
        assert!(m.likely_typo);
    }

    #[test]
    fn close_but_not_exact_gives_suggestion_only() {
        let m = closest_match("use", STEP_KEYS).unwrap();
        assert_eq!(m.candidate, "uses");
        assert!(m.ratio >= SUGGESTION_THRESHOLD);
    }

    #[test]
    fn unrelated_key_gives_no_match() {
        assert!(closest_match("frobnicate", STEP_KEYS).is_none());
    }

    #[test]
    fn hint_wording_tracks_confidence() {
        assert_eq!(
            suggestion_hint("timout", STEP_KEYS).unwrap(),
            "did you mean 'timeout'?"
        );
        assert!(suggestion_hint("xyzzy", STEP_KEYS).is_none());
    }
}
