//! Challenge generation and verification.
//!
//! One surface over both flavors: arithmetic option-button puzzles and
//! distorted-image puzzles. The literal answer lives only in the server-side
//! [`StoredChallenge`]; what leaves the process is a question with opaque
//! option tokens, or a PNG.

mod arithmetic;
mod visual;

use ab_glyph::FontArc;
use serde::{Deserialize, Serialize};

use gatehouse_common::{ChallengeKind, Verdict};

/// Challenge state held server-side (ephemeral cache, TTL-bounded) while an
/// answer is outstanding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChallenge {
    /// The expected answer
    pub answer: String,
    /// Which flavor produced it
    pub kind: ChallengeKind,
    /// Creation timestamp
    pub issued_at: i64,
    /// Expiry timestamp
    pub expires_at: i64,
    /// Incorrect answers consumed so far across re-issues
    pub attempts: u32,
}

/// What the user gets to see.
pub enum ChallengePresentation {
    /// A question plus four labels; each label is paired to a correlation
    /// token by the coordinator before display.
    Options {
        question: String,
        options: Vec<String>,
    },
    /// A rendered puzzle answered by typing.
    Image { png: Vec<u8> },
}

pub struct GeneratedChallenge {
    /// The flavor actually produced (may differ from the requested one when
    /// visual rendering is unavailable).
    pub kind: ChallengeKind,
    pub answer: String,
    pub presentation: ChallengePresentation,
}

/// Challenge generator/verifier service.
#[derive(Clone)]
pub struct ChallengeEngine {
    font: Option<FontArc>,
    max_attempts: u32,
}

impl ChallengeEngine {
    pub fn new(font: Option<FontArc>, max_attempts: u32) -> Self {
        Self { font, max_attempts }
    }

    /// Generate a fresh challenge of the requested flavor. A visual request
    /// without a usable font degrades to arithmetic rather than failing the
    /// join flow.
    pub fn generate(&self, kind: ChallengeKind) -> GeneratedChallenge {
        let mut rng = rand::rng();

        if kind == ChallengeKind::Visual {
            if let Some(font) = &self.font {
                let prompt = visual::random_prompt(&mut rng);
                match visual::render(font, &prompt.text, &mut rng) {
                    Ok(png) => {
                        return GeneratedChallenge {
                            kind: ChallengeKind::Visual,
                            answer: prompt.answer,
                            presentation: ChallengePresentation::Image { png },
                        };
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Visual challenge rendering failed, issuing arithmetic instead");
                    }
                }
            } else {
                tracing::warn!("No challenge font loaded, issuing arithmetic instead");
            }
        }

        let puzzle = arithmetic::generate(&mut rng);
        GeneratedChallenge {
            kind: ChallengeKind::Arithmetic,
            answer: puzzle.answer.to_string(),
            presentation: ChallengePresentation::Options {
                question: puzzle.question(),
                options: puzzle.options.iter().map(|o| o.to_string()).collect(),
            },
        }
    }

    /// Verify `submitted` against a stored challenge.
    ///
    /// A challenge past its deadline is `Expired` no matter what was typed,
    /// even if the backing record still exists. A spent attempt budget is
    /// `Exhausted`: the caller applies a cool-down instead of looping on
    /// `Incorrect`. Comparison is whitespace-trimmed and case-insensitive.
    pub fn verify(&self, stored: &StoredChallenge, submitted: &str, now: i64) -> Verdict {
        if now >= stored.expires_at {
            return Verdict::Expired;
        }
        if stored.attempts >= self.max_attempts {
            return Verdict::Exhausted;
        }
        if submitted.trim().eq_ignore_ascii_case(stored.answer.trim()) {
            Verdict::Correct
        } else {
            Verdict::Incorrect
        }
    }
}
