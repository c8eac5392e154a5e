//! Job kinds and their static profiles.

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use storyforge_core::{DomainError, DomainResult};

/// Maximum accepted length of free-text prompts.
pub const MAX_PROMPT_CHARS: usize = 2000;

/// What a job generates.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// A single illustration from a prompt.
    Image,
    /// A storybook written from a prompt.
    Story,
    /// A storybook generated end-to-end from a theme.
    AutoStory,
    /// Restyle an uploaded photo as a cartoon.
    Cartoonize,
    /// One scene illustration for an existing story.
    Scene,
}

/// A progress band: from `from` (inclusive) up to the next band's `from`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PhaseBand {
    pub from: u8,
    pub label: &'static str,
}

/// Per-kind configuration, looked up rather than branched on by callers.
#[derive(Debug, PartialEq, Eq)]
pub struct KindProfile {
    /// Retry budget copied onto each new record.
    pub max_retries: u32,
    /// Remaining-time rate, in thousandths of a minute per percent of progress.
    pub millis_per_percent: u32,
    /// Ordered, non-overlapping bands starting at 0.
    pub phases: &'static [PhaseBand],
}

impl KindProfile {
    /// Human label of the band containing `progress`.
    pub fn phase_for(&self, progress: u8) -> &'static str {
        self.phases
            .iter()
            .rev()
            .find(|band| band.from <= progress)
            .or_else(|| self.phases.first())
            .map(|band| band.label)
            .unwrap_or("Processing")
    }

    /// Linear remaining-time estimate: `max(1, ceil((100 - progress) * rate))` minutes.
    pub fn remaining_minutes(&self, progress: u8) -> u32 {
        let left = 100u32.saturating_sub(progress as u32);
        (left * self.millis_per_percent).div_ceil(1000).max(1)
    }

    /// Whole-job estimate used for `estimatedCompletion` at creation time.
    pub fn estimated_total_minutes(&self) -> u32 {
        self.remaining_minutes(0)
    }
}

static IMAGE: KindProfile = KindProfile {
    max_retries: 3,
    millis_per_percent: 15,
    phases: &[
        PhaseBand { from: 0, label: "Preparing prompt" },
        PhaseBand { from: 20, label: "Generating illustrations" },
        PhaseBand { from: 80, label: "Processing image" },
        PhaseBand { from: 95, label: "Finalizing" },
    ],
};

static STORY: KindProfile = KindProfile {
    max_retries: 3,
    millis_per_percent: 40,
    phases: &[
        PhaseBand { from: 0, label: "Planning story" },
        PhaseBand { from: 15, label: "Writing chapters" },
        PhaseBand { from: 50, label: "Generating illustrations" },
        PhaseBand { from: 85, label: "Assembling storybook" },
        PhaseBand { from: 95, label: "Finalizing" },
    ],
};

static AUTO_STORY: KindProfile = KindProfile {
    max_retries: 2,
    millis_per_percent: 50,
    phases: &[
        PhaseBand { from: 0, label: "Analyzing theme" },
        PhaseBand { from: 10, label: "Generating story outline" },
        PhaseBand { from: 30, label: "Writing pages" },
        PhaseBand { from: 60, label: "Generating illustrations" },
        PhaseBand { from: 90, label: "Assembling storybook" },
    ],
};

static CARTOONIZE: KindProfile = KindProfile {
    max_retries: 3,
    millis_per_percent: 10,
    phases: &[
        PhaseBand { from: 0, label: "Uploading image" },
        PhaseBand { from: 20, label: "Applying cartoon style" },
        PhaseBand { from: 80, label: "Enhancing details" },
        PhaseBand { from: 95, label: "Finalizing" },
    ],
};

static SCENE: KindProfile = KindProfile {
    max_retries: 3,
    millis_per_percent: 20,
    phases: &[
        PhaseBand { from: 0, label: "Composing scene" },
        PhaseBand { from: 30, label: "Rendering scene" },
        PhaseBand { from: 85, label: "Finalizing" },
    ],
};

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::Image,
        JobKind::Story,
        JobKind::AutoStory,
        JobKind::Cartoonize,
        JobKind::Scene,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Image => "image",
            JobKind::Story => "story",
            JobKind::AutoStory => "auto-story",
            JobKind::Cartoonize => "cartoonize",
            JobKind::Scene => "scene",
        }
    }

    pub fn profile(&self) -> &'static KindProfile {
        match self {
            JobKind::Image => &IMAGE,
            JobKind::Story => &STORY,
            JobKind::AutoStory => &AUTO_STORY,
            JobKind::Cartoonize => &CARTOONIZE,
            JobKind::Scene => &SCENE,
        }
    }

    /// Check kind-specific creation parameters.
    ///
    /// The error message names the violated constraint so it can be shown to
    /// the caller as-is.
    pub fn validate_parameters(&self, parameters: &Value) -> DomainResult<()> {
        let params = parameters
            .as_object()
            .ok_or_else(|| DomainError::validation("parameters must be a JSON object"))?;

        match self {
            JobKind::Image => {
                required_text(params, "prompt", MAX_PROMPT_CHARS)?;
                optional_text(params, "style")?;
                optional_range(params, "count", 1, 4)?;
            }
            JobKind::Story => {
                required_text(params, "prompt", MAX_PROMPT_CHARS)?;
                optional_range(params, "pageCount", 1, 20)?;
            }
            JobKind::AutoStory => {
                required_text(params, "genre", 100)?;
                optional_range(params, "pageCount", 1, 20)?;
                optional_text(params, "characterName")?;
            }
            JobKind::Cartoonize => {
                let url = required_text(params, "imageUrl", usize::MAX)?;
                let accepted = ["http://", "https://", "data:image/"];
                if !accepted.iter().any(|prefix| url.starts_with(prefix)) {
                    return Err(DomainError::validation(
                        "imageUrl must be an http(s) URL or an image data URI",
                    ));
                }
            }
            JobKind::Scene => {
                required_text(params, "prompt", MAX_PROMPT_CHARS)?;
                optional_text(params, "storyId")?;
            }
        }

        Ok(())
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                DomainError::validation(format!(
                    "unknown job kind '{s}' (expected one of: image, story, auto-story, cartoonize, scene)"
                ))
            })
    }
}

fn required_text<'a>(params: &'a Map<String, Value>, field: &str, max_chars: usize) -> DomainResult<&'a str> {
    let text = params
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DomainError::validation(format!("{field} is required and must be a non-empty string")))?;

    if text.chars().count() > max_chars {
        return Err(DomainError::validation(format!(
            "{field} must be at most {max_chars} characters"
        )));
    }
    Ok(text)
}

fn optional_text(params: &Map<String, Value>, field: &str) -> DomainResult<()> {
    match params.get(field) {
        None | Some(Value::Null) | Some(Value::String(_)) => Ok(()),
        Some(_) => Err(DomainError::validation(format!("{field} must be a string"))),
    }
}

fn optional_range(params: &Map<String, Value>, field: &str, min: u64, max: u64) -> DomainResult<()> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(()),
        Some(value) => match value.as_u64() {
            Some(n) if (min..=max).contains(&n) => Ok(()),
            _ => Err(DomainError::validation(format!(
                "{field} must be an integer between {min} and {max}"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn image_phase_table_matches_progress_bands() {
        let profile = JobKind::Image.profile();
        assert_eq!(profile.phase_for(0), "Preparing prompt");
        assert_eq!(profile.phase_for(40), "Generating illustrations");
        assert_eq!(profile.phase_for(80), "Processing image");
        assert_eq!(profile.phase_for(100), "Finalizing");
    }

    #[test]
    fn remaining_minutes_uses_integer_ceiling() {
        let story = JobKind::Story.profile();
        // 60 * 0.04 = 2.4 -> 3
        assert_eq!(story.remaining_minutes(40), 3);
        // 60 * 0.05 = 3.0 exactly; no float drift pushing it to 4
        assert_eq!(JobKind::AutoStory.profile().remaining_minutes(40), 3);
        // floor of one minute
        assert_eq!(JobKind::Cartoonize.profile().remaining_minutes(99), 1);
        assert_eq!(JobKind::Image.profile().estimated_total_minutes(), 2);
    }

    #[test]
    fn every_table_starts_at_zero_and_is_strictly_increasing() {
        for kind in JobKind::ALL {
            let phases = kind.profile().phases;
            assert_eq!(phases[0].from, 0, "{kind} must cover progress 0");
            assert!(phases.windows(2).all(|w| w[0].from < w[1].from), "{kind} bands overlap");
            assert!(phases.iter().all(|b| b.from <= 100));
        }
    }

    #[test]
    fn kinds_parse_from_wire_names() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.as_str()));
        }
        assert!(matches!("video".parse::<JobKind>(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn parameter_rules_per_kind() {
        assert!(JobKind::Image.validate_parameters(&json!({"prompt": "a fox"})).is_ok());
        assert!(JobKind::Image.validate_parameters(&json!({"prompt": "  "})).is_err());
        assert!(JobKind::Image.validate_parameters(&json!({"prompt": "a fox", "count": 9})).is_err());
        assert!(JobKind::Story.validate_parameters(&json!({"prompt": "x", "pageCount": 20})).is_ok());
        assert!(JobKind::Story.validate_parameters(&json!({"prompt": "x", "pageCount": 0})).is_err());
        assert!(JobKind::AutoStory.validate_parameters(&json!({"genre": "fable"})).is_ok());
        assert!(
            JobKind::Cartoonize
                .validate_parameters(&json!({"imageUrl": "https://cdn.example/p.png"}))
                .is_ok()
        );
        assert!(
            JobKind::Cartoonize
                .validate_parameters(&json!({"imageUrl": "ftp://cdn.example/p.png"}))
                .is_err()
        );
        assert!(JobKind::Scene.validate_parameters(&json!(["prompt"])).is_err());
    }

    #[test]
    fn overlong_prompt_is_rejected() {
        let prompt = "a".repeat(MAX_PROMPT_CHARS + 1);
        let err = JobKind::Scene
            .validate_parameters(&json!({ "prompt": prompt }))
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::validation(format!("prompt must be at most {MAX_PROMPT_CHARS} characters"))
        );
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: phase labels never move backwards as progress grows.
            #[test]
            fn phase_is_monotonic(a in 0u8..=100, b in 0u8..=100) {
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                for kind in JobKind::ALL {
                    let phases = kind.profile().phases;
                    let idx = |p: u8| phases.iter().rposition(|band| band.from <= p).unwrap();
                    prop_assert!(idx(lo) <= idx(hi));
                }
            }

            /// Property: remaining time is at least a minute and non-increasing in progress.
            #[test]
            fn remaining_is_positive_and_shrinks(a in 0u8..100, b in 0u8..100) {
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                for kind in JobKind::ALL {
                    let profile = kind.profile();
                    prop_assert!(profile.remaining_minutes(hi) >= 1);
                    prop_assert!(profile.remaining_minutes(lo) >= profile.remaining_minutes(hi));
                }
            }
        }
    }
}
