use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::document::Document;
use crate::error::PipelineError;
use crate::section::SectionBounds;

/// One selectable reward: a display label and the exact option line that
/// selects it once uncommented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub label: String,
    pub option_line: String,
}

impl Candidate {
    pub fn new(label: impl Into<String>, option_line: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            option_line: option_line.into(),
        }
    }
}

/// What to do with an option line that appears before any label line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    #[default]
    Drop,
    Reject,
}

/// Extracts the interesting part of a trimmed line, if the line matches.
pub trait LineMatcher: Send + Sync {
    fn capture(&self, line: &str) -> Option<String>;
}

/// Matcher backed by a regex; capture group 1 is the extracted text.
#[derive(Debug, Clone)]
pub struct RegexMatcher {
    re: Regex,
}

impl RegexMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            re: Regex::new(pattern)?,
        })
    }
}

impl LineMatcher for RegexMatcher {
    fn capture(&self, line: &str) -> Option<String> {
        self.re
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

// `# Ring of the Abyss (639)`
const SIMC_LABEL_PATTERN: &str = r"^# (.+) \(\d+\)$";
// `# finger1=,id=12345,bonus_id=...`
const SIMC_OPTION_PATTERN: &str = r"^# (\w+=,id=\d+,.+)$";

/// The pair of matchers that recognise label lines and option lines.
pub struct RewardFormat {
    label: Box<dyn LineMatcher>,
    option: Box<dyn LineMatcher>,
}

impl RewardFormat {
    pub fn new(label: Box<dyn LineMatcher>, option: Box<dyn LineMatcher>) -> Self {
        Self { label, option }
    }

    /// Format of the reward section emitted by the SimC addon.
    pub fn simc() -> Result<Self, PipelineError> {
        let label = RegexMatcher::new(SIMC_LABEL_PATTERN)?;
        let option = RegexMatcher::new(SIMC_OPTION_PATTERN)?;
        Ok(Self::new(Box::new(label), Box::new(option)))
    }
}

pub fn parse_candidates(
    doc: &Document,
    bounds: SectionBounds,
    format: &RewardFormat,
    policy: OrphanPolicy,
) -> Result<Vec<Candidate>, PipelineError> {
    let mut out = Vec::new();
    let mut current_label: Option<String> = None;
    let len = doc.lines().len();
    let section = doc
        .lines()
        .get(bounds.start..=bounds.end)
        .filter(|_| bounds.start <= bounds.end)
        .ok_or(PipelineError::InvalidBounds {
            start: bounds.start,
            end: bounds.end,
            len,
        })?;
    for (offset, raw) in section.iter().enumerate() {
        let idx = bounds.start + offset;
        let line = raw.trim();
        if let Some(label) = format.label.capture(line) {
            current_label = Some(label);
        }
        let Some(option_line) = format.option.capture(line) else {
            continue;
        };
        match (&current_label, policy) {
            (Some(label), _) => out.push(Candidate::new(label.clone(), option_line)),
            (None, OrphanPolicy::Drop) => {
                debug!(line = idx, option = %option_line, "dropping option line with no label");
            }
            (None, OrphanPolicy::Reject) => {
                return Err(PipelineError::OrphanCandidate {
                    line: line.to_string(),
                })
            }
        }
    }
    Ok(out)
}

/// Removes candidates by 1-based position, keeping the rest in order.
pub fn remove_positions(
    candidates: Vec<Candidate>,
    positions: &[usize],
) -> Result<Vec<Candidate>, PipelineError> {
    let len = candidates.len();
    let mut drop = BTreeSet::new();
    for &position in positions {
        if position == 0 || position > len {
            return Err(PipelineError::InvalidPosition { position, len });
        }
        drop.insert(position - 1);
    }
    Ok(candidates
        .into_iter()
        .enumerate()
        .filter(|(idx, _)| !drop.contains(idx))
        .map(|(_, c)| c)
        .collect())
}

/// Parses positions such as `"1 5 9"` or `"1,5"`.
pub fn parse_positions(raw: &str) -> Result<Vec<usize>, PipelineError> {
    raw.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| PipelineError::UnparsablePosition { raw: s.to_string() })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::{locate_section, SectionMarkers};

    const TWO_REWARDS: &str = "\
warrior=\"Foo\"
level=80
### Weekly Reward Choices
#
# Signet of the Deep (639)
# finger1=,id=2001,bonus_id=10390/6652
#
# Cloak of Embers (636)
# back=,id=3002,bonus_id=10390
### End of Weekly Reward Choices
";

    fn parse(text: &str, policy: OrphanPolicy) -> Result<Vec<Candidate>, PipelineError> {
        let doc = Document::from_text(text);
        let bounds = locate_section(&doc, &SectionMarkers::default())?;
        parse_candidates(&doc, bounds, &RewardFormat::simc()?, policy)
    }

    #[test]
    fn parses_two_labelled_candidates_in_order() {
        let candidates = parse(TWO_REWARDS, OrphanPolicy::Drop).expect("parse");
        assert_eq!(
            candidates,
            vec![
                Candidate::new("Signet of the Deep", "finger1=,id=2001,bonus_id=10390/6652"),
                Candidate::new("Cloak of Embers", "back=,id=3002,bonus_id=10390"),
            ]
        );
    }

    #[test]
    fn removing_first_position_leaves_second() {
        let candidates = parse(TWO_REWARDS, OrphanPolicy::Drop).expect("parse");
        let rest = remove_positions(candidates, &[1]).expect("remove");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].label, "Cloak of Embers");
    }

    #[test]
    fn shared_label_yields_one_candidate_per_option() {
        let text = "\
### Weekly Reward Choices
# Band of Echoes (639)
# finger1=,id=2001,bonus_id=1
# finger2=,id=2001,bonus_id=1
### End of Weekly Reward Choices
";
        let candidates = parse(text, OrphanPolicy::Drop).expect("parse");
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c.label == "Band of Echoes"));
        assert!(candidates[0].option_line.starts_with("finger1="));
        assert!(candidates[1].option_line.starts_with("finger2="));
    }

    #[test]
    fn orphan_option_is_dropped_by_default() {
        let text = "\
### Weekly Reward Choices
# trinket1=,id=9,bonus_id=1
# Idol (630)
# trinket1=,id=10,bonus_id=1
### End of Weekly Reward Choices
";
        let candidates = parse(text, OrphanPolicy::Drop).expect("parse");
        assert_eq!(candidates, vec![Candidate::new("Idol", "trinket1=,id=10,bonus_id=1")]);
    }

    #[test]
    fn orphan_option_fails_under_reject_policy() {
        let text = "\
### Weekly Reward Choices
# trinket1=,id=9,bonus_id=1
### End of Weekly Reward Choices
";
        match parse(text, OrphanPolicy::Reject) {
            Err(PipelineError::OrphanCandidate { line }) => {
                assert_eq!(line, "# trinket1=,id=9,bonus_id=1")
            }
            other => panic!("expected OrphanCandidate, got {:?}", other),
        }
    }

    #[test]
    fn lines_outside_bounds_are_not_parsed() {
        let text = "\
# Outside (1)
# head=,id=1,bonus_id=1
### Weekly Reward Choices
### End of Weekly Reward Choices
# Later (2)
# head=,id=2,bonus_id=2
";
        let candidates = parse(text, OrphanPolicy::Reject).expect("parse");
        assert!(candidates.is_empty());
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let doc = Document::from_text(TWO_REWARDS);
        let format = RewardFormat::simc().expect("format");
        let err = parse_candidates(
            &doc,
            SectionBounds { start: 5, end: 2 },
            &format,
            OrphanPolicy::Drop,
        )
        .expect_err("inverted");
        assert!(matches!(
            err,
            PipelineError::InvalidBounds { start: 5, end: 2, len: 10 }
        ));
        let adjacent = parse_candidates(
            &doc,
            SectionBounds { start: 3, end: 2 },
            &format,
            OrphanPolicy::Drop,
        );
        assert!(matches!(adjacent, Err(PipelineError::InvalidBounds { .. })));
    }

    #[test]
    fn bounds_past_the_last_line_are_rejected() {
        let doc = Document::from_text(TWO_REWARDS);
        let format = RewardFormat::simc().expect("format");
        let err = parse_candidates(
            &doc,
            SectionBounds { start: 2, end: 10 },
            &format,
            OrphanPolicy::Drop,
        )
        .expect_err("past end");
        assert!(matches!(err, PipelineError::InvalidBounds { end: 10, len: 10, .. }));
    }

    #[test]
    fn single_line_bounds_parse_nothing() {
        let doc = Document::from_text(TWO_REWARDS);
        let format = RewardFormat::simc().expect("format");
        let candidates = parse_candidates(
            &doc,
            SectionBounds { start: 4, end: 4 },
            &format,
            OrphanPolicy::Reject,
        )
        .expect("parse");
        assert!(candidates.is_empty());
    }

    #[test]
    fn indented_lines_are_matched_after_trimming() {
        let text = "\
### Weekly Reward Choices
   # Signet (639)
\t# finger1=,id=1,bonus_id=2
### End of Weekly Reward Choices
";
        let candidates = parse(text, OrphanPolicy::Drop).expect("parse");
        assert_eq!(candidates, vec![Candidate::new("Signet", "finger1=,id=1,bonus_id=2")]);
    }

    #[test]
    fn alternate_format_swaps_matchers() {
        let format = RewardFormat::new(
            Box::new(RegexMatcher::new(r"^// \[(.+)\]$").expect("label")),
            Box::new(RegexMatcher::new(r"^// (slot:.+)$").expect("option")),
        );
        let doc = Document::from_text(
            "### Weekly Reward Choices\n// [Helm]\n// slot:head id:4\n### End of Weekly Reward Choices\n",
        );
        let bounds = locate_section(&doc, &SectionMarkers::default()).expect("bounds");
        let candidates =
            parse_candidates(&doc, bounds, &format, OrphanPolicy::Reject).expect("parse");
        assert_eq!(candidates, vec![Candidate::new("Helm", "slot:head id:4")]);
    }

    #[test]
    fn remove_positions_rejects_out_of_range() {
        let candidates = vec![Candidate::new("A", "a=,id=1,x")];
        assert!(matches!(
            remove_positions(candidates.clone(), &[0]),
            Err(PipelineError::InvalidPosition { position: 0, len: 1 })
        ));
        assert!(matches!(
            remove_positions(candidates, &[2]),
            Err(PipelineError::InvalidPosition { position: 2, len: 1 })
        ));
    }

    #[test]
    fn remove_positions_handles_unsorted_and_repeated_positions() {
        let candidates = vec![
            Candidate::new("A", "a=,id=1,x"),
            Candidate::new("B", "b=,id=2,x"),
            Candidate::new("C", "c=,id=3,x"),
            Candidate::new("D", "d=,id=4,x"),
        ];
        let rest = remove_positions(candidates, &[3, 1, 3]).expect("remove");
        let labels: Vec<&str> = rest.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["B", "D"]);
    }

    #[test]
    fn parse_positions_accepts_spaces_and_commas() {
        assert_eq!(parse_positions("1 5  9").expect("positions"), vec![1, 5, 9]);
        assert_eq!(parse_positions("2,3").expect("positions"), vec![2, 3]);
        assert!(parse_positions("").expect("empty").is_empty());
        assert!(matches!(
            parse_positions("1 x"),
            Err(PipelineError::UnparsablePosition { .. })
        ));
    }
}
