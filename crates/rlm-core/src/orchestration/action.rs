//! The router's action vocabulary and the normalisation of free-form router
//! output into it.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Code,
    Answer,
    Delegate,
}

/// Markers that read as a plan being described rather than an action.
const STEP_KEYWORDS: [&str; 1] = ["STEP"];

const CODE_KEYWORDS: [&str; 8] = [
    "CALCULATE", "COMPUTE", "ANALYZE", "ANALYSE", "EXECUTE", "PYTHON", "SCRIPT", "PROGRAM",
];

const DELEGATE_KEYWORDS: [&str; 6] = [
    "SPLIT", "DIVIDE", "SUBTASK", "SUB-TASK", "DECOMPOSE", "PARALLEL",
];

impl Action {
    pub const ALL: [Action; 3] = [Action::Answer, Action::Code, Action::Delegate];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Code => "CODE",
            Action::Answer => "ANSWER",
            Action::Delegate => "DELEGATE",
        }
    }

    /// Maps router output onto an action. Never fails; falls back to
    /// [`Action::Answer`].
    ///
    /// Priority: exact token, leading token, first whole-word token by
    /// position, heuristic keyword sets.
    pub fn normalize(raw: &str) -> Action {
        let text = raw.trim().to_uppercase();
        if text.is_empty() {
            return Action::Answer;
        }

        if let Some(action) = Self::ALL.into_iter().find(|a| text == a.as_str()) {
            return action;
        }

        if let Some(action) = Self::ALL.into_iter().find(|a| text.starts_with(a.as_str())) {
            return action;
        }

        if let Some(action) = first_token(&text) {
            return action;
        }

        let contains_any = |keywords: &[&str]| keywords.iter().any(|k| text.contains(k));
        if contains_any(&STEP_KEYWORDS) {
            Action::Answer
        } else if contains_any(&CODE_KEYWORDS) {
            Action::Code
        } else if contains_any(&DELEGATE_KEYWORDS) {
            Action::Delegate
        } else {
            Action::Answer
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn first_token(upper: &str) -> Option<Action> {
    static TOKEN: OnceLock<Option<Regex>> = OnceLock::new();
    let re = TOKEN
        .get_or_init(|| Regex::new(r"\b(ANSWER|CODE|DELEGATE)\b").ok())
        .as_ref()?;
    match re.find(upper)?.as_str() {
        "CODE" => Some(Action::Code),
        "DELEGATE" => Some(Action::Delegate),
        _ => Some(Action::Answer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(cases: &[(&str, Action)]) {
        for (raw, expected) in cases {
            assert_eq!(Action::normalize(raw), *expected, "{raw:?}");
        }
    }

    #[test]
    fn test_exact_tokens_any_case() {
        check(&[
            ("ANSWER", Action::Answer),
            ("code", Action::Code),
            ("Delegate", Action::Delegate),
            ("  answer  ", Action::Answer),
            ("\nCODE\n", Action::Code),
            ("\tDELEGATE\t", Action::Delegate),
        ]);
    }

    #[test]
    fn test_leading_token() {
        check(&[
            ("ANSWER: The capital of France is Paris", Action::Answer),
            ("CODE: I will write Python to calculate this", Action::Code),
            ("Answer - I can directly respond", Action::Answer),
            ("Code; generating a solution", Action::Code),
            ("CODING is not the same as CODE", Action::Code),
            ("ANSWER\n\nThe Fibonacci sequence starts with 0 and 1...", Action::Answer),
        ]);
    }

    #[test]
    fn test_first_token_by_position_wins() {
        check(&[
            ("The answer is: CODE the solution", Action::Answer),
            ("Use CODE to solve this, then ANSWER", Action::Code),
            ("Perhaps DELEGATE is the best approach", Action::Delegate),
            ("I need to write CODE to calculate this", Action::Code),
        ]);
    }

    #[test]
    fn test_heuristic_keywords() {
        check(&[
            ("First, I will CALCULATE the result using Python", Action::Code),
            ("I need to COMPUTE this mathematically", Action::Code),
            ("1. First, I will analyze the data", Action::Code),
            ("Let me SPLIT this problem into parts", Action::Delegate),
            ("This should be DIVIDED into smaller tasks", Action::Delegate),
            ("Step 1: Review the information", Action::Answer),
            ("Here are the steps to solve this problem:", Action::Answer),
        ]);
    }

    #[test]
    fn test_verbose_numbered_list_defaults_to_answer() {
        check(&[
            (
                "1. CATEGORIZE THE ARTICLES BASED ON THEIR MAIN TOPIC\n2. EXTRACT KEY INFORMATION\n3. SUMMARIZE THE FINDINGS",
                Action::Answer,
            ),
            ("", Action::Answer),
            ("   ", Action::Answer),
            ("Random gibberish without any action words", Action::Answer),
        ]);
    }

    #[test]
    fn test_display_matches_token() {
        assert_eq!(Action::Delegate.to_string(), "DELEGATE");
        assert_eq!(Action::normalize(&Action::Code.to_string()), Action::Code);
    }
}
