//! Integration tests for router output normalisation.

use rlm_core::Action;

#[test]
fn test_exact_token_any_case() {
    for (raw, expected) in [
        ("CODE", Action::Code),
        ("answer", Action::Answer),
        ("DeLeGaTe", Action::Delegate),
    ] {
        assert_eq!(Action::normalize(raw), expected);
    }
}

#[test]
fn test_verbose_numbered_list_without_keyword_is_answer() {
    let raw = "1. Categorize the articles by topic\n2. Extract the key points\n3. Summarize the findings";
    assert_eq!(Action::normalize(raw), Action::Answer);
}

#[test]
fn test_first_keyword_by_position() {
    assert_eq!(
        Action::normalize("We could DELEGATE, but CODE is simpler"),
        Action::Delegate
    );
}

#[test]
fn test_heuristics_then_default() {
    assert_eq!(Action::normalize("Let me compute that"), Action::Code);
    assert_eq!(Action::normalize("Decompose into parts"), Action::Delegate);
    assert_eq!(Action::normalize("hmm"), Action::Answer);
}
