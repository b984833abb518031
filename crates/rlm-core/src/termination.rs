//! Detection of the `FINAL(...)` / `FINAL_VAR(...)` termination markers in
//! execution output.
//!
//! Literal forms are tried in a fixed order and the first pattern that
//! matches anywhere wins:
//!
//! 1. `FINAL("""...""")`
//! 2. `FINAL('''...''')`
//! 3. `FINAL("...")`
//! 4. `FINAL('...')`
//! 5. `FINAL(f"...")`
//! 6. `FINAL(f'...')`

use std::sync::OnceLock;

use regex::Regex;

use crate::sandbox::Namespace;

const LITERAL_PATTERNS: [&str; 6] = [
    r#"(?s)FINAL\s*\(\s*"""(.*)""""#,
    r"(?s)FINAL\s*\(\s*'''(.*)'''",
    r#"(?s)FINAL\s*\(\s*"([^"]*)""#,
    r"(?s)FINAL\s*\(\s*'([^']*)'",
    r#"(?s)FINAL\s*\(\s*f"([^"]*)""#,
    r"(?s)FINAL\s*\(\s*f'([^']*)'",
];

const VARIABLE_PATTERN: &str = r"FINAL_VAR\s*\(\s*(\w+)\s*\)";

fn literal_regexes() -> &'static [Regex] {
    static CELL: OnceLock<Vec<Regex>> = OnceLock::new();
    CELL.get_or_init(|| {
        LITERAL_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

fn variable_regex() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    CELL.get_or_init(|| Regex::new(VARIABLE_PATTERN).ok()).as_ref()
}

/// Cheap pre-check before any pattern matching.
pub fn is_final(text: &str) -> bool {
    text.contains("FINAL(") || text.contains("FINAL_VAR(")
}

/// The trimmed inner text of the first literal marker, by pattern priority.
pub fn extract_final(text: &str) -> Option<String> {
    literal_regexes()
        .iter()
        .find_map(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// The identifier named by the first `FINAL_VAR(name)` marker.
pub fn final_var_name(text: &str) -> Option<&str> {
    variable_regex()?
        .captures(text)?
        .get(1)
        .map(|m| m.as_str())
}

/// The string form of the variable named by `FINAL_VAR(name)`, when bound.
pub fn extract_final_var(text: &str, ns: &Namespace) -> Option<String> {
    let name = final_var_name(text)?;
    ns.lookup(name).map(|value| value.to_str())
}

/// Literal form first, then the variable form.
pub fn resolve(text: &str, ns: &Namespace) -> Option<String> {
    if !is_final(text) {
        return None;
    }
    extract_final(text).or_else(|| extract_final_var(text, ns))
}

/// Marker text that [`extract_final`] parses back to `answer` (trimmed).
pub fn literal_marker(answer: &str) -> String {
    if !answer.contains('"') {
        format!("FINAL(\"{answer}\")")
    } else if !answer.contains('\'') {
        format!("FINAL('{answer}')")
    } else if !answer.contains("\"\"\"") {
        format!("FINAL(\"\"\"{answer}\"\"\")")
    } else {
        format!("FINAL('''{answer}''')")
    }
}

pub fn variable_marker(name: &str) -> String {
    format!("FINAL_VAR({name})")
}

/// Whether `name` would be matched by the `FINAL_VAR` pattern.
pub fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxGlobals;
    use crate::sandbox::Value;

    #[test]
    fn test_is_final() {
        assert!(is_final("x FINAL(\"a\")"));
        assert!(is_final("FINAL_VAR(result)"));
        assert!(!is_final("final answer"));
        assert!(!is_final("FINAL ANSWER"));
    }

    #[test]
    fn test_six_literal_styles() {
        let cases = [
            ("FINAL(\"\"\"  multi\nline  \"\"\")", "multi\nline"),
            ("FINAL('''triple single''')", "triple single"),
            ("FINAL(\"double\")", "double"),
            ("FINAL('single')", "single"),
            ("FINAL(f\"fmt {x}\")", "fmt {x}"),
            ("FINAL(f'fmt single')", "fmt single"),
        ];
        for (text, expected) in cases {
            assert_eq!(extract_final(text).as_deref(), Some(expected), "{text}");
        }
    }

    #[test]
    fn test_whitespace_inside_call() {
        assert_eq!(extract_final("FINAL ( \"4\" )").as_deref(), Some("4"));
    }

    #[test]
    fn test_unsupported_shapes() {
        assert_eq!(extract_final("FINAL(42)"), None);
        assert_eq!(extract_final("FINAL(answer)"), None);
        assert_eq!(extract_final("no marker"), None);
    }

    #[test]
    fn test_priority_over_position() {
        // Double quotes outrank single quotes even when they appear later.
        let text = "FINAL('first') then FINAL(\"second\")";
        assert_eq!(extract_final(text).as_deref(), Some("second"));
    }

    #[test]
    fn test_variable_form() {
        let mut ns = SandboxGlobals::builder().build();
        ns.set_global("result", Value::Int(42));
        assert_eq!(extract_final_var("FINAL_VAR(result)", &ns).as_deref(), Some("42"));
        assert_eq!(extract_final_var("FINAL_VAR( missing )", &ns), None);
        assert_eq!(extract_final_var("FINAL_VAR('result')", &ns), None);
    }

    #[test]
    fn test_resolve_prefers_literal() {
        let mut ns = SandboxGlobals::builder().build();
        ns.set_global("x", Value::str("from var"));
        assert_eq!(
            resolve("FINAL_VAR(x)\nFINAL(\"lit\")", &ns).as_deref(),
            Some("lit")
        );
        assert_eq!(resolve("FINAL_VAR(x)", &ns).as_deref(), Some("from var"));
        assert_eq!(resolve("nothing", &ns), None);
    }

    #[test]
    fn test_literal_marker_round_trips_quotes() {
        for answer in ["4", "say \"hi\"", "it's", "both ' and \"", "a\nb"] {
            assert_eq!(extract_final(&literal_marker(answer)).as_deref(), Some(answer));
        }
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("total_2"));
        assert!(!is_identifier("a b"));
        assert!(!is_identifier(""));
    }
}
