//! Answers assembled without the responder, and the artifact sections
//! appended to answers.

use crate::artifacts::ArtifactRecord;
use crate::history::ExecutionHistory;

/// Prefix of history entries recorded for delegation rounds rather than code.
pub const DELEGATION_PREFIX: &str = "DELEGATE:";

const RECENT_WINDOW: usize = 5;
const RECENT_OUTPUTS: usize = 2;
const SHORT_OUTPUT_CHARS: usize = 500;

/// What the run accomplished, built from history alone.
pub fn fallback_answer(history: &ExecutionHistory, images: &[ArtifactRecord]) -> String {
    if history.is_empty() {
        return "Task completed but no summary available.".to_string();
    }
    let executions = history
        .entries()
        .iter()
        .filter(|e| !e.code.starts_with(DELEGATION_PREFIX))
        .count();

    let mut summary = format!(
        "Task completed after {} steps with {} code executions.",
        history.len(),
        executions
    );

    if !images.is_empty() {
        summary.push_str(&format!("\n\nGenerated {} visualization(s):\n", images.len()));
        for image in images {
            summary.push_str(&format!("- {}\n", image.filename));
        }
    }

    let recent: Vec<&str> = history
        .entries()
        .iter()
        .rev()
        .take(RECENT_WINDOW)
        .map(|e| e.output.trim())
        .filter(|o| !o.is_empty() && o.chars().count() < SHORT_OUTPUT_CHARS)
        .take(RECENT_OUTPUTS)
        .collect();
    if !recent.is_empty() {
        summary.push_str("\n\nRecent outputs:\n");
        summary.push_str(&recent.join("\n"));
    }
    summary
}

/// One `filename | kind | section | description` line per artifact.
pub fn artifacts_info(artifacts: &[ArtifactRecord]) -> String {
    artifacts
        .iter()
        .map(|a| {
            format!(
                "{} | {} | {} | {}",
                a.filename,
                a.kind,
                a.section.as_deref().unwrap_or(""),
                a.description
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Appends a "Generated Visualizations" section that embeds each image.
pub fn enhance_with_artifacts(response: &str, images: &[ArtifactRecord]) -> String {
    if images.is_empty() {
        return response.to_string();
    }
    let mut out = response.trim().to_string();
    out.push_str("\n\n---\n\n## Generated Visualizations\n\n");
    for image in images {
        if let Some(section) = &image.section {
            out.push_str(&format!("### Section: {section}\n\n"));
        }
        let alt = if image.description.is_empty() {
            image.filename.as_str()
        } else {
            image.description.as_str()
        };
        out.push_str(&format!("![{alt}]({})\n\n", image.filename));
        if let Some(rationale) = &image.rationale {
            out.push_str(&format!("*Rationale:* {rationale}\n\n"));
        }
        if let Some(prompt) = &image.prompt {
            out.push_str(&format!("*Prompt:* `{prompt}`\n\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactKind;

    fn image(filename: &str) -> ArtifactRecord {
        ArtifactRecord {
            filename: filename.to_string(),
            path: filename.into(),
            kind: ArtifactKind::Image,
            description: "Sales chart".to_string(),
            created_at: None,
            prompt: None,
            section: Some("Results".to_string()),
            rationale: None,
        }
    }

    #[test]
    fn test_empty_history() {
        assert_eq!(
            fallback_answer(&ExecutionHistory::new(), &[]),
            "Task completed but no summary available."
        );
    }

    #[test]
    fn test_counts_and_recent_outputs() {
        let mut history = ExecutionHistory::new();
        history.add_entry("x = 1", "first", 1);
        history.add_entry("DELEGATE: 2 subtasks", "delegated", 2);
        history.add_entry("print(big)", "b".repeat(600), 3);
        history.add_entry("print(y)", "  last  ", 4);

        let text = fallback_answer(&history, &[image("chart.png")]);
        assert!(text.starts_with("Task completed after 4 steps with 3 code executions."));
        assert!(text.contains("Generated 1 visualization(s):\n- chart.png\n"));
        assert!(text.ends_with("Recent outputs:\nlast\ndelegated"));
    }

    #[test]
    fn test_enhance_with_artifacts() {
        assert_eq!(enhance_with_artifacts("plain", &[]), "plain");
        let text = enhance_with_artifacts("Answer.\n", &[image("chart.png")]);
        assert_eq!(
            text,
            "Answer.\n\n---\n\n## Generated Visualizations\n\n### Section: Results\n\n![Sales chart](chart.png)\n\n"
        );
    }

    #[test]
    fn test_artifacts_info_lines() {
        assert_eq!(
            artifacts_info(&[image("chart.png")]),
            "chart.png | image | Results | Sales chart"
        );
    }
}
