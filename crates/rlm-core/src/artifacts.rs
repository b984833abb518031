//! Per-run artifact directory and report.
//!
//! Each run owns `<base>/<run_id>`. Generated code writes there; files it
//! creates without registering are picked up by [`RunContext::scan_new_files`]
//! after every execution. A run context is shared by an agent and all of its
//! children, so its state sits behind a lock.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

pub const REPORT_FILENAME: &str = "report.md";

/// How deep the post-execution scan descends below the run directory.
const SCAN_DEPTH: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type ArtifactResult<T> = std::result::Result<T, ArtifactError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Image,
    Report,
    Data,
    File,
}

impl ArtifactKind {
    const PATTERNS: [(ArtifactKind, &'static [&'static str]); 3] = [
        (
            ArtifactKind::Image,
            &["*.png", "*.jpg", "*.jpeg", "*.gif", "*.svg", "*.webp"],
        ),
        (ArtifactKind::Report, &["*.md", "*.txt", "*.html"]),
        (ArtifactKind::Data, &["*.csv", "*.json", "*.xlsx"]),
    ];

    /// Infers the kind from a file name's extension, case-insensitively.
    pub fn classify(filename: &str) -> Self {
        let options = MatchOptions {
            case_sensitive: false,
            ..MatchOptions::new()
        };
        Self::PATTERNS
            .iter()
            .find(|(_, patterns)| {
                patterns.iter().any(|p| {
                    Pattern::new(p)
                        .map(|pattern| pattern.matches_with(filename, options))
                        .unwrap_or(false)
                })
            })
            .map_or(ArtifactKind::File, |(kind, _)| *kind)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Report => "report",
            Self::Data => "data",
            Self::File => "file",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Path relative to the run directory.
    pub filename: String,
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub description: String,
    /// `None` for files found by the post-execution scan.
    pub created_at: Option<DateTime<Utc>>,
    pub prompt: Option<String>,
    pub section: Option<String>,
    pub rationale: Option<String>,
}

/// Registration request for [`RunContext::register_artifact`].
#[derive(Debug, Clone)]
pub struct NewArtifact {
    filename: String,
    kind: ArtifactKind,
    description: String,
    prompt: Option<String>,
    section: Option<String>,
    rationale: Option<String>,
}

impl NewArtifact {
    pub fn new(filename: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            filename: filename.into(),
            kind,
            description: String::new(),
            prompt: None,
            section: None,
            rationale: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// The instruction that produced the artifact.
    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Intended report section.
    pub fn section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    pub fn rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }
}

#[derive(Debug, Default)]
struct RunState {
    artifacts: Vec<ArtifactRecord>,
    report: Vec<String>,
}

#[derive(Debug)]
pub struct RunContext {
    run_id: String,
    dir: PathBuf,
    state: Mutex<RunState>,
}

impl RunContext {
    /// Creates `<base>/<generated run id>`.
    pub fn create(base: impl AsRef<Path>) -> ArtifactResult<Self> {
        Self::with_id(base, generate_run_id())
    }

    pub fn with_id(base: impl AsRef<Path>, run_id: impl Into<String>) -> ArtifactResult<Self> {
        let run_id = run_id.into();
        let base = absolute(base.as_ref());
        let dir = base.join(&run_id);
        std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        tracing::debug!(run_id = %run_id, dir = %dir.display(), "run directory ready");
        Ok(Self {
            run_id,
            dir,
            state: Mutex::new(RunState::default()),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Absolute directory generated code runs in.
    pub fn working_dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    /// Records an artifact and returns where it should be written.
    pub fn register_artifact(&self, artifact: NewArtifact) -> PathBuf {
        let path = self.artifact_path(&artifact.filename);
        let record = ArtifactRecord {
            filename: artifact.filename,
            path: path.clone(),
            kind: artifact.kind,
            description: artifact.description,
            created_at: Some(Utc::now()),
            prompt: artifact.prompt,
            section: artifact.section,
            rationale: artifact.rationale,
        };
        self.state.lock().artifacts.push(record);
        path
    }

    /// Registers files under the run directory that no record names yet.
    pub fn scan_new_files(&self) -> Vec<ArtifactRecord> {
        let mut found = Vec::new();
        let mut state = self.state.lock();
        let entries = WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(SCAN_DEPTH)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file());
        for entry in entries {
            let Ok(relative) = entry.path().strip_prefix(&self.dir) else {
                continue;
            };
            let filename = relative.to_string_lossy().replace('\\', "/");
            if state.artifacts.iter().any(|a| a.filename == filename) {
                continue;
            }
            let kind = ArtifactKind::classify(&filename);
            let record = ArtifactRecord {
                filename,
                path: entry.path().to_path_buf(),
                kind,
                description: format!("Auto-detected {kind}"),
                created_at: None,
                prompt: None,
                section: None,
                rationale: None,
            };
            state.artifacts.push(record.clone());
            found.push(record);
        }
        if !found.is_empty() {
            tracing::debug!(count = found.len(), "detected new artifacts");
        }
        found
    }

    pub fn artifacts(&self) -> Vec<ArtifactRecord> {
        self.state.lock().artifacts.clone()
    }

    pub fn list_images(&self) -> Vec<ArtifactRecord> {
        self.state
            .lock()
            .artifacts
            .iter()
            .filter(|a| a.kind == ArtifactKind::Image)
            .cloned()
            .collect()
    }

    pub fn add_to_report(&self, content: impl Into<String>) {
        self.state.lock().report.push(content.into());
    }

    pub fn add_image_to_report(&self, filename: &str, caption: &str) {
        let markdown = if caption.is_empty() {
            format!("![{filename}]({filename})")
        } else {
            format!("![{caption}]({filename})\n*{caption}*")
        };
        self.add_to_report(markdown);
    }

    /// Report sections joined by blank lines.
    pub fn report(&self) -> String {
        self.state.lock().report.join("\n\n")
    }

    /// Writes the report and registers it as a report artifact.
    pub fn save_report(&self, filename: &str) -> ArtifactResult<PathBuf> {
        let content = self.report();
        let path = self.register_artifact(
            NewArtifact::new(filename, ArtifactKind::Report).description("Final run report"),
        );
        std::fs::write(&path, content).map_err(io_err(&path))?;
        Ok(path)
    }

    /// Deletes the run directory and forgets its artifacts and report.
    pub fn cleanup(&self) -> ArtifactResult<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        }
        let mut state = self.state.lock();
        state.artifacts.clear();
        state.report.clear();
        Ok(())
    }
}

/// Timestamp id with a short random suffix so runs started in the same
/// second get distinct directories.
pub fn generate_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &suffix[..6])
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(ArtifactKind::classify("chart.PNG"), ArtifactKind::Image);
        assert_eq!(ArtifactKind::classify("notes.md"), ArtifactKind::Report);
        assert_eq!(ArtifactKind::classify("out/data.csv"), ArtifactKind::Data);
        assert_eq!(ArtifactKind::classify("model.bin"), ArtifactKind::File);
        assert_eq!(ArtifactKind::classify("README"), ArtifactKind::File);
    }

    #[test]
    fn test_create_makes_run_directory() {
        let base = tempfile::tempdir().unwrap();
        let run = RunContext::create(base.path()).unwrap();
        assert!(run.working_dir().is_dir());
        assert!(run.working_dir().starts_with(base.path()));
        assert!(run.working_dir().ends_with(run.run_id()));
    }

    #[test]
    fn test_register_with_metadata() {
        let base = tempfile::tempdir().unwrap();
        let run = RunContext::with_id(base.path(), "r1").unwrap();
        let path = run.register_artifact(
            NewArtifact::new("plot.png", ArtifactKind::Image)
                .description("A plot")
                .prompt("draw it")
                .section("Results"),
        );
        assert_eq!(path, base.path().join("r1").join("plot.png"));
        let images = run.list_images();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].section.as_deref(), Some("Results"));
        assert!(images[0].created_at.is_some());
    }

    #[test]
    fn test_scan_skips_registered_files() {
        let base = tempfile::tempdir().unwrap();
        let run = RunContext::with_id(base.path(), "r2").unwrap();
        let registered = run.register_artifact(NewArtifact::new("known.csv", ArtifactKind::Data));
        std::fs::write(registered, "a,b").unwrap();
        std::fs::write(run.artifact_path("fresh.png"), b"png").unwrap();
        std::fs::create_dir(run.artifact_path("sub")).unwrap();
        std::fs::write(run.artifact_path("sub/table.json"), "{}").unwrap();

        let found = run.scan_new_files();
        let names: Vec<_> = found.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(names, ["fresh.png", "sub/table.json"]);
        assert_eq!(found[0].description, "Auto-detected image");
        assert!(run.scan_new_files().is_empty());
        assert_eq!(run.artifacts().len(), 3);
    }

    #[test]
    fn test_report_and_save() {
        let base = tempfile::tempdir().unwrap();
        let run = RunContext::with_id(base.path(), "r3").unwrap();
        run.add_to_report("# Title");
        run.add_image_to_report("a.png", "");
        run.add_image_to_report("b.png", "Growth");
        assert_eq!(run.report(), "# Title\n\n![a.png](a.png)\n\n![Growth](b.png)\n*Growth*");

        let path = run.save_report(REPORT_FILENAME).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), run.report());
        assert_eq!(run.artifacts()[0].kind, ArtifactKind::Report);
    }

    #[test]
    fn test_cleanup_removes_directory() {
        let base = tempfile::tempdir().unwrap();
        let run = RunContext::with_id(base.path(), "r4").unwrap();
        std::fs::write(run.artifact_path("x.txt"), "x").unwrap();
        run.scan_new_files();
        run.cleanup().unwrap();
        assert!(!run.working_dir().exists());
        assert!(run.artifacts().is_empty());
    }

    #[test]
    fn test_run_ids_are_distinct() {
        assert_ne!(generate_run_id(), generate_run_id());
    }
}
