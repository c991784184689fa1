//! Persisted automation schedules.
//!
//! A schedule is a flat text file, one action per line, upper-case kind plus
//! an optional argument. Blank lines and `#` comments are ignored on load and
//! not preserved on save; the action list itself round-trips exactly.
//!
//! ```text
//! # warm-up and reference
//! SET
//! REF
//! SLEEP 30
//! DEFO
//! GOTO 2
//! END
//! ```

use crate::error::SequenceError;
use std::fmt;
use std::path::{Path, PathBuf};

/// One entry of an automation schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleAction {
    /// Acquire a plain image.
    Set,
    /// Acquire the reference image; later DEFO steps require this.
    Ref,
    /// Acquire a deformation image; requires a prior REF or FILE_REF.
    Defo,
    /// Load a plain image from disk.
    FileSet(PathBuf),
    /// Load the reference image from disk.
    FileRef(PathBuf),
    /// Load a deformation image from disk; requires a prior REF or FILE_REF.
    FileDefo(PathBuf),
    /// Record the laser measurement value.
    Temp,
    /// Wait the given number of seconds; pausable.
    Sleep(u64),
    /// Jump the cursor to the given 0-based entry index.
    Goto(usize),
    /// Finish the run.
    End,
}

impl ScheduleAction {
    /// Upper-case kind token used in the persisted format.
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleAction::Set => "SET",
            ScheduleAction::Ref => "REF",
            ScheduleAction::Defo => "DEFO",
            ScheduleAction::FileSet(_) => "FILE_SET",
            ScheduleAction::FileRef(_) => "FILE_REF",
            ScheduleAction::FileDefo(_) => "FILE_DEFO",
            ScheduleAction::Temp => "TEMP",
            ScheduleAction::Sleep(_) => "SLEEP",
            ScheduleAction::Goto(_) => "GOTO",
            ScheduleAction::End => "END",
        }
    }

    fn parse(line_no: usize, line: &str) -> Result<Self, SequenceError> {
        let invalid = |reason: String| SequenceError::InvalidScheduleEntry {
            line: line_no,
            reason,
        };

        let mut parts = line.splitn(2, char::is_whitespace);
        let kind = parts.next().unwrap_or_default();
        let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());

        let needs_no_arg = |action: ScheduleAction| match arg {
            None => Ok(action),
            Some(extra) => Err(invalid(format!("{} takes no argument, got '{}'", kind, extra))),
        };

        match kind {
            "SET" => needs_no_arg(ScheduleAction::Set),
            "REF" => needs_no_arg(ScheduleAction::Ref),
            "DEFO" => needs_no_arg(ScheduleAction::Defo),
            "TEMP" => needs_no_arg(ScheduleAction::Temp),
            "END" => needs_no_arg(ScheduleAction::End),
            "FILE_SET" | "FILE_REF" | "FILE_DEFO" => {
                let path = arg.ok_or_else(|| invalid(format!("{} requires a file path", kind)))?;
                let path = PathBuf::from(path);
                Ok(match kind {
                    "FILE_SET" => ScheduleAction::FileSet(path),
                    "FILE_REF" => ScheduleAction::FileRef(path),
                    _ => ScheduleAction::FileDefo(path),
                })
            }
            "SLEEP" => {
                let secs = arg
                    .and_then(|a| a.parse().ok())
                    .ok_or_else(|| invalid("SLEEP requires a duration in whole seconds".into()))?;
                Ok(ScheduleAction::Sleep(secs))
            }
            "GOTO" => {
                let index = arg
                    .and_then(|a| a.parse().ok())
                    .ok_or_else(|| invalid("GOTO requires a 0-based entry index".into()))?;
                Ok(ScheduleAction::Goto(index))
            }
            other => Err(invalid(format!("unknown action '{}'", other))),
        }
    }
}

impl fmt::Display for ScheduleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleAction::FileSet(path)
            | ScheduleAction::FileRef(path)
            | ScheduleAction::FileDefo(path) => {
                write!(f, "{} {}", self.kind(), path.display())
            }
            ScheduleAction::Sleep(secs) => write!(f, "SLEEP {}", secs),
            ScheduleAction::Goto(index) => write!(f, "GOTO {}", index),
            other => f.write_str(other.kind()),
        }
    }
}

/// Ordered list of automation actions.
///
/// A schedule parsed from text remembers which source line each entry came
/// from, so validation errors point at the original file even when comments
/// and blank lines were skipped. Equality compares the action list only.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    actions: Vec<ScheduleAction>,
    source_lines: Vec<usize>,
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.actions == other.actions
    }
}

impl Eq for Schedule {}

impl Schedule {
    /// Build a schedule from an action list.
    pub fn new(actions: Vec<ScheduleAction>) -> Self {
        let source_lines = (1..=actions.len()).collect();
        Self { actions, source_lines }
    }

    /// Parse the flat text format. Blank lines and `#` comments are skipped;
    /// line numbers in errors refer to the original text.
    pub fn parse(text: &str) -> Result<Self, SequenceError> {
        let mut actions = Vec::new();
        let mut source_lines = Vec::new();
        for (i, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            actions.push(ScheduleAction::parse(i + 1, line)?);
            source_lines.push(i + 1);
        }
        Ok(Self { actions, source_lines })
    }

    /// Load a schedule from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SequenceError> {
        let text = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| SequenceError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::parse(&text)
    }

    /// Save the schedule to a file, one action per line.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), SequenceError> {
        tokio::fs::write(path.as_ref(), self.to_text())
            .await
            .map_err(|e| SequenceError::Io(format!("{}: {}", path.as_ref().display(), e)))
    }

    /// Render the persisted text form.
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for action in &self.actions {
            text.push_str(&action.to_string());
            text.push('\n');
        }
        text
    }

    /// Static checks run before the first step executes.
    ///
    /// Catches what can be caught without running: GOTO targets out of bounds
    /// or jumping to themselves (a spin loop), and a DEFO in a schedule that
    /// contains no reference acquisition at all. Errors report the same line
    /// numbers the parser would, counting comments and blank lines.
    pub fn validate(&self) -> Result<(), SequenceError> {
        let has_reference = self.actions.iter().any(|a| {
            matches!(a, ScheduleAction::Ref | ScheduleAction::FileRef(_))
        });

        for (i, action) in self.actions.iter().enumerate() {
            let entry = self.source_line(i);
            match action {
                ScheduleAction::Goto(target) => {
                    if *target >= self.actions.len() {
                        return Err(SequenceError::InvalidScheduleEntry {
                            line: entry,
                            reason: format!(
                                "GOTO target {} out of bounds (schedule has {} entries)",
                                target,
                                self.actions.len()
                            ),
                        });
                    }
                    if *target == i {
                        return Err(SequenceError::InvalidScheduleEntry {
                            line: entry,
                            reason: "GOTO jumps to itself".into(),
                        });
                    }
                }
                ScheduleAction::Defo | ScheduleAction::FileDefo(_) if !has_reference => {
                    return Err(SequenceError::InvalidScheduleEntry {
                        line: entry,
                        reason: format!("{} with no REF or FILE_REF anywhere in the schedule", action.kind()),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn source_line(&self, index: usize) -> usize {
        self.source_lines.get(index).copied().unwrap_or(index + 1)
    }

    /// The ordered action list.
    pub fn actions(&self) -> &[ScheduleAction] {
        &self.actions
    }

    /// Action at `index`, if any.
    pub fn get(&self, index: usize) -> Option<&ScheduleAction> {
        self.actions.get(index)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether the schedule has no entries.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.actions.clear();
        self.source_lines.clear();
    }
}
