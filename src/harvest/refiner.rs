//! Reassembly of seed rows and fetched fields
//!
//! Once a run stops, every buffered outcome is turned into one output line: the
//! original seed line followed by the fields the refine function derives from the
//! payload. The first outcome fixes the new column names and their order; any
//! later outcome that disagrees is a bug in the refine function and stops the
//! reassembly without touching the response log.

use crate::config::RefineField;
use crate::storage::FetchOutcome;
use indexmap::IndexMap;
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while reassembling the output
#[derive(Debug, Error)]
pub enum RefineError {
    #[error(
        "Refine output for row {ordinal} has columns {found:?}, expected {expected:?} from the first row"
    )]
    Consistency {
        ordinal: u64,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Derives the new output columns from one outcome
///
/// Implemented for closures `Fn(&FetchOutcome) -> IndexMap<String, String>`.
pub trait RefineFn: Send + Sync {
    fn refine(&self, outcome: &FetchOutcome) -> IndexMap<String, String>;
}

impl<F> RefineFn for F
where
    F: Fn(&FetchOutcome) -> IndexMap<String, String> + Send + Sync,
{
    fn refine(&self, outcome: &FetchOutcome) -> IndexMap<String, String> {
        self(outcome)
    }
}

/// Picks values out of the payload with JSON pointers
#[derive(Debug, Clone, Default)]
pub struct PointerRefiner {
    fields: Vec<RefineField>,
}

impl PointerRefiner {
    pub fn new(fields: Vec<RefineField>) -> Self {
        Self { fields }
    }
}

impl RefineFn for PointerRefiner {
    fn refine(&self, outcome: &FetchOutcome) -> IndexMap<String, String> {
        self.fields
            .iter()
            .map(|field| {
                let value = outcome
                    .payload
                    .pointer(&field.pointer)
                    .map(render_value)
                    .unwrap_or_default();
                (field.name.clone(), value)
            })
            .collect()
    }
}

/// Strings verbatim, null as empty, everything else as JSON text
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Where and how the refined output is written
#[derive(Debug, Clone)]
pub struct RefineTarget {
    /// Seed header line, verbatim
    pub header: String,
    pub separator: String,
    pub line_terminator: String,
    pub path: PathBuf,
    /// Sort by ordinal before writing (set when the seed rows were shuffled)
    pub restore_order: bool,
}

/// Buffers outcomes during a run and writes the augmented file at the end
pub struct Refiner {
    refine: Box<dyn RefineFn>,
    target: RefineTarget,
    buffer: Vec<FetchOutcome>,
}

impl Refiner {
    pub fn new(refine: Box<dyn RefineFn>, target: RefineTarget) -> Self {
        Self {
            refine,
            target,
            buffer: Vec::new(),
        }
    }

    /// Adds outcomes logged by earlier runs
    pub fn preload(&mut self, outcomes: impl IntoIterator<Item = FetchOutcome>) {
        self.buffer.extend(outcomes);
    }

    /// Adds an outcome fetched in this run
    pub fn buffer(&mut self, outcome: FetchOutcome) {
        self.buffer.push(outcome);
    }

    pub fn buffered(&self) -> &[FetchOutcome] {
        &self.buffer
    }

    pub fn target(&self) -> &RefineTarget {
        &self.target
    }

    /// Writes the refined output, replacing any previous file
    ///
    /// Returns the number of data lines written. With nothing buffered the new
    /// column names are unknown, so no file is produced.
    pub fn run(&mut self) -> Result<usize, RefineError> {
        remove_stale(&self.target.path)?;

        if self.buffer.is_empty() {
            tracing::warn!("Nothing to refine, {} not written", self.target.path.display());
            return Ok(0);
        }

        if self.target.restore_order {
            self.buffer.sort_by_key(FetchOutcome::ordinal);
        }

        let rendered = render(
            &self.buffer,
            self.refine.as_ref(),
            &self.target.header,
            &self.target.separator,
            &self.target.line_terminator,
        )?;

        if let Some(parent) = self.target.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.target.path, rendered)?;

        tracing::info!(
            "Refined {} rows into {}",
            self.buffer.len(),
            self.target.path.display()
        );
        Ok(self.buffer.len())
    }
}

/// Renders outcomes, in the given order, as header plus one line per outcome
pub fn render(
    outcomes: &[FetchOutcome],
    refine: &dyn RefineFn,
    header: &str,
    separator: &str,
    line_terminator: &str,
) -> Result<String, RefineError> {
    let mut columns: Option<Vec<String>> = None;
    let mut lines = Vec::with_capacity(outcomes.len() + 1);

    for outcome in outcomes {
        let values = refine.refine(outcome);

        match &columns {
            None => columns = Some(values.keys().cloned().collect()),
            Some(expected) => {
                if !values.keys().eq(expected.iter()) {
                    return Err(RefineError::Consistency {
                        ordinal: outcome.ordinal(),
                        expected: expected.clone(),
                        found: values.keys().cloned().collect(),
                    });
                }
            }
        }

        lines.push(join_line(&outcome.seed.raw, values.values(), separator));
    }

    let columns = columns.unwrap_or_default();
    let mut out = join_line(header, columns.iter(), separator);
    out.push_str(line_terminator);
    for line in lines {
        out.push_str(&line);
        out.push_str(line_terminator);
    }
    Ok(out)
}

fn join_line<'a>(base: &str, extra: impl Iterator<Item = &'a String>, separator: &str) -> String {
    let mut line = base.to_string();
    for value in extra {
        line.push_str(separator);
        line.push_str(value);
    }
    line
}

fn remove_stale(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!("Removed previous output {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
