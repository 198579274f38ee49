//! Seed row loading and permutation

use crate::config::SeedConfig;
use crate::seed::mutator::IngestMutator;
use crate::seed::{SeedError, SeedResult};
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// A single record from the seed source
///
/// The ordinal `id` is assigned once at load time from the row's position in the
/// source and never changes, even when the sequence is shuffled afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedRow {
    /// 1-based position in the original seed source
    pub id: u64,

    /// Declared fields, in declaration order
    pub fields: IndexMap<String, String>,

    /// The source line, verbatim
    pub raw: String,

    /// Free-form values set by the ingestion mutator
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub extra: IndexMap<String, serde_json::Value>,
}

impl SeedRow {
    /// Returns the value of a declared field
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Supported seed file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedFormat {
    /// Comma separated
    Csv,

    /// Tab separated
    Tsv,

    /// Any separator, which must be configured explicitly
    Delimited,
}

impl SeedFormat {
    /// The separator used when none is configured
    pub fn default_separator(&self) -> Option<&'static str> {
        match self {
            Self::Csv => Some(","),
            Self::Tsv => Some("\t"),
            Self::Delimited => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Tsv => "tsv",
            Self::Delimited => "delimited",
        }
    }
}

impl FromStr for SeedFormat {
    type Err = SeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "tsv" => Ok(Self::Tsv),
            "delimited" => Ok(Self::Delimited),
            _ => Err(SeedError::UnsupportedFormat(s.to_string())),
        }
    }
}

impl fmt::Display for SeedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How to split the seed source into rows and fields
#[derive(Debug, Clone)]
pub struct SeedLayout {
    pub format: SeedFormat,
    pub separator: String,
    pub line_terminator: String,
    pub columns: IndexMap<String, usize>,
}

impl SeedLayout {
    /// Resolves the layout declared in the seed configuration
    ///
    /// Fails with `SeedError::UnsupportedFormat` for an unknown format name.
    pub fn from_config(config: &SeedConfig) -> SeedResult<Self> {
        let format: SeedFormat = config.format.parse()?;
        let separator = match (&config.separator, format.default_separator()) {
            (Some(sep), _) => sep.clone(),
            (None, Some(sep)) => sep.to_string(),
            (None, None) => return Err(SeedError::MissingSeparator(format.to_string())),
        };

        Ok(Self {
            format,
            separator,
            line_terminator: config.line_terminator.clone(),
            columns: config.columns.clone(),
        })
    }
}

/// The loaded, ordinal-stamped seed sequence
#[derive(Debug, Clone)]
pub struct SeedStore {
    header: String,
    rows: Vec<SeedRow>,
    layout: SeedLayout,
}

impl SeedStore {
    /// Reads and parses the seed file at `path`
    pub fn load(path: &Path, layout: SeedLayout, mutator: &dyn IngestMutator) -> SeedResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let store = Self::parse(&content, layout, mutator)?;
        tracing::info!(
            "Loaded {} seed rows from {} ({})",
            store.len(),
            path.display(),
            store.layout.format
        );
        Ok(store)
    }

    /// Parses seed content already in memory
    ///
    /// The first record is the header and is kept verbatim. Blank records are
    /// ignored. Ordinals are assigned before the mutator runs on each row.
    pub fn parse(content: &str, layout: SeedLayout, mutator: &dyn IngestMutator) -> SeedResult<Self> {
        let mut records = content.split(layout.line_terminator.as_str());
        let header = records
            .next()
            .filter(|h| !h.trim().is_empty())
            .ok_or(SeedError::MissingHeader)?
            .to_string();

        let mut rows = Vec::new();
        for (offset, raw) in records.enumerate() {
            if raw.trim().is_empty() {
                continue;
            }

            let cells: Vec<&str> = raw.split(layout.separator.as_str()).collect();
            let mut fields = IndexMap::with_capacity(layout.columns.len());
            for (name, &index) in &layout.columns {
                let value = cells.get(index).ok_or_else(|| SeedError::MissingColumn {
                    // header is line 1
                    line: offset + 2,
                    column: name.clone(),
                    index,
                })?;
                fields.insert(name.clone(), value.to_string());
            }

            let mut row = SeedRow {
                id: rows.len() as u64 + 1,
                fields,
                raw: raw.to_string(),
                extra: IndexMap::new(),
            };
            mutator.mutate(&mut row);
            rows.push(row);
        }

        Ok(Self {
            header,
            rows,
            layout,
        })
    }

    /// The header line, verbatim
    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn rows(&self) -> &[SeedRow] {
        &self.rows
    }

    pub fn layout(&self) -> &SeedLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Consumes the store, returning the header and the rows
    pub fn into_parts(self) -> (String, Vec<SeedRow>) {
        (self.header, self.rows)
    }
}

/// Shuffles the rows in place (Fisher-Yates)
///
/// A `seed` makes the order reproducible. Ordinals are untouched.
pub fn permute(rows: &mut [SeedRow], seed: Option<u64>) {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    rows.shuffle(&mut rng);
}
