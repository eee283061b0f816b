use std::{
    fmt,
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    str::FromStr,
};

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One row of the implicit-feedback table, keyed by the dataset's original ids.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    /// Original user identifier.
    pub user: u32,
    /// Original item identifier.
    pub item: u32,
    /// Explicit rating; only its presence matters for training.
    pub rating: f32,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
}

impl Interaction {
    /// Creates an interaction.
    #[must_use]
    pub const fn new(user: u32, item: u32, rating: f32, timestamp: i64) -> Self {
        Self {
            user,
            item,
            rating,
            timestamp,
        }
    }
}

/// Ordered interaction table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionTable {
    rows: Vec<Interaction>,
}

impl InteractionTable {
    /// Wraps a list of rows.
    #[must_use]
    pub fn new(rows: Vec<Interaction>) -> Self {
        Self { rows }
    }

    /// Rows in load order.
    #[must_use]
    pub fn rows(&self) -> &[Interaction] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterates over rows.
    pub fn iter(&self) -> std::slice::Iter<'_, Interaction> {
        self.rows.iter()
    }

    /// Distinct users in first-appearance order.
    #[must_use]
    pub fn users(&self) -> IndexSet<u32> {
        self.rows.iter().map(|row| row.user).collect()
    }

    /// Distinct items in first-appearance order.
    #[must_use]
    pub fn items(&self) -> IndexSet<u32> {
        self.rows.iter().map(|row| row.item).collect()
    }

    /// Rows grouped per user, users in first-appearance order.
    #[must_use]
    pub fn group_by_user(&self) -> IndexMap<u32, Vec<Interaction>> {
        let mut groups: IndexMap<u32, Vec<Interaction>> = IndexMap::new();
        for row in &self.rows {
            groups.entry(row.user).or_default().push(*row);
        }
        groups
    }

    /// Keeps only the rows matching `predicate`.
    #[must_use]
    pub fn filter(&self, mut predicate: impl FnMut(&Interaction) -> bool) -> Self {
        Self {
            rows: self.rows.iter().filter(|row| predicate(row)).copied().collect(),
        }
    }
}

impl FromIterator<Interaction> for InteractionTable {
    fn from_iter<T: IntoIterator<Item = Interaction>>(iter: T) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a InteractionTable {
    type Item = &'a Interaction;
    type IntoIter = std::slice::Iter<'a, Interaction>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// Published MovieLens variants and their ratings file layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MovieLensSize {
    /// `ml-100k/u.data`, tab separated.
    #[serde(rename = "100k")]
    Ml100k,
    /// `ml-1m/ratings.dat`, `::` separated.
    #[serde(rename = "1m")]
    Ml1m,
    /// `ml-10M100K/ratings.dat`, `::` separated.
    #[serde(rename = "10m")]
    Ml10m,
    /// `ml-20m/ratings.csv`, comma separated with header.
    #[serde(rename = "20m")]
    Ml20m,
    /// `ml-latest-small/ratings.csv`, comma separated with header.
    LatestSmall,
}

enum RowLayout {
    Delimited { delimiter: u8, has_header: bool },
    DoubleColon,
}

impl MovieLensSize {
    /// File name of the ratings table inside the extracted archive.
    #[must_use]
    pub const fn ratings_file(self) -> &'static str {
        match self {
            Self::Ml100k => "u.data",
            Self::Ml1m | Self::Ml10m => "ratings.dat",
            Self::Ml20m | Self::LatestSmall => "ratings.csv",
        }
    }

    const fn layout(self) -> RowLayout {
        match self {
            Self::Ml100k => RowLayout::Delimited {
                delimiter: b'\t',
                has_header: false,
            },
            Self::Ml1m | Self::Ml10m => RowLayout::DoubleColon,
            Self::Ml20m | Self::LatestSmall => RowLayout::Delimited {
                delimiter: b',',
                has_header: true,
            },
        }
    }
}

impl fmt::Display for MovieLensSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ml100k => "100k",
            Self::Ml1m => "1m",
            Self::Ml10m => "10m",
            Self::Ml20m => "20m",
            Self::LatestSmall => "latest-small",
        };
        f.write_str(name)
    }
}

impl FromStr for MovieLensSize {
    type Err = DataError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().trim_start_matches("ml-") {
            "100k" => Ok(Self::Ml100k),
            "1m" => Ok(Self::Ml1m),
            "10m" => Ok(Self::Ml10m),
            "20m" => Ok(Self::Ml20m),
            "latest-small" | "latest_small" => Ok(Self::LatestSmall),
            _ => Err(DataError::UnknownSize(raw.to_string())),
        }
    }
}

/// Loads a MovieLens ratings table.
///
/// `path` may point at the ratings file itself or at the extracted dataset
/// directory containing it.
pub fn load_movielens(
    path: impl AsRef<Path>,
    size: MovieLensSize,
) -> Result<InteractionTable, DataError> {
    let path = resolve_ratings_path(path.as_ref(), size);
    match size.layout() {
        RowLayout::Delimited {
            delimiter,
            has_header,
        } => load_csv(&path, delimiter, has_header),
        RowLayout::DoubleColon => load_double_colon(&path),
    }
}

fn resolve_ratings_path(path: &Path, size: MovieLensSize) -> PathBuf {
    if path.is_dir() {
        path.join(size.ratings_file())
    } else {
        path.to_path_buf()
    }
}

/// Loads a delimited `user, item, rating, timestamp` table.
pub fn load_csv(
    path: impl AsRef<Path>,
    delimiter: u8,
    has_header: bool,
) -> Result<InteractionTable, DataError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| DataError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(has_header)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = record.position().map_or(0, csv::Position::line);
        let fields: Vec<&str> = record.iter().collect();
        rows.push(parse_fields(&fields, line)?);
    }
    if rows.is_empty() {
        return Err(DataError::Empty(path.to_path_buf()));
    }
    Ok(InteractionTable::new(rows))
}

fn load_double_colon(path: &Path) -> Result<InteractionTable, DataError> {
    let file = File::open(path).map_err(|source| DataError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut rows = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split("::").map(str::trim).collect();
        rows.push(parse_fields(&fields, idx as u64 + 1)?);
    }
    if rows.is_empty() {
        return Err(DataError::Empty(path.to_path_buf()));
    }
    Ok(InteractionTable::new(rows))
}

fn parse_fields(fields: &[&str], line: u64) -> Result<Interaction, DataError> {
    if fields.len() < 3 {
        return Err(DataError::Malformed {
            line,
            reason: format!("expected at least 3 fields, found {}", fields.len()),
        });
    }
    let user = parse_field::<u32>(fields[0], "user", line)?;
    let item = parse_field::<u32>(fields[1], "item", line)?;
    let rating = parse_field::<f32>(fields[2], "rating", line)?;
    let timestamp = match fields.get(3) {
        Some(raw) if !raw.is_empty() => parse_field::<i64>(raw, "timestamp", line)?,
        _ => 0,
    };
    Ok(Interaction::new(user, item, rating, timestamp))
}

fn parse_field<T: FromStr>(raw: &str, column: &str, line: u64) -> Result<T, DataError> {
    raw.parse().map_err(|_| DataError::Malformed {
        line,
        reason: format!("invalid {column} value `{raw}`"),
    })
}

/// Errors raised while loading interaction tables.
#[derive(Debug, Error)]
pub enum DataError {
    /// The ratings file could not be opened.
    #[error("cannot open {path}: {source}")]
    Open {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file held no rows.
    #[error("no interactions found in {0}")]
    Empty(PathBuf),
    /// A row could not be parsed.
    #[error("line {line}: {reason}")]
    Malformed {
        /// 1-based line number.
        line: u64,
        /// Description of the failure.
        reason: String,
    },
    /// Unrecognized MovieLens size name.
    #[error("unknown MovieLens size `{0}`")]
    UnknownSize(String),
    /// I/O error while reading.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// CSV framing error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}
