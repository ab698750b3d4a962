//! OBD-II parameter catalog
//!
//! Loads the reference table of standard PIDs and turns each row into a
//! [`ParameterDescriptor`]. The table is a CSV file with a header row and at
//! least the columns `Mode_hex`, `PID_hex` and `Description`; any other
//! columns are ignored.
//!
//! ```text
//! Mode_hex,PID_hex,Data_bytes,Description
//! 1,4,1,Calculated engine load value
//! 1,C,2,Engine RPM
//! ```

use std::collections::HashSet;
use std::fs::File;
use std::path::Path;

use serde::Deserialize;

use crate::error::CatalogError;

/// A single parameter the recorder can sample
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParameterDescriptor {
    /// Request code, mode followed by PID (e.g. `010C`)
    pub code: String,
    /// Human-readable name used as the column header
    pub name: String,
}

impl ParameterDescriptor {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
        }
    }
}

const REQUIRED_COLUMNS: [&str; 3] = ["Mode_hex", "PID_hex", "Description"];

#[derive(Debug, Deserialize)]
struct ReferenceRow {
    #[serde(rename = "Mode_hex")]
    mode: String,
    #[serde(rename = "PID_hex")]
    pid: String,
    #[serde(rename = "Description")]
    description: String,
}

/// Load every parameter from the reference table, in table order
///
/// Any malformed row fails the whole load.
pub fn load_all<P: AsRef<Path>>(path: P) -> Result<Vec<ParameterDescriptor>, CatalogError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| CatalogError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let descriptors = parse_table(file, path)?;
    log::info!(
        "Loaded {} parameters from {}",
        descriptors.len(),
        path.display()
    );
    Ok(descriptors)
}

fn parse_table<R: std::io::Read>(
    reader: R,
    path: &Path,
) -> Result<Vec<ParameterDescriptor>, CatalogError> {
    let malformed = |line: u64, reason: String| CatalogError::MalformedTable {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut descriptors = Vec::new();
    let mut seen = HashSet::new();

    let headers = rdr
        .headers()
        .map_err(|e| malformed(1, e.to_string()))?
        .clone();
    for column in REQUIRED_COLUMNS {
        if !headers.iter().any(|h| h == column) {
            return Err(malformed(1, format!("missing column {}", column)));
        }
    }
    for record in rdr.records() {
        let record = record.map_err(|e| {
            let line = e.position().map(|p| p.line()).unwrap_or(0);
            malformed(line, e.to_string())
        })?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        let row: ReferenceRow = record
            .deserialize(Some(&headers))
            .map_err(|e| malformed(line, e.to_string()))?;

        let code = format!(
            "{}{}",
            hex_field(&row.mode, "mode").map_err(|r| malformed(line, r))?,
            hex_field(&row.pid, "PID").map_err(|r| malformed(line, r))?
        );
        if row.description.is_empty() {
            return Err(malformed(line, "empty description".to_string()));
        }
        if !seen.insert(code.clone()) {
            return Err(malformed(line, format!("duplicate parameter code {}", code)));
        }
        descriptors.push(ParameterDescriptor::new(code, row.description));
    }

    Ok(descriptors)
}

/// Normalise a one- or two-digit hex field to two uppercase digits
fn hex_field(raw: &str, what: &str) -> Result<String, String> {
    let valid = !raw.is_empty() && raw.len() <= 2 && raw.chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return Err(format!("invalid {} {:?}", what, raw));
    }
    Ok(format!("{:0>2}", raw.to_ascii_uppercase()))
}

/// Request codes, in catalog order
pub fn codes_of(descriptors: &[ParameterDescriptor]) -> Vec<String> {
    descriptors.iter().map(|d| d.code.clone()).collect()
}

/// Column names, in catalog order
pub fn names_of(descriptors: &[ParameterDescriptor]) -> Vec<String> {
    descriptors.iter().map(|d| d.name.clone()).collect()
}

/// Pick a subset of the catalog by code
///
/// The result follows the order of `codes`. An empty `codes` selects the full
/// catalog. Each code may appear once.
pub fn select(
    catalog: &[ParameterDescriptor],
    codes: &[String],
) -> Result<Vec<ParameterDescriptor>, CatalogError> {
    if codes.is_empty() {
        return Ok(catalog.to_vec());
    }
    let mut seen = HashSet::new();
    codes
        .iter()
        .map(|code| {
            let wanted = code.trim().to_ascii_uppercase();
            let descriptor = catalog
                .iter()
                .find(|d| d.code == wanted)
                .cloned()
                .ok_or_else(|| CatalogError::UnknownCode(code.clone()))?;
            if !seen.insert(wanted) {
                return Err(CatalogError::DuplicateCode(code.clone()));
            }
            Ok(descriptor)
        })
        .collect()
}
