//! Data files parsed into records ready to apply.
//!
//! Parsing never touches the database: files become a list of
//! [`DataRecord`]s first, and the applier resolves references and field
//! types afterwards.

mod csv;
mod i18n;
mod xml;

use strata_core::XmlId;

use crate::error::LoadError;

pub use i18n::{Translation, parse_translations};

/// Value of one field as written in a data file.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    /// Literal text, converted according to the field type.
    Text(String),
    /// External id of another record.
    Ref(String),
    /// Several external ids (many2many CSV columns).
    RefList(Vec<String>),
    /// Expression for the safe evaluator.
    Eval(String),
}

/// Where a record comes from, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub file: String,
    pub line: Option<u64>,
}

/// One record of a data file.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRecord {
    pub xml_id: Option<XmlId>,
    pub model: String,
    pub values: Vec<(String, DataValue)>,
    /// Created once, never overwritten by later loads.
    pub noupdate: bool,
    pub origin: Origin,
}

/// Parse the data file `path` of `module`; the extension picks the format.
pub fn parse_file(module: &str, path: &str, contents: &str) -> Result<Vec<DataRecord>, LoadError> {
    match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("xml") => xml::parse(module, path, contents),
        Some("csv") => csv::parse(module, path, contents),
        _ => Err(LoadError::data_file(module, path, None, "unsupported data file type")),
    }
}

/// Line number of byte `offset` in `contents`, counting from 1.
pub(crate) fn line_of(contents: &str, offset: usize) -> u64 {
    let end = offset.min(contents.len());
    contents.as_bytes()[..end].iter().filter(|b| **b == b'\n').count() as u64 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_selects_the_parser() {
        assert!(parse_file("m", "data/x.yaml", "").is_err());
        assert!(parse_file("m", "data/item.csv", "id,name\n").unwrap().is_empty());
    }

    #[test]
    fn lines_count_from_one() {
        assert_eq!(line_of("a\nb\nc", 0), 1);
        assert_eq!(line_of("a\nb\nc", 2), 2);
        assert_eq!(line_of("a\nb\nc", 99), 3);
    }
}
