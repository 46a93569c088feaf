//! Translation files (`i18n/<lang>.csv`): `id,field,value` rows.

use ::csv::{ReaderBuilder, Trim};
use strata_core::XmlId;

use crate::error::LoadError;

/// Translated value of one field of the record named by `xml_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub xml_id: XmlId,
    pub field: String,
    pub value: String,
    pub line: Option<u64>,
}

pub fn parse_translations(module: &str, path: &str, contents: &str) -> Result<Vec<Translation>, LoadError> {
    let mut reader = ReaderBuilder::new().trim(Trim::All).from_reader(contents.as_bytes());
    let csv_error = |err: ::csv::Error| {
        let line = err.position().map(|p| p.line());
        LoadError::data_file(module, path, line, err.to_string())
    };
    let headers: Vec<String> = reader
        .headers()
        .map_err(csv_error)?
        .iter()
        .map(str::to_string)
        .collect();
    if headers != ["id", "field", "value"] {
        return Err(LoadError::data_file(
            module,
            path,
            Some(1),
            format!("expected the header id,field,value, found {}", headers.join(",")),
        ));
    }

    let mut out = Vec::new();
    for row in reader.records() {
        let row = row.map_err(csv_error)?;
        let line = row.position().map(|p| p.line());
        let (Some(id), Some(field), Some(value)) = (row.get(0), row.get(1), row.get(2)) else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        let xml_id = XmlId::qualify(id, module)
            .map_err(|err| LoadError::data_file(module, path, line, err.to_string()))?;
        out.push(Translation {
            xml_id,
            field: field.to_string(),
            value: value.to_string(),
            line,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_name_a_record_and_a_field() {
        let rows = parse_translations(
            "m",
            "i18n/fr_FR.csv",
            "id,field,value\ngroup_a,name,Groupe A\nbase.lang_en,name,Anglais\nempty,name,\n",
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].xml_id, XmlId::new("m", "group_a"));
        assert_eq!(rows[0].value, "Groupe A");
        assert_eq!(rows[1].xml_id, XmlId::new("base", "lang_en"));
        assert_eq!(rows[1].line, Some(3));
    }

    #[test]
    fn the_header_is_checked() {
        assert!(parse_translations("m", "i18n/fr.csv", "id,value\nx,y\n").is_err());
    }
}
