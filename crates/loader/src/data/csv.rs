//! CSV data files: the file name is the model, one record per row.
//!
//! ```text
//! id,name,model_id:id,group_id:id,perm_read
//! access_doc_user,doc user,model_doc,base.group_user,1
//! ```

use ::csv::{ReaderBuilder, Trim};
use strata_core::XmlId;

use super::{DataRecord, DataValue, Origin};
use crate::error::LoadError;

enum Column {
    Id,
    Value(String),
    Reference(String),
}

fn column(header: &str) -> Column {
    if header == "id" {
        return Column::Id;
    }
    match header.strip_suffix("/id").or_else(|| header.strip_suffix(":id")) {
        Some(field) => Column::Reference(field.to_string()),
        None => Column::Value(header.to_string()),
    }
}

/// Model named by `path`: `data/ir.model.access.csv` holds `ir.model.access` rows.
pub(super) fn model_of(path: &str) -> Option<&str> {
    let file = path.rsplit('/').next()?;
    file.strip_suffix(".csv").filter(|m| !m.is_empty())
}

pub(super) fn parse(module: &str, path: &str, contents: &str) -> Result<Vec<DataRecord>, LoadError> {
    let model = model_of(path)
        .ok_or_else(|| LoadError::data_file(module, path, None, "cannot derive the model from the file name"))?;
    let mut reader = ReaderBuilder::new().trim(Trim::All).from_reader(contents.as_bytes());
    let csv_error = |err: ::csv::Error| {
        let line = err.position().map(|p| p.line());
        LoadError::data_file(module, path, line, err.to_string())
    };
    let columns: Vec<Column> = reader.headers().map_err(csv_error)?.iter().map(column).collect();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(csv_error)?;
        let line = row.position().map(|p| p.line());
        let mut xml_id = None;
        let mut values = Vec::new();
        for (column, cell) in columns.iter().zip(row.iter()) {
            match column {
                Column::Id if !cell.is_empty() => {
                    let id = XmlId::qualify(cell, module)
                        .map_err(|err| LoadError::data_file(module, path, line, err.to_string()))?;
                    xml_id = Some(id);
                }
                Column::Id => {}
                Column::Value(field) => values.push((field.clone(), DataValue::Text(cell.to_string()))),
                Column::Reference(field) => {
                    let refs: Vec<String> = cell
                        .split(',')
                        .map(str::trim)
                        .filter(|r| !r.is_empty())
                        .map(str::to_string)
                        .collect();
                    let value = match refs.len() {
                        0 => DataValue::Text(String::new()),
                        1 if !cell.contains(',') => DataValue::Ref(refs[0].clone()),
                        _ => DataValue::RefList(refs),
                    };
                    values.push((field.clone(), value));
                }
            }
        }
        records.push(DataRecord {
            xml_id,
            model: model.to_string(),
            values,
            noupdate: false,
            origin: Origin {
                file: path.to_string(),
                line,
            },
        });
    }
    Ok(records)
}
