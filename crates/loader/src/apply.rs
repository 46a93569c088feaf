//! Applying parsed data records through the regular ORM write path.

use std::collections::BTreeSet;

use serde_json::{Map as JsonMap, Value as JsonValue, json};
use strata_base::model_data;
use strata_core::eval::{self, EvalScope};
use strata_core::{OrmError, OrmResult, RecordId, XmlId};
use strata_orm::{Env, Field, FieldType, Model};
use tracing::{debug, warn};

use crate::data::{DataRecord, DataValue, Translation, parse_file};
use crate::error::LoadError;

/// Counters of one applier run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyStats {
    pub created: usize,
    pub updated: usize,
    /// Existing `noupdate` records left alone.
    pub skipped: usize,
    pub translated: usize,
}

/// Plays the data files of one module into an environment.
///
/// Records run as superuser with `install_mode` set. External ids are
/// recorded under their own module, so a module may update records of the
/// modules it depends on.
pub struct DataApplier {
    env: Env,
    module: String,
    loaded: BTreeSet<XmlId>,
    stats: ApplyStats,
}

/// Names visible to `eval` attributes.
struct DataScope<'a> {
    env: &'a Env,
    module: &'a str,
}

impl EvalScope for DataScope<'_> {
    fn lookup(&self, name: &str) -> Option<JsonValue> {
        match name {
            "uid" => Some(json!(self.env.uid())),
            _ => None,
        }
    }

    fn call(&self, name: &str, args: &[JsonValue]) -> OrmResult<JsonValue> {
        match (name, args) {
            ("ref", [JsonValue::String(raw)]) => {
                let xml_id = XmlId::qualify(raw, self.module)?;
                Ok(json!(self.env.ref_id(&xml_id.to_string())?.1))
            }
            _ => Err(OrmError::validation(format!("unknown function '{name}' in data file"))),
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

impl DataApplier {
    pub fn new(env: &Env, module: &str) -> Self {
        let env = env
            .sudo()
            .with_context_value("install_mode", true)
            .with_context_value("tracking_disable", true);
        Self {
            env,
            module: module.to_string(),
            loaded: BTreeSet::new(),
            stats: ApplyStats::default(),
        }
    }

    /// External ids written by this applier so far.
    pub fn loaded(&self) -> &BTreeSet<XmlId> {
        &self.loaded
    }

    pub fn stats(&self) -> ApplyStats {
        self.stats
    }

    /// Parse and apply the data file `path`.
    pub fn apply_file(&mut self, path: &str, contents: &str) -> Result<usize, LoadError> {
        let records = parse_file(&self.module, path, contents)?;
        for record in &records {
            self.apply(record)?;
        }
        debug!(module = %self.module, file = path, records = records.len(), "data file applied");
        Ok(records.len())
    }

    /// Create or update the record, returning its id.
    pub fn apply(&mut self, record: &DataRecord) -> Result<RecordId, LoadError> {
        self.apply_record(record).map_err(|err| {
            let label = record
                .xml_id
                .as_ref()
                .map(|x| x.to_string())
                .unwrap_or_else(|| record.model.clone());
            LoadError::data_file(&self.module, &record.origin.file, record.origin.line, format!("{label}: {err}"))
        })
    }

    fn apply_record(&mut self, record: &DataRecord) -> OrmResult<RecordId> {
        let model = self.env.get_model(&record.model)?;
        let Some(xml_id) = &record.xml_id else {
            let vals = self.resolve_values(&model, record)?;
            self.stats.created += 1;
            return self.env.model(&record.model)?.create(vec![vals])?.id();
        };
        self.loaded.insert(xml_id.clone());

        if let Some(entry) = model_data::lookup(&self.env, xml_id)? {
            let target = self.env.browse(&entry.model, [entry.res_id])?.exists()?;
            if !target.is_empty() {
                if entry.model != record.model {
                    return Err(OrmError::validation(format!(
                        "external id already names a record of '{}'",
                        entry.model
                    )));
                }
                if entry.noupdate || record.noupdate {
                    debug!(%xml_id, "noupdate record kept as is");
                    self.stats.skipped += 1;
                    return Ok(entry.res_id);
                }
                let vals = self.resolve_values(&model, record)?;
                target.write(&vals)?;
                model_data::record(&self.env, xml_id, &record.model, entry.res_id, record.noupdate)?;
                self.stats.updated += 1;
                return Ok(entry.res_id);
            }
            warn!(%xml_id, "external id pointed at a deleted record, recreating it");
            model_data::forget(&self.env, &[entry.id])?;
        }

        let vals = self.resolve_values(&model, record)?;
        let id = self.env.model(&record.model)?.create(vec![vals])?.id()?;
        model_data::record(&self.env, xml_id, &record.model, id, record.noupdate)?;
        self.stats.created += 1;
        Ok(id)
    }

    fn resolve_values(&self, model: &Model, record: &DataRecord) -> OrmResult<JsonMap<String, JsonValue>> {
        let mut vals = JsonMap::new();
        for (name, value) in &record.values {
            let field = model
                .fields
                .get(name)
                .ok_or_else(|| OrmError::unknown_field(&model.name, name))?;
            let resolved = match value {
                DataValue::Text(text) => text_value(field, text)?,
                DataValue::Ref(raw) => {
                    let id = self.ref_id(raw)?;
                    match &field.ty {
                        FieldType::Many2one { .. } | FieldType::Integer => json!(id),
                        FieldType::One2many { .. } | FieldType::Many2many { .. } => json!([[6, 0, [id]]]),
                        other => {
                            return Err(OrmError::validation(format!(
                                "field '{name}' of type {} cannot take a ref",
                                other.name()
                            )));
                        }
                    }
                }
                DataValue::RefList(raws) => {
                    let ids = raws.iter().map(|r| self.ref_id(r)).collect::<OrmResult<Vec<_>>>()?;
                    match &field.ty {
                        FieldType::One2many { .. } | FieldType::Many2many { .. } => json!([[6, 0, ids]]),
                        other => {
                            return Err(OrmError::validation(format!(
                                "field '{name}' of type {} cannot take several refs",
                                other.name()
                            )));
                        }
                    }
                }
                DataValue::Eval(source) => eval::evaluate(
                    source,
                    &DataScope {
                        env: &self.env,
                        module: &self.module,
                    },
                )?,
            };
            vals.insert(name.clone(), resolved);
        }
        Ok(vals)
    }

    fn ref_id(&self, raw: &str) -> OrmResult<RecordId> {
        let xml_id = XmlId::qualify(raw, &self.module)?;
        Ok(self.env.ref_id(&xml_id.to_string())?.1)
    }

    /// Write translated values in `lang`. Rows naming unknown records or
    /// untranslatable fields are skipped with a warning.
    pub fn apply_translations(&mut self, lang: &str, rows: &[Translation]) -> Result<usize, LoadError> {
        let env = self.env.with_lang(lang);
        let mut applied = 0;
        for row in rows {
            let Some(entry) = model_data::lookup(&env, &row.xml_id)? else {
                warn!(xml_id = %row.xml_id, lang, "translation for an unknown record");
                continue;
            };
            let model = env.get_model(&entry.model)?;
            match model.fields.get(&row.field) {
                Some(field) if field.is_translated() => {}
                _ => {
                    warn!(xml_id = %row.xml_id, field = %row.field, "field is not translatable");
                    continue;
                }
            }
            let target = env.browse(&entry.model, [entry.res_id])?.exists()?;
            if target.is_empty() {
                continue;
            }
            let mut vals = JsonMap::new();
            vals.insert(row.field.clone(), json!(row.value));
            target.write(&vals)?;
            applied += 1;
        }
        self.stats.translated += applied;
        debug!(module = %self.module, lang, applied, "translations applied");
        Ok(applied)
    }
}

fn text_value(field: &Field, text: &str) -> OrmResult<JsonValue> {
    if text.is_empty() {
        return Ok(JsonValue::Bool(false));
    }
    let invalid = || {
        OrmError::validation(format!(
            "'{text}' is not a valid {} for field '{}'",
            field.ty.name(),
            field.name
        ))
    };
    Ok(match &field.ty {
        FieldType::Boolean => json!(parse_flag(text).ok_or_else(invalid)?),
        FieldType::Integer => json!(text.trim().parse::<i64>().map_err(|_| invalid())?),
        FieldType::Float { .. } | FieldType::Monetary => json!(text.trim().parse::<f64>().map_err(|_| invalid())?),
        FieldType::Many2one { .. } | FieldType::One2many { .. } | FieldType::Many2many { .. } => {
            return Err(OrmError::validation(format!(
                "relational field '{}' takes a ref or an eval, not text",
                field.name
            )));
        }
        _ => json!(text),
    })
}
