//! External identifiers (`ir.model.data`) and model reflection (`ir.model`).

use serde_json::json;
use strata_core::{OrmResult, RecordId, XmlId};
use strata_orm::{Domain, Env, Operator, RecordSet};
use tracing::{debug, info};

use crate::models::{MODEL, MODEL_DATA, MODULE};

/// One `ir.model.data` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlIdEntry {
    /// Id of the `ir.model.data` row itself.
    pub id: RecordId,
    pub xml_id: XmlId,
    pub model: String,
    pub res_id: RecordId,
    pub noupdate: bool,
}

fn table(env: &Env) -> OrmResult<RecordSet> {
    env.sudo().with_context_value("active_test", false).model(MODEL_DATA)
}

fn entry(row: &RecordSet) -> OrmResult<XmlIdEntry> {
    Ok(XmlIdEntry {
        id: row.id()?,
        xml_id: XmlId::new(
            row.get_text("module")?.unwrap_or_default(),
            row.get_text("name")?.unwrap_or_default(),
        ),
        model: row.get_text("model")?.unwrap_or_default(),
        res_id: row.get("res_id")?.as_int().unwrap_or_default(),
        noupdate: row.get("noupdate")?.is_truthy(),
    })
}

fn by_xml_id(xml_id: &XmlId) -> Domain {
    Domain::and([
        Domain::leaf("module", Operator::Eq, xml_id.module.as_str()),
        Domain::leaf("name", Operator::Eq, xml_id.name.as_str()),
    ])
}

/// The entry of `xml_id`, if any.
pub fn lookup(env: &Env, xml_id: &XmlId) -> OrmResult<Option<XmlIdEntry>> {
    let rows = table(env)?.search(&by_xml_id(xml_id))?;
    rows.iter().next().map(|row| entry(&row)).transpose()
}

/// Point `xml_id` at `model(res_id)`, creating or updating its entry.
pub fn record(env: &Env, xml_id: &XmlId, model: &str, res_id: RecordId, noupdate: bool) -> OrmResult<()> {
    let rows = table(env)?.search(&by_xml_id(xml_id))?;
    let vals = json!({
        "module": xml_id.module,
        "name": xml_id.name,
        "model": model,
        "res_id": res_id,
        "noupdate": noupdate,
    });
    if rows.is_empty() {
        table(env)?.create_one(vals)?;
    } else {
        rows.write_json(vals)?;
    }
    debug!(%xml_id, model, res_id, "external id recorded");
    Ok(())
}

/// Every entry owned by `module`, in id order.
pub fn module_entries(env: &Env, module: &str) -> OrmResult<Vec<XmlIdEntry>> {
    let rows = table(env)?.search_with(
        &Domain::leaf("module", Operator::Eq, module),
        &strata_orm::SearchParams::order("id"),
    )?;
    rows.iter().map(|row| entry(&row)).collect()
}

/// External ids pointing at `model(res_id)`.
pub fn xml_ids_of(env: &Env, model: &str, res_id: RecordId) -> OrmResult<Vec<XmlId>> {
    let rows = table(env)?.search(&Domain::and([
        Domain::leaf("model", Operator::Eq, model),
        Domain::leaf("res_id", Operator::Eq, res_id),
    ]))?;
    rows.iter()
        .map(|row| entry(&row).map(|e| e.xml_id))
        .collect()
}

/// Delete the entries with the given row ids, leaving their records alone.
pub fn forget(env: &Env, entry_ids: &[RecordId]) -> OrmResult<()> {
    table(env)?.browse(entry_ids.iter().copied()).unlink()
}

/// External id of the `ir.model` row describing `model`.
pub fn model_xml_id(model: &str) -> XmlId {
    XmlId::new(MODULE, format!("model_{}", model.replace('.', "_")))
}

/// Bring `ir.model` in line with the registry: one row per model, with an
/// external id `base.model_<name>`. Rows of models that left the registry
/// are deleted, along with the access rights and rules pointing at them.
pub fn reflect_models(env: &Env) -> OrmResult<usize> {
    let sudo = env.sudo().with_context_value("active_test", false);
    let ir_model = sudo.model(MODEL)?;
    let registry = env.registry().clone();
    let mut touched = 0;
    for model in registry.models() {
        let vals = json!({
            "model": model.name,
            "name": model.description,
            "modules": model.modules.join(", "),
            "field_count": model.fields.len(),
            "abstract": model.is_abstract,
        });
        let existing = ir_model.search(&Domain::leaf("model", Operator::Eq, model.name.as_str()))?;
        let row = if existing.is_empty() {
            ir_model.create_one(vals)?
        } else {
            existing.write_json(vals)?;
            existing
        };
        record(env, &model_xml_id(&model.name), MODEL, row.id()?, false)?;
        touched += 1;
    }

    let gone = ir_model.search(&Domain::leaf(
        "model",
        Operator::NotIn,
        registry.models().map(|m| m.name.clone()).collect::<Vec<_>>(),
    ))?;
    if !gone.is_empty() {
        info!(count = gone.len(), "removing models no longer in the registry");
        gone.unlink()?;
    }
    Ok(touched)
}
