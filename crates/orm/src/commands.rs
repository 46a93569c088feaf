//! Link commands written to one2many and many2many fields.

use serde_json::{Map as JsonMap, Value as JsonValue, json};
use strata_core::{OrmError, OrmResult, RecordId};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `[0, 0, values]`: create a target and link it.
    Create(JsonMap<String, JsonValue>),
    /// `[1, id, values]`: write on a linked target.
    Update(RecordId, JsonMap<String, JsonValue>),
    /// `[2, id]`: delete the target.
    Delete(RecordId),
    /// `[3, id]`: remove the link, keep the target.
    Unlink(RecordId),
    /// `[4, id]`: link an existing target.
    Link(RecordId),
    /// `[5]`: remove every link.
    Clear,
    /// `[6, 0, ids]`: replace the links.
    Set(Vec<RecordId>),
}

impl Command {
    pub fn code(&self) -> u8 {
        match self {
            Command::Create(_) => 0,
            Command::Update(..) => 1,
            Command::Delete(_) => 2,
            Command::Unlink(_) => 3,
            Command::Link(_) => 4,
            Command::Clear => 5,
            Command::Set(_) => 6,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Command::Create(values) => json!([0, 0, values]),
            Command::Update(id, values) => json!([1, id, values]),
            Command::Delete(id) => json!([2, id]),
            Command::Unlink(id) => json!([3, id]),
            Command::Link(id) => json!([4, id]),
            Command::Clear => json!([5]),
            Command::Set(ids) => json!([6, 0, ids]),
        }
    }

    /// Parse the value written to an x2many field.
    ///
    /// Accepts a list of commands, or a plain list of ids meaning `Set`.
    /// `false`/`null` clears the field.
    pub fn parse_list(value: &JsonValue) -> OrmResult<Vec<Command>> {
        let items = match value {
            JsonValue::Null | JsonValue::Bool(false) => return Ok(vec![Command::Clear]),
            JsonValue::Array(items) => items,
            other => {
                return Err(OrmError::validation(format!(
                    "x2many values must be a list of commands, got {other}"
                )));
            }
        };
        if items.iter().all(|v| v.is_i64() || v.is_u64()) {
            let ids = items.iter().filter_map(JsonValue::as_i64).collect();
            return Ok(vec![Command::Set(ids)]);
        }
        items.iter().map(Command::parse).collect()
    }

    pub fn parse(value: &JsonValue) -> OrmResult<Command> {
        let invalid = || OrmError::validation(format!("invalid x2many command {value}"));
        let items = value.as_array().ok_or_else(invalid)?;
        let code = items.first().and_then(JsonValue::as_i64).ok_or_else(invalid)?;
        let id = || items.get(1).and_then(JsonValue::as_i64).ok_or_else(invalid);
        let values = || match items.get(2) {
            Some(JsonValue::Object(map)) => Ok(map.clone()),
            None | Some(JsonValue::Null) | Some(JsonValue::Bool(false)) => Ok(JsonMap::new()),
            _ => Err(invalid()),
        };
        Ok(match code {
            0 => Command::Create(values()?),
            1 => Command::Update(id()?, values()?),
            2 => Command::Delete(id()?),
            3 => Command::Unlink(id()?),
            4 => Command::Link(id()?),
            5 => Command::Clear,
            6 => {
                let ids = match items.get(2) {
                    Some(JsonValue::Array(ids)) => ids
                        .iter()
                        .map(|v| v.as_i64().ok_or_else(invalid))
                        .collect::<OrmResult<Vec<_>>>()?,
                    None | Some(JsonValue::Null) | Some(JsonValue::Bool(false)) => Vec::new(),
                    _ => return Err(invalid()),
                };
                Command::Set(ids)
            }
            _ => return Err(invalid()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_command() {
        let cmds = Command::parse_list(&json!([
            [0, 0, {"name": "x"}],
            [1, 7, {"name": "y"}],
            [2, 7],
            [3, 8],
            [4, 9],
            [5],
            [6, 0, [1, 2]]
        ]))
        .unwrap();
        let codes: Vec<u8> = cmds.iter().map(Command::code).collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(cmds[6], Command::Set(vec![1, 2]));
        assert_eq!(Command::parse(&cmds[1].to_json()).unwrap(), cmds[1]);
    }

    #[test]
    fn plain_id_lists_replace() {
        assert_eq!(
            Command::parse_list(&json!([3, 4])).unwrap(),
            vec![Command::Set(vec![3, 4])]
        );
        assert_eq!(Command::parse_list(&json!(false)).unwrap(), vec![Command::Clear]);
    }

    #[test]
    fn malformed_commands_are_rejected() {
        assert!(Command::parse(&json!([9, 1])).is_err());
        assert!(Command::parse(&json!([4])).is_err());
        assert!(Command::parse(&json!([1, 2, "x"])).is_err());
        assert!(Command::parse_list(&json!("x")).is_err());
    }
}
