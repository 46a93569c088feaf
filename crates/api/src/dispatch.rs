//! Call dispatch: one remote call, one environment, one transaction.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use strata_auth::AuthError;
use strata_core::{Context, OrmError, OrmResult, RecordId};
use strata_loader::ModuleLoader;
use strata_orm::{Env, RecordSet, recordset::takes_ids};
use tracing::{debug, instrument};

use crate::error::RpcError;

/// `{id?, db, session? | (login, password), model, method, args, kwargs}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Option<JsonValue>,
    pub db: String,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub model: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<JsonValue>,
    #[serde(default)]
    pub kwargs: JsonMap<String, JsonValue>,
}

/// `{id?, result}` or `{id?, error}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: Option<JsonValue>, result: JsonValue) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<JsonValue>, error: RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Check `login`/`password` against the users of the loader's database.
pub fn authenticate(loader: &ModuleLoader, login: &str, password: &str) -> Result<RecordId, RpcError> {
    let env = loader.env();
    let uid = strata_base::authenticate(&env, login, password);
    env.rollback();
    uid?.ok_or_else(|| AuthError::InvalidCredentials.into())
}

/// Run `request` as `uid`, committing on success and rolling back on error.
///
/// `kwargs.context` becomes the environment context. For record methods the
/// first positional argument is the id list.
#[instrument(
    skip(loader, request, deadline),
    fields(db = %request.db, model = %request.model, method = %request.method)
)]
pub fn execute(
    loader: &ModuleLoader,
    uid: RecordId,
    request: &RpcRequest,
    deadline: Option<Instant>,
) -> OrmResult<JsonValue> {
    let db = loader.database();
    let cursor = match deadline {
        Some(deadline) => db.cursor_with_deadline(deadline),
        None => db.cursor(),
    };
    let mut kwargs = request.kwargs.clone();
    let context = match kwargs.remove("context") {
        Some(value) => Context::from_json(&value)?,
        None => Context::new(),
    };
    let env = Env::new(loader.registry(), cursor, uid, context);
    match invoke(&env, &request.model, &request.method, &request.args, &kwargs) {
        Ok(result) => {
            env.commit()?;
            debug!("call committed");
            Ok(result)
        }
        Err(err) => {
            env.rollback();
            debug!(error = %err, "call rolled back");
            Err(err)
        }
    }
}

fn invoke(
    env: &Env,
    model: &str,
    method: &str,
    args: &[JsonValue],
    kwargs: &JsonMap<String, JsonValue>,
) -> OrmResult<JsonValue> {
    let records = env.model(model)?;
    if !records.is_public_method(method) {
        return Err(OrmError::access(format!(
            "method '{method}' of {model} is private and cannot be called remotely"
        )));
    }
    if !takes_ids(records.model(), method) {
        return records.call(method, args, kwargs);
    }
    let Some((ids, rest)) = args.split_first() else {
        return Err(OrmError::validation(format!(
            "{model}.{method} expects the record ids as first argument"
        )));
    };
    records
        .browse(RecordSet::ids_from_json(ids)?)
        .call(method, rest, kwargs)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use strata_core::{ErrorKind, SUPERUSER_ID};
    use strata_infra::Database;
    use strata_loader::{AddonCatalog, LoadOptions};

    use super::*;

    fn loader() -> ModuleLoader {
        let catalog = AddonCatalog::with_base().unwrap();
        let mut loader =
            ModuleLoader::open(Database::in_memory("dispatch"), catalog, LoadOptions::default()).unwrap();
        loader.install(&["base"]).unwrap();
        loader
    }

    fn request(model: &str, method: &str, args: JsonValue, kwargs: JsonValue) -> RpcRequest {
        serde_json::from_value(json!({
            "db": "dispatch",
            "model": model,
            "method": method,
            "args": args,
            "kwargs": kwargs,
        }))
        .unwrap()
    }

    #[test]
    fn admin_logs_in_and_reads_users() {
        let loader = loader();
        let uid = authenticate(&loader, "admin", "admin").unwrap();
        let found = execute(
            &loader,
            uid,
            &request("res.users", "search_read", json!([[["login", "=", "admin"]]]), json!({"fields": ["login"]})),
            None,
        )
        .unwrap();
        assert_eq!(found[0]["id"], json!(uid));
        assert_eq!(found[0]["login"], "admin");
    }

    #[test]
    fn wrong_passwords_and_the_superuser_are_refused() {
        let loader = loader();
        let err = authenticate(&loader, "admin", "nope").unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthError);
        assert!(authenticate(&loader, "__system__", "").is_err());
    }

    #[test]
    fn private_and_unknown_methods_are_unreachable() {
        let loader = loader();
        let private = execute(&loader, SUPERUSER_ID, &request("res.users", "_check", json!([]), json!({})), None);
        assert!(matches!(private, Err(OrmError::Access(_))));
        let missing = execute(&loader, SUPERUSER_ID, &request("no.such.model", "search", json!([]), json!({})), None);
        assert_eq!(missing.unwrap_err().kind(), ErrorKind::MissingError);
    }

    #[test]
    fn record_methods_take_ids_first() {
        let loader = loader();
        let read = execute(&loader, SUPERUSER_ID, &request("res.groups", "read", json!([]), json!({})), None);
        assert!(matches!(read, Err(OrmError::Validation(_))));

        let created = execute(
            &loader,
            SUPERUSER_ID,
            &request("res.groups", "create", json!([{"name": "Auditors"}]), json!({})),
            None,
        )
        .unwrap();
        let id = created.as_i64().or_else(|| created[0].as_i64()).unwrap();
        let names = execute(
            &loader,
            SUPERUSER_ID,
            &request("res.groups", "read", json!([[id], ["name"]]), json!({})),
            None,
        )
        .unwrap();
        assert_eq!(names[0]["name"], "Auditors");
    }

    #[test]
    fn failed_calls_leave_no_trace() {
        let loader = loader();
        let err = execute(
            &loader,
            SUPERUSER_ID,
            &request(
                "res.groups",
                "create",
                json!([[{"name": "Half"}, {"name": "Done", "bogus": 1}]]),
                json!({}),
            ),
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingError);

        let count = execute(
            &loader,
            SUPERUSER_ID,
            &request("res.groups", "search_count", json!([[["name", "=", "Half"]]]), json!({})),
            None,
        )
        .unwrap();
        assert_eq!(count, json!(0));
    }

    #[test]
    fn expired_deadlines_abort_the_call() {
        let loader = loader();
        let past = Instant::now().checked_sub(Duration::from_secs(1));
        let err = execute(
            &loader,
            SUPERUSER_ID,
            &request("res.groups", "search", json!([]), json!({})),
            past.or(Some(Instant::now())),
        )
        .unwrap_err();
        assert!(matches!(err, OrmError::Timeout(_)), "{err}");
    }

    #[test]
    fn context_travels_in_kwargs() {
        let loader = loader();
        let err = execute(
            &loader,
            SUPERUSER_ID,
            &request("res.groups", "search", json!([]), json!({"context": 3})),
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);

        let archived = execute(
            &loader,
            SUPERUSER_ID,
            &request(
                "res.users",
                "search",
                json!([[["login", "=", "__system__"]]]),
                json!({"context": {"active_test": false}}),
            ),
            None,
        )
        .unwrap();
        assert_eq!(archived, json!([SUPERUSER_ID]));
    }
}
