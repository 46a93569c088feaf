//! Login checks against `res.users`.

use serde_json::json;
use strata_auth::verify_password;
use strata_core::{OrmResult, RecordId};
use strata_orm::{Domain, Env, Operator};
use tracing::{info, warn};

use crate::models::USERS;

/// Id of the active user `login` whose password matches, `None` otherwise.
///
/// Inactive users (the superuser among them) never authenticate.
pub fn authenticate(env: &Env, login: &str, password: &str) -> OrmResult<Option<RecordId>> {
    let users = env
        .sudo()
        .model(USERS)?
        .search(&Domain::leaf("login", Operator::Eq, login))?;
    let Some(user) = users.iter().next() else {
        warn!(login, "login failed: unknown user");
        return Ok(None);
    };
    let stored = user.get_text("password_hash")?.unwrap_or_default();
    if !verify_password(password, &stored) {
        warn!(login, "login failed: wrong password");
        return Ok(None);
    }
    let uid = user.id()?;
    info!(login, uid, "login successful");
    Ok(Some(uid))
}

/// Replace the password of `uid`.
pub fn set_password(env: &Env, uid: RecordId, password: &str) -> OrmResult<()> {
    env.sudo()
        .browse(USERS, [uid])?
        .write_json(json!({ "password": password }))
}
