//! Shared server state: the module loader behind its lock, sessions and the
//! per-call deadline.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Value as JsonValue, json};
use strata_auth::{AuthError, Session, SessionStore};
use strata_base::models::MODULES;
use strata_core::{OrmError, RecordId};
use strata_loader::{LoadReport, ModuleLoader};
use strata_orm::{Env, RecordSet};
use tracing::{info, instrument, warn};

use crate::dispatch::{self, RpcRequest, RpcResponse};
use crate::error::RpcError;

/// Module lifecycle buttons of `ir.module.module`, run under the registry
/// write lock instead of a regular call.
pub const MODULE_ACTIONS: &[&str] = &[
    "button_immediate_install",
    "button_immediate_upgrade",
    "button_immediate_uninstall",
];

/// Extra time granted to a blocked worker past its cursor deadline.
const DEADLINE_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct AppServices {
    loader: Arc<RwLock<ModuleLoader>>,
    sessions: Arc<dyn SessionStore>,
    call_timeout: Duration,
    db_name: String,
}

impl AppServices {
    pub fn new(loader: ModuleLoader, sessions: Arc<dyn SessionStore>, call_timeout: Duration) -> Self {
        let db_name = loader.database().name().to_string();
        Self {
            loader: Arc::new(RwLock::new(loader)),
            sessions,
            call_timeout,
            db_name,
        }
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Run `f` on a blocking worker under the registry read lock.
    async fn read<R: Send + 'static>(
        &self,
        f: impl FnOnce(&ModuleLoader) -> R + Send + 'static,
    ) -> Result<R, RpcError> {
        let loader = self.loader.clone();
        tokio::task::spawn_blocking(move || {
            let guard = loader.read().unwrap_or_else(PoisonError::into_inner);
            f(&guard)
        })
        .await
        .map_err(|err| RpcError::internal(&err, false))
    }

    /// Run `f` on a blocking worker under the registry write lock. New calls
    /// wait until it is done.
    pub async fn write<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut ModuleLoader) -> R + Send + 'static,
    ) -> Result<R, RpcError> {
        let loader = self.loader.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = loader.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|err| RpcError::internal(&err, false))
    }

    pub async fn installed_modules(&self) -> Result<Vec<String>, RpcError> {
        self.read(|loader| loader.installed().to_vec()).await
    }

    fn check_db(&self, db: &str) -> Result<(), RpcError> {
        if db != self.db_name {
            return Err(AuthError::UnknownDatabase(db.to_string()).into());
        }
        Ok(())
    }

    #[instrument(skip(self, password))]
    pub async fn login(&self, db: &str, login: &str, password: &str) -> Result<Session, RpcError> {
        self.check_db(db)?;
        let (l, p) = (login.to_string(), password.to_string());
        let uid = self.read(move |loader| dispatch::authenticate(loader, &l, &p)).await??;
        let session = self.sessions.create(db, uid, login, Utc::now());
        info!(uid, "session opened");
        Ok(session)
    }

    pub fn logout(&self, session: &str) -> bool {
        self.sessions.remove(session)
    }

    /// Drop expired sessions.
    pub fn purge_sessions(&self) -> usize {
        self.sessions.purge_expired(Utc::now())
    }

    async fn caller(&self, request: &RpcRequest) -> Result<RecordId, RpcError> {
        if let Some(id) = &request.session {
            let session = self.sessions.touch(id, Utc::now())?;
            if session.db != request.db {
                return Err(AuthError::DatabaseMismatch(session.db).into());
            }
            return Ok(session.uid);
        }
        match (&request.login, &request.password) {
            (Some(login), Some(password)) => {
                let (l, p) = (login.clone(), password.clone());
                self.read(move |loader| dispatch::authenticate(loader, &l, &p)).await?
            }
            _ => Err(RpcError::new(
                strata_core::ErrorKind::AuthError,
                "a session or a login and password are required",
            )),
        }
    }

    /// Authenticate and run one call; failures become the `error` member.
    pub async fn call(&self, request: RpcRequest) -> RpcResponse {
        let id = request.id.clone();
        match self.try_call(request).await {
            Ok(result) => RpcResponse::ok(id, result),
            Err(err) => RpcResponse::err(id, err),
        }
    }

    async fn try_call(&self, request: RpcRequest) -> Result<JsonValue, RpcError> {
        self.check_db(&request.db)?;
        let uid = self.caller(&request).await?;
        if request.model == MODULES && MODULE_ACTIONS.contains(&request.method.as_str()) {
            return self.module_action(uid, request).await;
        }
        let deadline = Instant::now() + self.call_timeout;
        let work = self.read(move |loader| dispatch::execute(loader, uid, &request, Some(deadline)));
        match tokio::time::timeout(self.call_timeout + DEADLINE_GRACE, work).await {
            Ok(done) => Ok(done??),
            Err(_) => {
                warn!(timeout = ?self.call_timeout, "call still running past its deadline");
                Err(OrmError::Timeout("call deadline exceeded".into()).into())
            }
        }
    }

    /// Install, upgrade or uninstall the modules whose ids are the first
    /// argument. Only members of `base.group_system` may do so.
    #[instrument(skip(self, request), fields(method = %request.method))]
    async fn module_action(&self, uid: RecordId, request: RpcRequest) -> Result<JsonValue, RpcError> {
        let ids = request.args.first().cloned().unwrap_or(JsonValue::Null);
        let names = self
            .read(move |loader| -> Result<Vec<String>, OrmError> {
                let env = Env::new(loader.registry(), loader.database().cursor(), uid, Default::default());
                let policy = env.registry().policy().clone();
                if !env.is_superuser() && !policy.has_group(&env, "base.group_system")? {
                    return Err(OrmError::access("only administrators manage modules"));
                }
                let rows = env.sudo().browse(MODULES, RecordSet::ids_from_json(&ids)?)?.exists()?;
                let names = rows
                    .iter()
                    .map(|row| row.get_text("name").map(Option::unwrap_or_default))
                    .collect::<Result<Vec<_>, _>>()?;
                env.rollback();
                Ok(names)
            })
            .await??;

        let method = request.method.clone();
        let report: LoadReport = self
            .write(move |loader| {
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                match method.as_str() {
                    "button_immediate_install" => loader.install(&names),
                    "button_immediate_upgrade" => loader.upgrade(&names),
                    _ => loader.uninstall(&names),
                }
            })
            .await??;
        info!(?report, "module action done");
        Ok(json!(report))
    }
}
