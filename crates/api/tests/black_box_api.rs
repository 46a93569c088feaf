use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Value, json};
use strata_api::{AppServices, build_app};
use strata_auth::InMemorySessionStore;
use strata_infra::Database;
use strata_loader::{AddonCatalog, LoadOptions, ModuleLoader, StaticAddon};
use strata_orm::{Field, ModelDef};

const DB: &str = "blackbox";

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let loader = tokio::task::spawn_blocking(|| {
            let mut catalog = AddonCatalog::with_base().unwrap();
            catalog.add(notes_addon());
            let mut loader =
                ModuleLoader::open(Database::in_memory(DB), catalog, LoadOptions::default()).unwrap();
            assert!(loader.install(&["base"]).unwrap().is_success());
            loader
        })
        .await
        .unwrap();

        let sessions = Arc::new(InMemorySessionStore::new(chrono::Duration::minutes(5)));
        let app = build_app(AppServices::new(loader, sessions, Duration::from_secs(10)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let res = reqwest::Client::new()
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = res.status();
        (status, res.json().await.unwrap())
    }

    async fn login(&self, login: &str, password: &str) -> String {
        let (status, body) = self
            .post("/rpc/login", json!({"db": DB, "login": login, "password": password}))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["session"].as_str().unwrap().to_string()
    }

    async fn call(&self, session: &str, model: &str, method: &str, args: Value) -> (StatusCode, Value) {
        self.post(
            "/rpc",
            json!({"id": 7, "db": DB, "session": session, "model": model, "method": method, "args": args}),
        )
        .await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Data-only addon with one model, installable over RPC.
fn notes_addon() -> StaticAddon {
    StaticAddon::from_manifest_str("name = \"notes\"\ndata = [\"data/ir.model.access.csv\"]\n")
        .unwrap()
        .with_models(|| {
            vec![
                ModelDef::new("note.note")
                    .description("Note")
                    .field(Field::char("name").required())
                    .field(Field::text("body")),
            ]
        })
        .with_files(&[(
            "data/ir.model.access.csv",
            "id,name,model_id:id,group_id:id,perm_read,perm_write,perm_create,perm_unlink\n\
             access_note_user,note user,base.model_note_note,base.group_user,1,1,1,1\n",
        )])
}

#[tokio::test]
async fn health_and_version_are_public() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(format!("{}/health", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().contains_key("x-request-id"));

    let version: Value = client
        .get(format!("{}/version", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(version["db"], DB);
    assert_eq!(version["modules"], json!(["base"]));
}

#[tokio::test]
async fn wrong_credentials_are_auth_errors() {
    let srv = TestServer::spawn().await;
    let (status, body) = srv
        .post("/rpc/login", json!({"db": DB, "login": "admin", "password": "wrong"}))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "AuthError");

    let (status, body) = srv
        .post("/rpc/login", json!({"db": "elsewhere", "login": "admin", "password": "admin"}))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "AuthError");

    let (_, body) = srv.call("no-such-session", "res.users", "search", json!([])).await;
    assert_eq!(body["id"], 7);
    assert_eq!(body["error"]["kind"], "AuthError");
}

#[tokio::test]
async fn sessions_carry_calls_until_logout() {
    let srv = TestServer::spawn().await;
    let session = srv.login("admin", "admin").await;

    let (status, body) = srv
        .call(&session, "res.users", "search_read", json!([[["login", "=", "admin"]], ["login"]]))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["id"], 7);
    assert_eq!(body["result"][0]["login"], "admin");

    let (_, out) = srv.post("/rpc/logout", json!({"session": session})).await;
    assert_eq!(out["result"], true);
    let (status, body) = srv.call(&session, "res.users", "search", json!([])).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "AuthError");
}

#[tokio::test]
async fn credentials_can_replace_a_session() {
    let srv = TestServer::spawn().await;
    let (status, body) = srv
        .post(
            "/rpc",
            json!({
                "db": DB, "login": "admin", "password": "admin",
                "model": "res.lang", "method": "search_count", "args": [[]],
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"], 1);
    assert!(body.get("id").is_none());
}

#[tokio::test]
async fn errors_come_back_structured() {
    let srv = TestServer::spawn().await;
    let session = srv.login("admin", "admin").await;

    let (status, body) = srv.call(&session, "res.users", "_private", json!([])).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["kind"], "AccessError");

    let (status, body) = srv.call(&session, "no.model", "search", json!([])).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "MissingError");

    let (status, body) = srv.call(&session, "res.groups", "create", json!([{}])).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["kind"], "ValidationError");

    let (status, body) = srv.post("/rpc", json!({"db": DB})).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["kind"], "ValidationError");
}

#[tokio::test]
async fn modules_install_over_rpc_and_serve_their_models() {
    let srv = TestServer::spawn().await;
    let session = srv.login("admin", "admin").await;

    let (_, found) = srv
        .call(&session, "ir.module.module", "search", json!([[["name", "=", "notes"]]]))
        .await;
    let ids = found["result"].clone();
    assert_eq!(ids.as_array().map(Vec::len), Some(1), "{found}");

    let (status, report) = srv
        .call(&session, "ir.module.module", "button_immediate_install", json!([ids]))
        .await;
    assert_eq!(status, StatusCode::OK, "{report}");
    assert_eq!(report["result"]["installed"], json!(["notes"]));

    let (status, created) = srv
        .call(&session, "note.note", "create", json!([{"name": "first", "body": "hello"}]))
        .await;
    assert_eq!(status, StatusCode::OK, "{created}");
    let id = created["result"].as_i64().unwrap();

    let (_, read) = srv.call(&session, "note.note", "read", json!([[id], ["name", "body"]])).await;
    assert_eq!(read["result"][0]["name"], "first");
    assert_eq!(read["result"][0]["body"], "hello");

    let (_, modules) = srv.call(&session, "ir.module.module", "search_read", json!([[["name", "=", "notes"]], ["state"]])).await;
    assert_eq!(modules["result"][0]["state"], "installed");
}
