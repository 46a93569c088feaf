use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::Parser;
use strata_api::cli::Args;
use strata_api::{AppServices, app};
use strata_auth::InMemorySessionStore;
use strata_infra::ServerConfig;
use strata_infra::store::{Database, FileSnapshotStore};
use strata_loader::{AddonCatalog, LoadOptions, LoadReport, ModuleLoader};
use tracing::{error, info, warn};

const SESSION_PURGE_EVERY: Duration = Duration::from_secs(60);
const MAX_SESSION_TTL_MINUTES: i64 = 60 * 24 * 366 * 10;

fn open_database(config: &ServerConfig) -> Result<Database> {
    match &config.data_dir {
        Some(dir) => {
            let snapshots = FileSnapshotStore::new(dir)
                .with_context(|| format!("cannot use data directory {}", dir.display()))?;
            Ok(Database::open(config.db_name.clone(), Arc::new(snapshots))?)
        }
        None => {
            warn!(db = %config.db_name, "no data directory configured, the database lives in memory");
            Ok(Database::in_memory(config.db_name.clone()))
        }
    }
}

fn open_catalog(config: &ServerConfig) -> Result<AddonCatalog> {
    let mut catalog = AddonCatalog::with_base()?;
    for dir in &config.addons_path {
        let found = catalog.scan(dir)?;
        info!(path = %dir.display(), found, "addons path scanned");
    }
    Ok(catalog)
}

fn log_report(action: &str, report: &LoadReport) {
    for failure in &report.failed {
        error!(action, module = %failure.module, error = %failure.error, "module failed to load");
    }
    if !report.skipped.is_empty() {
        warn!(action, skipped = ?report.skipped, "modules skipped after a dependency failed");
    }
}

/// Open the database and bring its modules in line with the flags.
///
/// Returns the loader and whether every requested module loaded.
fn prepare(config: &ServerConfig, args: &Args) -> Result<(ModuleLoader, bool)> {
    let db = open_database(config)?;
    let options = LoadOptions {
        without_demo: config.without_demo,
    };
    let mut loader = ModuleLoader::open(db, open_catalog(config)?, options)?;
    let mut clean = true;

    if !loader.is_installed(strata_base::MODULE) {
        let report = loader.install(&[strata_base::MODULE])?;
        if !report.is_success() {
            log_report("init", &report);
            bail!("the base module could not be installed");
        }
        let env = loader.env();
        let (_, admin) = env.ref_id("base.user_admin")?;
        strata_base::set_password(&env, admin, &config.admin_password)?;
        env.commit()?;
        info!(db = %config.db_name, "database initialized");
    }

    let init = args.init_modules();
    if !init.is_empty() {
        let report = loader.install(&init)?;
        log_report("init", &report);
        clean &= report.is_success();
    }
    let update = args.update_modules();
    if !update.is_empty() {
        let report = loader.upgrade(&update)?;
        log_report("update", &report);
        clean &= report.is_success();
    }
    if let Some(lang) = &config.load_language {
        let applied = loader.load_language(lang)?;
        info!(lang = %lang, applied, "language loaded");
    }
    Ok((loader, clean))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;
    strata_observability::init(config.log_format.parse()?, &config.log_level);

    let (loader, clean) = {
        let (config, args) = (config.clone(), args.clone());
        tokio::task::spawn_blocking(move || prepare(&config, &args)).await??
    };
    info!(modules = ?loader.installed(), "modules loaded");

    if args.stop_after_init {
        if !clean {
            bail!("some modules failed to load");
        }
        return Ok(());
    }

    let ttl_minutes = i64::try_from(config.session_ttl_minutes)
        .unwrap_or(MAX_SESSION_TTL_MINUTES)
        .min(MAX_SESSION_TTL_MINUTES);
    let sessions = Arc::new(InMemorySessionStore::new(chrono::Duration::minutes(ttl_minutes)));
    let services = AppServices::new(loader, sessions, Duration::from_secs(config.call_timeout_secs));
    let reaper = app::spawn_session_reaper(services.clone(), SESSION_PURGE_EVERY);

    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind))?;
    info!(addr = %listener.local_addr()?, db = %config.db_name, "listening");

    axum::serve(listener, app::build_app(services))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;
    reaper.abort();
    Ok(())
}
