//! Command line of `strata-server`.

use std::path::PathBuf;

use clap::Parser;
use strata_infra::{ConfigError, ServerConfig};

/// Odoo-style application server: installs modules into a database and
/// serves remote calls on it.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "strata-server")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database name
    #[arg(short, long)]
    pub db: Option<String>,

    /// Modules to install, comma separated
    #[arg(short, long, value_delimiter = ',')]
    pub init: Vec<String>,

    /// Modules to upgrade, comma separated, or `all`
    #[arg(short, long, value_delimiter = ',')]
    pub update: Vec<String>,

    /// Language code to activate (e.g. fr_FR)
    #[arg(long)]
    pub load_language: Option<String>,

    /// Skip demo data of the modules installed
    #[arg(long)]
    pub without_demo: bool,

    /// Directories holding data-only addons, comma separated
    #[arg(long, value_delimiter = ',')]
    pub addons_path: Vec<PathBuf>,

    /// Directory of database snapshots (in-memory only when absent)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Address of the HTTP listener
    #[arg(long)]
    pub http_bind: Option<String>,

    /// Exit once modules are loaded instead of serving
    #[arg(long)]
    pub stop_after_init: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json or pretty)
    #[arg(long)]
    pub log_format: Option<String>,
}

impl Args {
    /// Defaults, then the config file, then `STRATA_*` variables, then flags.
    pub fn load_config(&self) -> Result<ServerConfig, ConfigError> {
        let mut config = ServerConfig::load(self.config.as_deref())?;
        config.apply_env()?;
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Override `config` with the flags given on the command line.
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(db) = &self.db {
            config.db_name = db.clone();
        }
        if self.without_demo {
            config.without_demo = true;
        }
        if let Some(lang) = &self.load_language {
            config.load_language = Some(lang.clone());
        }
        if !self.addons_path.is_empty() {
            config.addons_path = self.addons_path.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        if let Some(bind) = &self.http_bind {
            config.http_bind = bind.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.log_format = format.clone();
        }
    }

    pub fn init_modules(&self) -> Vec<&str> {
        module_list(&self.init)
    }

    pub fn update_modules(&self) -> Vec<&str> {
        module_list(&self.update)
    }
}

fn module_list(raw: &[String]) -> Vec<&str> {
    raw.iter().map(|m| m.trim()).filter(|m| !m.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_lists_split_on_commas() {
        let args = Args::try_parse_from([
            "strata-server",
            "--db",
            "prod",
            "--init=sale, stock",
            "-u",
            "all",
            "--without-demo",
            "--stop-after-init",
        ])
        .unwrap();
        assert_eq!(args.init_modules(), vec!["sale", "stock"]);
        assert_eq!(args.update_modules(), vec!["all"]);
        assert!(args.without_demo);
        assert!(args.stop_after_init);
    }

    #[test]
    fn flags_override_the_config_file() {
        let args = Args::try_parse_from([
            "strata-server",
            "--db=flagged",
            "--http-bind=0.0.0.0:9000",
            "--load-language=fr_FR",
            "--addons-path=/a,/b",
        ])
        .unwrap();
        let mut config = ServerConfig::from_toml_str(
            "db_name = \"from_file\"\nhttp_bind = \"127.0.0.1:1\"\nwithout_demo = true\n",
            std::path::Path::new("strata.toml"),
        )
        .unwrap();
        args.apply(&mut config);
        assert_eq!(config.db_name, "flagged");
        assert_eq!(config.http_bind, "0.0.0.0:9000");
        assert_eq!(config.load_language.as_deref(), Some("fr_FR"));
        assert_eq!(config.addons_path, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert!(config.without_demo, "absent flags keep file values");
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(Args::try_parse_from(["strata-server", "--workers=4"]).is_err());
    }
}
