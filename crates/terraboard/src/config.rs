//! Configuration loading.
//!
//! Three layers, lowest precedence first: CLI flag defaults, the YAML
//! configuration file, environment variables.

use std::env;
use std::fs;

use providers::ProvidersConfig;
use serde::Deserialize;

use crate::cli::Cli;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub log: LogConfig,
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub sslmode: String,
    pub no_sync: bool,
    /// Minutes between sync sweeps.
    pub sync_interval: u64,
    /// When set, states unseen by any provider for this many minutes
    /// are removed after a sweep. Off by default.
    pub orphan_grace_minutes: Option<u64>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "terraboard".to_string(),
            password: String::new(),
            name: "terraboard".to_string(),
            sslmode: "require".to_string(),
            no_sync: false,
            sync_interval: 1,
            orphan_grace_minutes: None,
        }
    }
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.user, self.password, self.host, self.port, self.name, self.sslmode
        )
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "plain".to_string(),
        }
    }
}

// YAML overlay: every scalar is optional so that omitted keys keep the
// CLI-provided defaults.

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    database: DatabaseOverlay,
    log: LogOverlay,
    #[serde(flatten)]
    providers: ProvidersConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DatabaseOverlay {
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    name: Option<String>,
    sslmode: Option<String>,
    no_sync: Option<bool>,
    sync_interval: Option<u64>,
    orphan_grace_minutes: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LogOverlay {
    level: Option<String>,
    format: Option<String>,
}

impl Config {
    /// Build the effective configuration from CLI values, the optional
    /// YAML file and environment overrides, then validate it.
    pub fn load(cli: &Cli) -> Result<Config> {
        let mut config = Config {
            database: DatabaseConfig {
                host: cli.db_host.clone(),
                port: cli.db_port,
                user: cli.db_user.clone(),
                password: cli.db_password.clone(),
                name: cli.db_name.clone(),
                sslmode: cli.db_sslmode.clone(),
                no_sync: cli.no_sync,
                sync_interval: cli.sync_interval,
                orphan_grace_minutes: None,
            },
            log: LogConfig {
                level: cli.log_level.clone(),
                format: cli.log_format.clone(),
            },
            providers: ProvidersConfig::default(),
        };

        if let Some(path) = &cli.config_file {
            let text = fs::read_to_string(path).map_err(|e| {
                AppError::Config(format!("cannot read config file {}: {e}", path.display()))
            })?;
            let file: ConfigFile = serde_yml::from_str(&text).map_err(|e| {
                AppError::Config(format!("cannot parse config file {}: {e}", path.display()))
            })?;
            config.apply_file(file);
        }

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        let db = &mut self.database;
        let overlay = file.database;
        if let Some(v) = overlay.host {
            db.host = v;
        }
        if let Some(v) = overlay.port {
            db.port = v;
        }
        if let Some(v) = overlay.user {
            db.user = v;
        }
        if let Some(v) = overlay.password {
            db.password = v;
        }
        if let Some(v) = overlay.name {
            db.name = v;
        }
        if let Some(v) = overlay.sslmode {
            db.sslmode = v;
        }
        if let Some(v) = overlay.no_sync {
            db.no_sync = v;
        }
        if let Some(v) = overlay.sync_interval {
            db.sync_interval = v;
        }
        if let Some(v) = overlay.orphan_grace_minutes {
            db.orphan_grace_minutes = Some(v);
        }

        if let Some(v) = file.log.level {
            self.log.level = v;
        }
        if let Some(v) = file.log.format {
            self.log.format = v;
        }

        self.providers = file.providers;
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = env::var("DB_HOST") {
            self.database.host = v;
        }
        if let Ok(v) = env::var("DB_PORT") {
            self.database.port = v
                .parse()
                .map_err(|_| AppError::Config(format!("invalid DB_PORT '{v}'")))?;
        }
        if let Ok(v) = env::var("DB_USER") {
            self.database.user = v;
        }
        if let Ok(v) = env::var("DB_PASSWORD") {
            self.database.password = v;
        }
        if let Ok(v) = env::var("DB_NAME") {
            self.database.name = v;
        }
        if let Ok(v) = env::var("DB_SSLMODE") {
            self.database.sslmode = v;
        }
        if let Ok(v) = env::var("DB_NO_SYNC") {
            self.database.no_sync = parse_bool("DB_NO_SYNC", &v)?;
        }
        if let Ok(v) = env::var("DB_SYNC_INTERVAL") {
            self.database.sync_interval = v
                .parse()
                .map_err(|_| AppError::Config(format!("invalid DB_SYNC_INTERVAL '{v}'")))?;
        }
        if let Ok(v) = env::var("LOG_LEVEL") {
            self.log.level = v;
        }
        if let Ok(v) = env::var("LOG_FORMAT") {
            self.log.format = v;
        }

        // AWS settings apply to every configured account entry; a
        // bucket given purely through the environment creates one.
        if let Ok(bucket) = env::var("AWS_BUCKET") {
            if self.providers.aws.is_empty() && !bucket.is_empty() {
                self.providers.aws.push(providers::aws::AwsConfig {
                    s3: vec![providers::aws::S3BucketConfig {
                        bucket,
                        ..Default::default()
                    }],
                    ..Default::default()
                });
            }
        }
        for aws in &mut self.providers.aws {
            if let Ok(v) = env::var("AWS_ACCESS_KEY_ID") {
                aws.access_key = v;
            }
            if let Ok(v) = env::var("AWS_SECRET_ACCESS_KEY") {
                aws.secret_access_key = v;
            }
            if let Ok(v) = env::var("AWS_DEFAULT_REGION") {
                aws.region = v;
            }
            if let Ok(v) = env::var("AWS_DYNAMODB_TABLE") {
                aws.dynamodb_table = v;
            }
        }

        if let (Ok(token), Ok(organization)) = (env::var("TFE_TOKEN"), env::var("TFE_ORGANIZATION"))
        {
            if self.providers.tfe.is_empty() {
                self.providers.tfe.push(providers::tfe::TfeConfig {
                    token,
                    organization,
                    ..Default::default()
                });
            }
        }
        if let Ok(v) = env::var("TFE_ADDRESS") {
            for tfe in &mut self.providers.tfe {
                tfe.address = v.clone();
            }
        }

        if let Ok(token) = env::var("GITLAB_TOKEN") {
            if self.providers.gitlab.is_empty() && !token.is_empty() {
                self.providers.gitlab.push(providers::gitlab::GitlabConfig {
                    token,
                    ..Default::default()
                });
            }
        }
        if let Ok(v) = env::var("GITLAB_ADDRESS") {
            for gitlab in &mut self.providers.gitlab {
                gitlab.address = v.clone();
            }
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.database.user.is_empty() {
            return Err(AppError::Config("database user must not be empty".into()));
        }
        if self.database.name.is_empty() {
            return Err(AppError::Config("database name must not be empty".into()));
        }
        if self.database.sync_interval == 0 {
            return Err(AppError::Config(
                "sync_interval must be at least 1 minute".into(),
            ));
        }
        match self.log.level.as_str() {
            "debug" | "info" | "warn" | "error" | "fatal" | "panic" => {}
            other => {
                return Err(AppError::Config(format!("invalid log level '{other}'")));
            }
        }
        match self.log.format.as_str() {
            "plain" | "json" => {}
            other => {
                return Err(AppError::Config(format!("invalid log format '{other}'")));
            }
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        other => Err(AppError::Config(format!("invalid {name} '{other}'"))),
    }
}
