//! Database dump strategy
//!
//! Shells out to `pg_dump`/`mysqldump` to capture and `psql`/`mysql` to
//! restore. Passwords travel through the tool's environment variable, never
//! on the command line.

use super::{
    artifact_file_name, discard, produce_or_discard, ApplyError, CaptureError, CapturedArtifact,
    RestoreTarget, SourceCapturer,
};
use crate::config::{BackupConfig, BackupKind, DatabaseConfig, DatabaseEngine};
use crate::integrity::IntegrityVerifier;
use crate::utils::cancel::CancelToken;
use crate::utils::command::CommandSpec;
use crate::utils::executor::CommandExecutor;
use percent_encoding::percent_decode_str;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

const DEFAULT_MYSQL_PORT: u16 = 3306;

pub struct DatabaseCapturer {
    config: DatabaseConfig,
    executor: Arc<dyn CommandExecutor>,
}

/// Connection details split out of the configured URL
#[derive(Debug, Clone, PartialEq, Eq)]
struct Connection {
    /// URL with the password removed
    public_url: String,
    host: String,
    port: Option<u16>,
    user: String,
    password: Option<String>,
    database: String,
}

impl Connection {
    fn parse(raw: &str) -> Result<Self, String> {
        let mut url = Url::parse(raw).map_err(|e| format!("invalid database URL: {}", e))?;
        let password = url.password().map(percent_decode);
        let user = percent_decode(url.username());
        let host = url.host_str().unwrap_or("localhost").to_string();
        let port = url.port();
        let database = url.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err("database URL does not name a database".to_string());
        }

        url.set_password(None)
            .map_err(|_| "database URL cannot carry credentials".to_string())?;

        Ok(Self {
            public_url: url.to_string(),
            host,
            port,
            user,
            password,
            database,
        })
    }
}

fn percent_decode(input: &str) -> String {
    percent_decode_str(input).decode_utf8_lossy().into_owned()
}

impl DatabaseCapturer {
    pub fn new(config: DatabaseConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { config, executor }
    }

    fn engine(&self) -> DatabaseEngine {
        self.config.engine
    }

    fn dump_tool(&self) -> &'static str {
        match self.engine() {
            DatabaseEngine::Postgres => "pg_dump",
            DatabaseEngine::Mysql => "mysqldump",
        }
    }

    fn load_tool(&self) -> &'static str {
        match self.engine() {
            DatabaseEngine::Postgres => "psql",
            DatabaseEngine::Mysql => "mysql",
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.dump_timeout_seconds)
    }

    /// Connection flags plus the password environment variable
    fn connect(&self, spec: CommandSpec, conn: &Connection) -> CommandSpec {
        let spec = match self.engine() {
            DatabaseEngine::Postgres => spec.arg(format!("--dbname={}", conn.public_url)),
            DatabaseEngine::Mysql => {
                let mut spec = spec
                    .arg(format!("--host={}", conn.host))
                    .arg(format!("--port={}", conn.port.unwrap_or(DEFAULT_MYSQL_PORT)));
                if !conn.user.is_empty() {
                    spec = spec.arg(format!("--user={}", conn.user));
                }
                spec
            }
        };

        match (&conn.password, self.engine()) {
            (Some(password), DatabaseEngine::Postgres) => spec.env("PGPASSWORD", password.clone()),
            (Some(password), DatabaseEngine::Mysql) => spec.env("MYSQL_PWD", password.clone()),
            (None, _) => spec,
        }
    }

    fn dump_spec(&self, conn: &Connection, output: &Path) -> CommandSpec {
        let spec = self.connect(CommandSpec::new(self.dump_tool()), conn);
        let spec = match self.engine() {
            DatabaseEngine::Postgres => spec.args([
                format!("--file={}", output.display()),
                "--format=plain".to_string(),
                "--no-owner".to_string(),
                "--no-privileges".to_string(),
            ]),
            DatabaseEngine::Mysql => spec
                .args([
                    format!("--result-file={}", output.display()),
                    "--single-transaction".to_string(),
                    "--routines".to_string(),
                ])
                .arg(conn.database.clone()),
        };
        spec.args(self.config.extra_dump_args.iter().cloned())
            .timeout(self.timeout())
    }

    fn load_spec(&self, conn: &Connection, input: &Path) -> CommandSpec {
        let spec = self.connect(CommandSpec::new(self.load_tool()), conn);
        match self.engine() {
            DatabaseEngine::Postgres => spec.args([
                "--single-transaction".to_string(),
                "--set=ON_ERROR_STOP=1".to_string(),
                format!("--file={}", input.display()),
            ]),
            DatabaseEngine::Mysql => spec
                .arg(conn.database.clone())
                .arg(format!("--execute=source {}", input.display())),
        }
        .timeout(self.timeout())
    }

    /// Run the dump tool into `output`, removing it on any failure
    fn dump_to(&self, conn: &Connection, output: &Path, cancel: &CancelToken) -> Result<u64, CaptureError> {
        let spec = self.dump_spec(conn, output);
        info!("Running {}", spec.display());

        produce_or_discard(output, || {
            self.executor.run(&spec, cancel)?;
            let size = std::fs::metadata(output)
                .map_err(|e| CaptureError::io(output, e))?
                .len();
            if size == 0 {
                return Err(CaptureError::Source(format!(
                    "{} produced an empty dump",
                    self.dump_tool()
                )));
            }
            Ok(size)
        })
    }
}

impl SourceCapturer for DatabaseCapturer {
    fn kind(&self) -> BackupKind {
        BackupKind::Database
    }

    fn capture(
        &self,
        config: &BackupConfig,
        work_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<CapturedArtifact, CaptureError> {
        cancel.check()?;
        if !self.executor.is_available(self.dump_tool()) {
            return Err(CaptureError::ToolMissing(self.dump_tool().to_string()));
        }
        let conn = Connection::parse(&self.config.url).map_err(CaptureError::InvalidConfig)?;

        let output = work_dir.join(artifact_file_name(config, "sql"));
        let size = self.dump_to(&conn, &output, cancel)?;

        info!("Dumped database '{}' ({} bytes)", conn.database, size);
        Ok(CapturedArtifact::new(output).with_metadata("database_engine", self.engine().as_str()))
    }

    fn restore(
        &self,
        artifact: &Path,
        target: &RestoreTarget,
        _work_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<(), ApplyError> {
        cancel.check()?;
        if !self.executor.is_available(self.load_tool()) {
            return Err(ApplyError::ToolMissing(self.load_tool().to_string()));
        }
        let url = target.database_url.as_deref().unwrap_or(&self.config.url);
        let conn = Connection::parse(url).map_err(ApplyError::MissingTarget)?;

        let spec = self.load_spec(&conn, artifact);
        info!("Loading dump into '{}' with {}", conn.database, self.load_tool());
        self.executor.run(&spec, cancel)?;
        Ok(())
    }

    fn current_state_checksum(
        &self,
        target: &RestoreTarget,
        work_dir: &Path,
        cancel: &CancelToken,
    ) -> Option<String> {
        if !self.executor.is_available(self.dump_tool()) {
            return None;
        }
        let url = target.database_url.as_deref().unwrap_or(&self.config.url);
        let conn = Connection::parse(url).ok()?;
        let output = work_dir.join("pre-restore-state.sql");

        let result = self
            .dump_to(&conn, &output, cancel)
            .map_err(|e| e.to_string())
            .and_then(|_| {
                IntegrityVerifier::new()
                    .checksum(&output, cancel)
                    .map_err(|e| e.to_string())
            });
        discard(&output);

        match result {
            Ok(checksum) => Some(checksum),
            Err(e) => {
                warn!("Could not checksum current state of '{}': {}", conn.database, e);
                None
            }
        }
    }
}
