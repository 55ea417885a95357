use super::types::*;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Job '{0}' not found")]
    JobNotFound(String),

    #[error("Storage provider '{0}' is not configured")]
    StorageNotConfigured(StorageProvider),

    #[error("Environment variable '{0}' referenced by config is not set")]
    MissingEnv(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Prefix marking a value that is read from the environment
const ENV_PREFIX: &str = "env:";

/// Load and validate configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration from TOML text
pub fn parse_config(contents: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(contents)?;
    resolve_env_values(&mut config)?;
    validate_config(&config)?;
    Ok(config)
}

/// Resolve a value of the form `env:NAME` to the variable's contents
pub fn resolve_env_value(value: &str) -> Result<String> {
    match value.strip_prefix(ENV_PREFIX) {
        Some(name) => std::env::var(name).map_err(|_| ConfigError::MissingEnv(name.to_string())),
        None => Ok(value.to_string()),
    }
}

fn resolve_in_place(value: &mut String) -> Result<()> {
    *value = resolve_env_value(value)?;
    Ok(())
}

fn resolve_env_values(config: &mut Config) -> Result<()> {
    if let Some(s3) = config.storage.s3.as_mut() {
        resolve_in_place(&mut s3.access_key_id)?;
        resolve_in_place(&mut s3.secret_access_key)?;
        if let Some(token) = s3.session_token.as_mut() {
            resolve_in_place(token)?;
        }
    }
    if let Some(gcs) = config.storage.gcs.as_mut() {
        if let Some(token) = gcs.token.as_mut() {
            resolve_in_place(token)?;
        }
    }
    if let Some(azure) = config.storage.azure.as_mut() {
        resolve_in_place(&mut azure.sas_token)?;
    }
    if let Some(database) = config.database.as_mut() {
        resolve_in_place(&mut database.url)?;
    }
    resolve_in_place(&mut config.notifications.webhook_url)?;
    Ok(())
}

/// Validate the configuration
fn validate_config(config: &Config) -> Result<()> {
    if config.storage.is_empty() {
        return Err(ConfigError::ValidationError(
            "No storage providers defined".to_string(),
        ));
    }

    if !(1..=9).contains(&config.global.compression_level) {
        return Err(ConfigError::ValidationError(format!(
            "compression_level must be between 1 and 9, got {}",
            config.global.compression_level
        )));
    }

    if let Some(gcs) = &config.storage.gcs {
        if gcs.token.is_none() && gcs.token_file.is_none() {
            return Err(ConfigError::ValidationError(
                "storage.gcs requires either token or token_file".to_string(),
            ));
        }
    }

    if let Some(s3) = &config.storage.s3 {
        check_part_size("storage.s3", s3.part_size_mib, S3_PART_SIZE_MIB)?;
    }
    if let Some(azure) = &config.storage.azure {
        check_part_size("storage.azure", azure.part_size_mib, AZURE_BLOCK_SIZE_MIB)?;
    }

    for (name, job) in &config.jobs {
        validate_job(name, job, config)?;
    }

    Ok(())
}

/// Part sizes the providers accept, in MiB
const S3_PART_SIZE_MIB: (u64, u64) = (5, 5 * 1024);
const AZURE_BLOCK_SIZE_MIB: (u64, u64) = (1, 4000);

fn check_part_size(section: &str, part_size_mib: u64, (min, max): (u64, u64)) -> Result<()> {
    if !(min..=max).contains(&part_size_mib) {
        return Err(ConfigError::ValidationError(format!(
            "{}.part_size_mib must be between {} and {}, got {}",
            section, min, max, part_size_mib
        )));
    }
    Ok(())
}

fn validate_job(name: &str, job: &JobConfig, config: &Config) -> Result<()> {
    validate_job_name(name)?;

    if !config.storage.is_configured(job.storage) {
        return Err(ConfigError::StorageNotConfigured(job.storage));
    }

    if job.encrypt && config.global.encryption_key_file.is_none() {
        return Err(ConfigError::ValidationError(format!(
            "Job '{}': encrypt = true requires global.encryption_key_file",
            name
        )));
    }

    match job.kind {
        BackupKind::Database if config.database.is_none() => {
            return Err(ConfigError::ValidationError(format!(
                "Job '{}': database jobs require a [database] section",
                name
            )));
        }
        BackupKind::FileTree | BackupKind::MediaArchive if job.include.is_empty() => {
            return Err(ConfigError::ValidationError(format!(
                "Job '{}': {} jobs require at least one include pattern",
                name, job.kind
            )));
        }
        _ => {}
    }

    Ok(())
}

/// Job names end up in storage keys and lock file names
pub fn validate_job_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        && name != "."
        && name != "..";

    if valid {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(format!(
            "Invalid job name '{}': use letters, digits, '_', '.' or '-'",
            name
        )))
    }
}

/// Resolve a job into its immutable run configuration
pub fn resolve_job(name: &str, config: &Config) -> Result<BackupConfig> {
    let job = config
        .jobs
        .get(name)
        .ok_or_else(|| ConfigError::JobNotFound(name.to_string()))?;

    // Resolve retention (job > per-frequency default)
    let retention_days = job
        .retention_days
        .unwrap_or_else(|| config.retention.days_for(job.frequency));

    Ok(BackupConfig {
        name: name.to_string(),
        kind: job.kind,
        frequency: job.frequency,
        storage_provider: job.storage,
        compress: job.compress,
        encrypt: job.encrypt,
        verify_integrity: job.verify_integrity,
        retention_days,
        include_patterns: job.include.clone(),
        exclude_patterns: job.exclude.clone(),
        metadata: job.metadata.clone(),
    })
}

/// Resolve all enabled jobs in the configuration
pub fn resolve_all_jobs(config: &Config) -> Result<HashMap<String, BackupConfig>> {
    let mut resolved = HashMap::new();

    for (name, job) in &config.jobs {
        if !job.enabled {
            continue;
        }
        resolved.insert(name.clone(), resolve_job(name, config)?);
    }

    Ok(resolved)
}
