use std::env;

use dotenvy::dotenv;
use thiserror::Error;
use validator::Validate;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

#[derive(Debug, Clone, Validate)]
pub struct Config {
    /// Absent means records live in memory for the life of the process.
    pub database_url: Option<String>,
    #[validate(range(min = 1, max = 100))]
    pub database_max_connections: u32,
    pub bind_addr: String,
    pub upload_dir: String,
    pub s3_endpoint: Option<String>,
    pub s3_region: String,
    pub s3_bucket: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    #[validate(range(min = 1, max = 104857600))] // Max 100MB
    pub max_file_size: u64,
    #[validate(length(min = 1))]
    pub allowed_extensions: Vec<String>,
    /// New files go to S3 when set, to the local upload directory otherwise.
    pub use_s3: bool,
    #[validate(range(min = 1, max = 3650))]
    pub bin_retention_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 5,
            bind_addr: "0.0.0.0:3000".to_string(),
            upload_dir: "uploads".to_string(),
            s3_endpoint: None,
            s3_region: "us-east-1".to_string(),
            s3_bucket: "teamdrive".to_string(),
            s3_access_key: "minioadmin".to_string(),
            s3_secret_key: "minioadmin".to_string(),
            max_file_size: 16 * 1024 * 1024,
            allowed_extensions: parse_extensions("txt,md,docx,jpg,jpeg,png,gif,pdf,svg"),
            use_s3: false,
            bin_retention_days: 30,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load environment variables from `.env` file (if it exists)
        dotenv().ok();

        let defaults = Config::default();

        let config = Config {
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            database_max_connections: parse_var(
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            bind_addr: env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            upload_dir: env::var("UPLOAD_DIR").unwrap_or(defaults.upload_dir),
            s3_endpoint: env::var("S3_ENDPOINT").ok(),
            s3_region: env::var("S3_REGION").unwrap_or(defaults.s3_region),
            s3_bucket: env::var("S3_BUCKET").unwrap_or(defaults.s3_bucket),
            s3_access_key: env::var("S3_ACCESS_KEY").unwrap_or(defaults.s3_access_key),
            s3_secret_key: env::var("S3_SECRET_KEY").unwrap_or(defaults.s3_secret_key),
            max_file_size: parse_var("MAX_FILE_SIZE", defaults.max_file_size)?,
            allowed_extensions: env::var("ALLOWED_EXTENSIONS")
                .map(|list| parse_extensions(&list))
                .unwrap_or(defaults.allowed_extensions),
            use_s3: parse_var("USE_S3", defaults.use_s3)?,
            bin_retention_days: parse_var("BIN_RETENTION_DAYS", defaults.bin_retention_days)?,
        };

        // Validate configuration values (e.g. file size range)
        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}

fn parse_extensions(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().trim_start_matches('.').to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bin_retention_days, 30);
        assert!(config.allowed_extensions.contains(&"md".to_string()));
    }

    #[test]
    fn zero_retention_is_rejected() {
        let config = Config { bin_retention_days: 0, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn extension_list_is_normalized() {
        assert_eq!(parse_extensions(" .TXT, md,,PDF "), vec!["txt", "md", "pdf"]);
    }
}
