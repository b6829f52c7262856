//! Environment-driven server configuration.

use color_eyre::eyre::WrapErr as _;

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Which storage backend to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageKind {
    InMem,
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,

    pub storage: StorageKind,
    pub storage_dsn: String,
    /// `delete=1` enables hard-deletion of completed commands.
    pub storage_options: Option<String>,

    /// PEM bundle of CA certificates devices authenticate with. Required.
    pub ca_path: String,
    /// PEM bundle of intermediate certificates.
    pub intermediates_path: Option<String>,
    /// Header carrying the URL-escaped client certificate from a
    /// TLS-terminating proxy; the `Mdm-Signature` header is used otherwise.
    pub cert_header: Option<String>,
    /// Allow retroactive certificate association.
    pub retro: bool,

    /// API key enabling the admin endpoints (basic auth password).
    pub api_key: Option<String>,

    pub webhook_url: Option<String>,
    pub dm_url: Option<String>,

    /// Dump raw MDM requests and responses to stdout.
    pub dump: bool,
    /// Enable the migration check-in endpoint.
    pub migration: bool,
}

impl Config {
    pub fn from_env() -> color_eyre::eyre::Result<Self> {
        let storage = match env_opt("STORAGE").as_deref() {
            None | Some("sqlite") => StorageKind::Sqlite,
            Some("inmem") => StorageKind::InMem,
            Some(other) => color_eyre::eyre::bail!("unknown storage backend: {other}"),
        };
        let storage_dsn = env_opt("STORAGE_DSN").unwrap_or_else(|| "aspen.db".to_string());
        let ca_path = env_opt("ASPEN_CA")
            .ok_or_else(|| color_eyre::eyre::eyre!("ASPEN_CA (CA certificate path) required"))?;
        Ok(Self {
            listen: env_opt("ASPEN_LISTEN").unwrap_or_else(|| "0.0.0.0:9000".to_string()),
            storage,
            storage_dsn,
            storage_options: env_opt("STORAGE_OPTIONS"),
            ca_path,
            intermediates_path: env_opt("ASPEN_INTERMEDIATES"),
            cert_header: env_opt("ASPEN_CERT_HEADER"),
            retro: env_opt("ASPEN_RETRO").is_some(),
            api_key: env_opt("ASPEN_API_KEY"),
            webhook_url: env_opt("ASPEN_WEBHOOK_URL"),
            dm_url: env_opt("ASPEN_DM_URL"),
            dump: env_opt("ASPEN_DUMP").is_some(),
            migration: env_opt("ASPEN_MIGRATION").is_some(),
        })
    }

    pub fn command_deletion(&self) -> bool {
        self.storage_options
            .as_deref()
            .map(|opts| opts.split(',').any(|opt| opt == "delete=1"))
            .unwrap_or(false)
    }

    pub fn load_verifier(&self) -> color_eyre::eyre::Result<aspen_crypto::ChainVerifier> {
        let roots = std::fs::read(&self.ca_path)
            .wrap_err_with(|| format!("reading CA bundle: {}", self.ca_path))?;
        let intermediates = self
            .intermediates_path
            .as_deref()
            .map(std::fs::read)
            .transpose()
            .wrap_err("reading intermediates bundle")?;
        aspen_crypto::ChainVerifier::from_pem(&roots, intermediates.as_deref())
    }
}
