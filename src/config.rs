use clap::Parser;
use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

/// Upstream database service. All reads route through it; the core never
/// opens a file-level database handle.
#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelsConfig {
    pub backend: String, // currently only "bedrock"
    pub endpoint: Option<String>,
    pub translator: String,
    pub narrator: String,
    /// Produced for other parts of the stack; not consumed by translation.
    pub embedding: String,
}

/// One configured back-end database. The selector set is closed: a request
/// naming anything else fails with UnknownDatabase.
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseProfile {
    pub name: String,
    pub primary_table: String,
    /// Optional JSON file mapping physical column names back to the
    /// original (often Japanese) CSV headers.
    pub column_mapping: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub web: WebConfig,
    pub upstream: UpstreamConfig,
    pub models: ModelsConfig,
    pub databases: Vec<DatabaseProfile>,
    pub default_strategy: String,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Database service base URL (overrides config and PATENT_DB_URL)
    #[arg(long)]
    pub db_url: Option<String>,
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder();

        let mut found_file = args.config.is_some();
        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/patent-nlq/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    found_file = true;
                    break;
                }
            }
        }

        // No config file anywhere: run with the built-in profile set.
        let mut config: AppConfig = if found_file {
            config_builder.build()?.try_deserialize()?
        } else {
            AppConfig::default()
        };

        // Environment first, then command line; most specific wins.
        if let Ok(url) = std::env::var("PATENT_DB_URL") {
            if !url.trim().is_empty() {
                config.upstream.base_url = url;
            }
        }
        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }
        if let Some(db_url) = &args.db_url {
            config.upstream.base_url = db_url.clone();
        }

        Ok(config)
    }

    pub fn database(&self, selector: &str) -> Option<&DatabaseProfile> {
        self.databases.iter().find(|db| db.name == selector)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            web: WebConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            upstream: UpstreamConfig {
                base_url: "http://patentdwh-db:5002".to_string(),
            },
            models: ModelsConfig {
                backend: "bedrock".to_string(),
                endpoint: None,
                translator: "anthropic.claude-3-haiku-20240307-v1:0".to_string(),
                narrator: "anthropic.claude-3-haiku-20240307-v1:0".to_string(),
                embedding: "amazon.titan-embed-text-v2:0".to_string(),
            },
            databases: vec![
                DatabaseProfile {
                    name: "inpit".to_string(),
                    primary_table: "inpit_data".to_string(),
                    column_mapping: Some("data/column_mapping.json".to_string()),
                },
                DatabaseProfile {
                    name: "patents_primary".to_string(),
                    primary_table: "publications".to_string(),
                    column_mapping: None,
                },
                DatabaseProfile {
                    name: "patents_secondary".to_string(),
                    primary_table: "patent_families".to_string(),
                    column_mapping: None,
                },
            ],
            default_strategy: "rule_first".to_string(),
        }
    }
}
