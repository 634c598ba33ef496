use crate::llm::race::WinnerPolicy;
use clap::Parser;
use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: String,
    pub pool_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

/// One provider/model endpoint and its pricing per 1k tokens (USD).
/// Configured once at startup, read-only thereafter.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelDescriptor {
    pub id: String,
    pub input_price_per_1k: f64,
    pub output_price_per_1k: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub models: Vec<ModelDescriptor>,
}

/// Budget and safety knobs for query execution.
#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    pub default_limit: u32,
    pub max_rows: usize,
    pub statement_timeout_ms: u64,
    pub winner_policy: WinnerPolicy,
    pub timezone: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub llm: LlmConfig,
    pub query: QueryConfig,
    pub data_dir: String,
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

    /// Directory holding the seed CSV files
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Load the seed CSVs and rebuild the reporting views before serving
    #[arg(long)]
    pub seed: bool,
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
                "/etc/retail-nlq/config.toml",
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

        let mut config: AppConfig = if found_file {
            config_builder.build()?.try_deserialize()?
        } else {
            AppConfig::default()
        };

        // The key never lives in the config file; the environment wins.
        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            if !key.is_empty() {
                config.llm.api_key = Some(key);
            }
        }

        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }
        if let Some(data_dir) = &args.data_dir {
            config.data_dir = data_dir.clone();
        }

        Ok(config)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                path: "retail-nlq.db".to_string(),
                pool_size: 5,
            },
            web: WebConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            llm: LlmConfig {
                api_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
                api_key: None,
                max_tokens: 500,
                temperature: 0.2,
                models: vec![
                    model("nousresearch/hermes-4-405b", 0.0020, 0.0080),
                    model("deepseek/deepseek-chat-v3.1:free", 0.0, 0.0),
                    model("x-ai/grok-code-fast-1", 0.0020, 0.0150),
                    model("deepseek/deepseek-chat-v3.1", 0.0020, 0.0080),
                    model("qwen/qwen3-coder", 0.0020, 0.0080),
                    model("google/gemini-2.5-flash", 0.0030, 0.0250),
                    model("openai/gpt-4.1-mini", 0.0040, 0.0160),
                    model("tencent/hunyuan-a13b-instruct:free", 0.0, 0.0),
                ],
            },
            query: QueryConfig {
                default_limit: 200,
                max_rows: 10_000,
                statement_timeout_ms: 5_000,
                winner_policy: WinnerPolicy::Cheapest,
                timezone: "Australia/Melbourne".to_string(),
            },
            data_dir: "data".to_string(),
        }
    }
}

fn model(id: &str, input: f64, output: f64) -> ModelDescriptor {
    ModelDescriptor {
        id: id.to_string(),
        input_price_per_1k: input,
        output_price_per_1k: output,
    }
}
