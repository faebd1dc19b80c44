//! Zentinel Mock Engine - CLI Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use zentinel_mock_engine::{EngineConfig, MatcherFactories, MockEngine, RequestMessage};

#[derive(Parser, Debug)]
#[command(
    name = "zentinel-mock-engine",
    about = "Request matching engine for Zentinel mock servers - validate mappings and resolve requests",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mock-engine.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// JSON request document(s) to resolve, in order
    #[arg(short, long = "request", value_name = "FILE")]
    requests: Vec<PathBuf>,
}

/// A request as read from a JSON document.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RequestDocument {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, HeaderValues>,
    /// UTF-8 body
    #[serde(default)]
    body: Option<String>,
    /// Binary body, base64 encoded
    #[serde(default)]
    body_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RequestDocuments {
    One(RequestDocument),
    Many(Vec<RequestDocument>),
}

fn default_method() -> String {
    "GET".to_string()
}

impl RequestDocument {
    fn into_request(self) -> Result<RequestMessage> {
        let mut request = RequestMessage::new(self.method, &self.url);
        for (name, values) in self.headers {
            let values = match values {
                HeaderValues::One(value) => vec![value],
                HeaderValues::Many(values) => values,
            };
            for value in values {
                request = request.with_header(&name, value);
            }
        }

        if let Some(body) = self.body {
            request = request.with_body(body.into_bytes());
        } else if let Some(encoded) = self.body_base64 {
            use base64::Engine;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .context("Invalid base64 body")?;
            request = request.with_body(bytes);
        }
        Ok(request)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print default config if requested
    if args.print_config {
        let default_config = include_str!("../demos/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    let factories = MatcherFactories::default();

    // Load and validate configuration
    let config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        let content = tokio::fs::read_to_string(&args.config)
            .await
            .with_context(|| format!("Failed to read {}", args.config.display()))?;
        EngineConfig::from_yaml_with(&content, &factories)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no mappings)");
        EngineConfig::default()
    };

    // Exit after validation if requested
    if args.validate {
        println!(
            "Configuration is valid ({} mappings defined)",
            config.mappings.len()
        );
        return Ok(());
    }

    let engine = MockEngine::from_config(&config, &factories)?;

    for path in &args.requests {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let documents = match serde_json::from_str::<RequestDocuments>(&content)
            .with_context(|| format!("Invalid request document {}", path.display()))?
        {
            RequestDocuments::One(document) => vec![document],
            RequestDocuments::Many(documents) => documents,
        };

        for document in documents {
            let request = document.into_request()?;
            let resolution = engine.resolve(&request);
            println!("{}", serde_json::to_string_pretty(&resolution)?);
        }
    }

    info!(
        requests = engine.total_requests(),
        matched = engine.total_matched(),
        unmatched = engine.total_unmatched(),
        "Done"
    );

    Ok(())
}
