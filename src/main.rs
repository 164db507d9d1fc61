//! Tollgate -- send one authenticated request to the shop API.
//!
//! Restores the session (mirror or refresh cookie), signs in with
//! `TOLLGATE_EMAIL`/`TOLLGATE_PASSWORD` when nothing was restored, sends the
//! request through the pipeline and prints the response body.

use std::path::PathBuf;

use anyhow::{Context, bail};
use reqwest::Method;
use tracing_subscriber::EnvFilter;

use tollgate::{Config, Pipeline};

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

struct CliArgs {
    config_path: PathBuf,
    method: Method,
    path: String,
    body: Option<String>,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut args = std::env::args().skip(1);
    let mut config_path = PathBuf::from("tollgate.toml");
    let mut positional = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let Some(path) = args.next() else {
                    bail!("--config requires a path argument");
                };
                config_path = PathBuf::from(path);
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("tollgate {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let (Some(method), Some(path)) = (positional.next(), positional.next()) else {
        print_usage();
        std::process::exit(1);
    };
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid method '{method}'"))?;
    let body = positional.next();
    if let Some(extra) = positional.next() {
        bail!("unexpected argument: {extra}");
    }

    Ok(CliArgs {
        config_path,
        method,
        path,
        body,
    })
}

fn print_usage() {
    println!(
        "\
tollgate {version} -- authenticated shop API client

USAGE:
    tollgate [OPTIONS] <METHOD> <PATH> [JSON_BODY]

OPTIONS:
    -c, --config <PATH>    Path to configuration file [default: tollgate.toml]
    -h, --help             Print this help message
    -V, --version          Print version information

ENVIRONMENT:
    RUST_LOG               Override log level (e.g. RUST_LOG=debug)
    TOLLGATE_CONFIG        Alternative to --config flag
    TOLLGATE_EMAIL         Sign-in email when no session can be restored
    TOLLGATE_PASSWORD      Sign-in password when no session can be restored
",
        version = env!("CARGO_PKG_VERSION")
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = parse_args()?;

    let config_path = std::env::var("TOLLGATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or(cli.config_path);
    let config = Config::load(&config_path)?;

    init_tracing(&config);
    tracing::debug!(config = %config_path.display(), base_url = %config.api.base_url, "Configuration loaded");

    let pipeline = Pipeline::builder(config).build()?;

    if !pipeline.restore_session().await {
        let (Ok(email), Ok(password)) = (
            std::env::var("TOLLGATE_EMAIL"),
            std::env::var("TOLLGATE_PASSWORD"),
        ) else {
            bail!("no session to restore; set TOLLGATE_EMAIL and TOLLGATE_PASSWORD to sign in");
        };
        pipeline
            .login(&email, &password)
            .await
            .context("sign-in failed")?;
    }

    let mut request = pipeline.request(cli.method, cli.path);
    if let Some(body) = cli.body {
        let value: serde_json::Value =
            serde_json::from_str(&body).context("request body is not valid JSON")?;
        request = request.json(&value);
    }

    let response = request.send().await?;
    tracing::info!(status = response.status().as_u16(), "Request completed");

    match response.json::<serde_json::Value>() {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", response.text()),
    }
    Ok(())
}

fn init_tracing(config: &Config) {
    // RUST_LOG env var takes precedence over config file
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.logging.level;
        EnvFilter::new(format!("tollgate={level},warn"))
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
