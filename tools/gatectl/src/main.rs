use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use gate_core::key;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "gatectl", version, about = "Idempotency gate operator CLI")]
struct Cli {
    /// Base URL of the gate service.
    #[arg(long, env = "GATECTL_URL", default_value = "http://127.0.0.1:8080", global = true)]
    url: String,

    /// Bearer token for the admin routes.
    #[arg(long, env = "GATE_ADMIN_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the stored record for a key.
    Get { key: String },
    /// Record counts by operation type and status.
    Stats,
    /// Run one cleanup sweep now.
    Sweep,
    /// Check a key against the key format without contacting the service.
    ValidateKey { key: String },
    /// Print a fresh key for the given operation prefix.
    NewKey { prefix: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::ValidateKey { key } => {
            let (valid, message) = validate_key(&key);
            println!("{message}");
            Ok(if valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::NewKey { prefix } => {
            let key = key::generate(&prefix).with_context(|| format!("invalid prefix {prefix}"))?;
            println!("{key}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Get { key } => {
            let admin = AdminClient::new(&cli.url, cli.token)?;
            match admin
                .call(Method::GET, &format!("/admin/records/{key}"))
                .await?
            {
                Some(record) => print_json(&record)?,
                None => {
                    eprintln!("no record for {key}");
                    return Ok(ExitCode::FAILURE);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Stats => {
            let admin = AdminClient::new(&cli.url, cli.token)?;
            let stats = admin
                .call(Method::GET, "/admin/stats")
                .await?
                .ok_or_else(|| anyhow!("stats endpoint not found"))?;
            print_json(&stats)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Sweep => {
            let admin = AdminClient::new(&cli.url, cli.token)?;
            let summary = admin
                .call(Method::POST, "/admin/sweep")
                .await?
                .ok_or_else(|| anyhow!("sweep endpoint not found"))?;
            print_json(&summary)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn validate_key(key: &str) -> (bool, String) {
    match key::parse(key) {
        Ok(parsed) => (true, format!("valid (operation prefix: {})", parsed.prefix())),
        Err(error) => (false, format!("invalid: {error}")),
    }
}

struct AdminClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl AdminClient {
    fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build reqwest client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// `Ok(None)` when the service answers 404.
    async fn call(&self, method: Method, path: &str) -> Result<Option<Value>> {
        let url = self.endpoint(path);
        let mut request = self.client.request(method, &url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("request {url}"))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(anyhow!("unauthorized; set --token or GATE_ADMIN_TOKEN"));
        }

        let body: Value = response
            .json()
            .await
            .with_context(|| format!("decode response from {url}"))?;
        if !status.is_success() {
            return Err(anyhow!("{url} returned {status}: {body}"));
        }
        Ok(Some(body))
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("format response")?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands_and_global_flags() {
        let cli = Cli::try_parse_from([
            "gatectl",
            "get",
            "payment_7f3a9c2e4b1d4e8f9a0b1c2d",
            "--url",
            "http://gate:9000/",
        ])
        .expect("parse");
        assert!(matches!(cli.command, Command::Get { ref key } if key == "payment_7f3a9c2e4b1d4e8f9a0b1c2d"));
        assert_eq!(cli.url, "http://gate:9000/");

        let cli = Cli::try_parse_from(["gatectl", "new-key", "refund"]).expect("parse");
        assert!(matches!(cli.command, Command::NewKey { ref prefix } if prefix == "refund"));
    }

    #[test]
    fn validate_key_reports_reason() {
        let (valid, message) = validate_key("payment_7f3a9c2e4b1d4e8f9a0b1c2d");
        assert!(valid);
        assert!(message.contains("payment"));

        let (valid, message) = validate_key("payment_aaaaaaaaaaaaaaaaaaaa");
        assert!(!valid);
        assert!(message.starts_with("invalid"));
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        let admin = AdminClient::new("http://gate:9000/", None).expect("client");
        assert_eq!(admin.endpoint("/admin/stats"), "http://gate:9000/admin/stats");
    }
}
