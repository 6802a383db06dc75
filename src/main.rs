//! llmux CLI - stream prompts from OpenAI, Anthropic and Google models.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use llmux::{HealthStatus, InferenceContext, ProviderKind, Settings};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "llmux")]
#[command(version)]
#[command(about = "Stream prompts from multiple LLM vendors through one interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to settings file
    #[arg(short, long, global = true, default_value = "llmux.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a prompt and print deltas as they arrive
    Stream {
        /// Provider: openai, anthropic or google
        #[arg(short, long)]
        provider: String,

        /// Override the configured model
        #[arg(short, long)]
        model: Option<String>,

        /// Seconds to wait for rate-limit admission
        #[arg(long, default_value = "30")]
        admission_timeout: u64,

        /// Prompt text
        prompt: String,
    },

    /// List available models for a provider
    Models {
        /// Provider: openai, anthropic or google
        #[arg(short, long)]
        provider: String,
    },

    /// Health check every configured provider
    Health,

    /// Validate settings file
    Validate,

    /// Show example settings
    Example,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn print_example_settings() {
    let example = r#"# llmux settings file

[http]
# Overall per-call timeout, body included
timeout_secs = 30

[providers.openai]
# api_key = "${OPENAI_API_KEY}"
api_key_env = "OPENAI_API_KEY"
model = "gpt-4o-mini"
temperature = 0.7

[providers.anthropic]
api_key_env = "ANTHROPIC_API_KEY"
model = "claude-sonnet-4-5"
max_tokens = 1024
system_message = "You are a concise assistant."

[providers.google]
api_key_env = "GOOGLE_API_KEY"
model = "gemini-2.5-flash"

# Optional per-provider limits (defaults differ per vendor)
[rate_limits.openai]
max_requests_per_minute = 60
max_concurrent_requests = 10
max_backoff_ms = 60000
"#;
    println!("{example}");
}

fn load_settings(path: &PathBuf) -> Result<Settings> {
    Settings::from_file(path).with_context(|| format!("Failed to load settings from {path:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Example => {
            print_example_settings();
            return Ok(());
        }

        Commands::Validate => {
            let settings = load_settings(&cli.config)?;
            let context = InferenceContext::new(settings)?;

            for name in context.settings().unknown_providers() {
                warn!(provider = %name, "Unknown provider section ignored");
            }

            let providers = context.settings().configured_providers();
            if providers.is_empty() {
                bail!("No [providers.<name>] sections in {:?}", cli.config);
            }

            let mut failures = 0;
            for kind in providers {
                let result = context.resolve_config(kind).and_then(|config| {
                    context.registry().get(kind)?.validate_config(&config)
                });
                match result {
                    Ok(config) => info!(provider = %kind, model = %config.model, "Provider config is valid"),
                    Err(e) => {
                        failures += 1;
                        warn!(provider = %kind, code = %e.code(), error = %e, "Provider config is invalid");
                    }
                }
            }

            if failures > 0 {
                bail!("{failures} provider config(s) failed validation");
            }
            info!("Settings are valid");
        }

        Commands::Models { provider } => {
            let settings = load_settings(&cli.config)?;
            let context = InferenceContext::new(settings)?;
            let kind: ProviderKind = provider.parse()?;
            let config = context.resolve_config(kind)?;

            let result = context.available_models(&config).await?;
            println!(
                "{} models ({}, fetched {}):",
                kind,
                if result.cached { "cached" } else { "fresh" },
                result.fetched_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            for model in result.models {
                match (model.display_name, model.context_window) {
                    (Some(name), Some(window)) => println!("  {:<32} {name} ({window} tokens)", model.id),
                    (Some(name), None) => println!("  {:<32} {name}", model.id),
                    _ => println!("  {}", model.id),
                }
            }
        }

        Commands::Health => {
            let settings = load_settings(&cli.config)?;
            let context = InferenceContext::new(settings)?;
            let results = context.health_check_configured().await;

            let healthy = results
                .iter()
                .filter(|r| r.status == HealthStatus::Healthy)
                .count();
            for result in &results {
                match (result.latency_ms, &result.error) {
                    (Some(latency), None) => println!("{:<10} {} ({latency}ms)", result.provider, result.status),
                    (_, Some(error)) => println!("{:<10} {} - {error}", result.provider, result.status),
                    (None, None) => println!("{:<10} {}", result.provider, result.status),
                }
            }
            println!("\n{healthy}/{} providers healthy", results.len());
        }

        Commands::Stream {
            provider,
            model,
            admission_timeout,
            prompt,
        } => {
            let settings = load_settings(&cli.config)?;
            let context = InferenceContext::new(settings)?;
            let kind: ProviderKind = provider.parse()?;
            let mut config = context.resolve_config(kind)?;
            if let Some(model) = model {
                config.model = model;
            }

            let mut stream = context
                .stream_prompt(prompt, config, Duration::from_secs(admission_timeout))
                .await?;

            let mut stdout = std::io::stdout();
            let mut cancelled = false;
            loop {
                let item = tokio::select! {
                    item = stream.next() => item,
                    _ = tokio::signal::ctrl_c(), if !cancelled => {
                        cancelled = true;
                        context.shutdown();
                        continue;
                    }
                };

                match item {
                    Some(Ok(chunk)) => {
                        write!(stdout, "{}", chunk.content)?;
                        stdout.flush()?;
                        if chunk.is_complete {
                            writeln!(stdout)?;
                            if let Some(tokens) = chunk.token_count {
                                info!(tokens = tokens, "Stream complete");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        writeln!(stdout)?;
                        let error = e.normalize();
                        if error.retryable {
                            eprintln!("This error is transient; retrying may succeed.");
                        }
                        bail!("{error}");
                    }
                    None => break,
                }
            }

            if cancelled {
                eprintln!("cancelled");
            }
        }
    }

    Ok(())
}
