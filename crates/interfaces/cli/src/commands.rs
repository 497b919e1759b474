use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use wayfinder_config::AppConfig;
use wayfinder_runtime::{LocationService, ResponseStatus};
use wayfinder_tools::{ToolChannel, ToolSession};

pub async fn run_ask(config: &AppConfig, query: &str) -> Result<()> {
    let service = LocationService::initialize(config).await?;

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling request");
                cancel.cancel();
            }
        })
    };

    let result = service.answer(query, &cancel).await;
    watcher.abort();
    service.shutdown().await;

    match result {
        Ok(response) => {
            info!(
                status = ?response.status,
                rounds = response.rounds,
                elapsed_ms = response.elapsed.as_millis() as u64,
                words = response.report.word_count,
                "query answered"
            );
            println!("{}", response.text);
            if response.status == ResponseStatus::Degraded {
                eprintln!("\n(note: the search was cut short; results may be incomplete)");
            }
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "query failed");
            bail!(err.user_message())
        }
    }
}

pub async fn run_models(config: &AppConfig) -> Result<()> {
    let service = LocationService::build(config)?;
    let models = service.registry().list_models().await;
    service.shutdown().await;

    let models = models?;
    println!("── installed models ───────────────────────────────────────");
    if models.is_empty() {
        println!("  (none)");
    }
    for model in &models {
        let marker = if model.name == service.model() { "*" } else { " " };
        println!("{marker} {}", model.name);
    }
    Ok(())
}

pub async fn run_pull(config: &AppConfig, model: &str) -> Result<()> {
    let service = LocationService::build(config)?;
    let installed = service.registry().ensure_model(model).await;
    service.shutdown().await;

    if !installed? {
        bail!("model '{model}' is still not available after pulling");
    }
    println!("model '{model}' is available");
    Ok(())
}

pub async fn run_check(config: &AppConfig) -> Result<()> {
    let service = LocationService::build(config)?;

    let ready = service.supervisor().is_ready().await;
    println!("── inference daemon ───────────────────────────────────────");
    println!(
        "  {:<22} {}",
        service.supervisor().base_url(),
        if ready { "ready" } else { "not responding" }
    );

    println!("── tool server ────────────────────────────────────────────");
    let spec = service.tool_spec();
    match ToolSession::open(spec).await {
        Ok(session) => {
            for tool in session.tools() {
                println!("  {:<22} {}", tool.name, first_line(&tool.description));
            }
            session.close().await;
        }
        Err(err) => {
            println!("  {:<22} {err}", spec.command);
        }
    }

    if !config.tool.has_credential() {
        println!("\n  {} is not set", config.tool.credential_env);
    }
    Ok(())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_line_of_multiline_description() {
        assert_eq!(first_line("Search places\nmore detail"), "Search places");
        assert_eq!(first_line(""), "");
    }
}
