use anyhow::{Context, Result};
use clap::Parser;
use nocache_core::{
    resolve_run_override, title_requests_reclaim, ClassifierConfig, ConfigStore, Prompt,
};
use nocache_monitoring::{init_logging, MonitoringConfig};
use nocache_runtime::NoCacheRuntime;
use std::path::PathBuf;

/// Show how the cache-bypass rules classify the nodes of a prompt
#[derive(Debug, Parser)]
#[command(name = "nocache-inspect", version)]
struct Args {
    /// Prompt JSON: an object of node id to node
    prompt: PathBuf,

    /// Configuration file; defaults plus environment overrides when omitted
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&MonitoringConfig {
        service_name: "nocache-inspect".to_string(),
        log_filter: "warn".to_string(),
        json_logs: args.json_logs,
    })
    .context("Failed to initialize logging")?;

    let store = match &args.config {
        Some(path) => ConfigStore::load(path.clone()),
        None => {
            let mut defaults = ClassifierConfig::default();
            defaults.apply_env_overrides(|name| std::env::var(name).ok());
            ConfigStore::new(defaults)
        }
    };
    let runtime = NoCacheRuntime::new(store);

    let text = std::fs::read_to_string(&args.prompt)
        .with_context(|| format!("Failed to read prompt {}", args.prompt.display()))?;
    let prompt = Prompt::from_json_str(&text).context("Failed to parse prompt")?;

    let config_override = resolve_run_override(&prompt).context("Prompt cannot run")?;
    let config = runtime.config().effective_with(Some(&config_override));

    println!(
        "enabled={} debug={} excluded_classes={:?}",
        config.enabled, config.debug, config.excluded_class_tags
    );
    for node in prompt.iter() {
        let classification = match runtime.classifier().classify(Some(node), &config) {
            Some(_) if !config.enabled => "cacheable (rules disabled)",
            Some(exclusion) => exclusion.label(),
            None => "cacheable",
        };
        let reclaim = if node.title().is_some_and(title_requests_reclaim) {
            " @gc"
        } else {
            ""
        };
        println!(
            "{}\t{}\t{}{}",
            node.id, node.class_type, classification, reclaim
        );
    }

    Ok(())
}
