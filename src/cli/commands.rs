//! CLI command definitions and handlers

use clap::Subcommand;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::core::cache::{FileCache, TranslationCache};
use crate::core::config::{AppConfig, ConfigStore, FileConfigStore, MemoryConfigStore};
use crate::core::engine::Engine;
use crate::core::models::{ActionRequest, ChannelTestRequest, Task};
use crate::processors::markdown::{read_document, write_document, DocumentFormat, MarkdownProcessor};

/// Interval at which `serve` polls the config file for edits
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Commands for the iFocal translation service
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP API server
    Serve {
        /// Bind address (default: 127.0.0.1)
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Listen port (default: 8000)
        #[arg(short, long, default_value_t = 8000)]
        port: u16,
    },

    /// Run a single-shot action (translate, summarize, rewrite, polish, chat)
    Translate {
        /// Text to process
        text: String,

        /// Feature name; unknown names fall back to chat
        #[arg(long, default_value = "translate")]
        task: String,

        /// Target language (defaults to the configured one)
        #[arg(short, long)]
        target_lang: Option<String>,

        /// Model as <channel>:<model>
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Translate Markdown or plain-text documents
    Page {
        /// Input file or directory (required)
        #[arg(short, long)]
        file: PathBuf,

        /// Output file or directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Target language (defaults to the configured one)
        #[arg(short, long)]
        target_lang: Option<String>,

        /// Recursively translate subdirectories
        #[arg(short, long)]
        recursive: bool,
    },

    /// Send a connection test prompt through a channel
    TestChannel {
        /// Channel name
        channel: String,

        /// Model (defaults to the channel's first model)
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Show the effective rate limits
    RateStatus,

    /// Print the effective configuration as YAML (API keys masked)
    Config,

    /// Manage the local translation cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Remove every cached translation
    Clear,
    /// Show the number of cached translations
    Stats,
}

/// Global options shared by every command
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub qps: Option<u32>,
    pub max_concurrent: Option<u32>,
}

/// Open the config store.
///
/// Rate overrides pin the configuration in memory; otherwise the file is
/// re-read on every access and, when `watch` is set, polled for edits.
pub fn open_store(options: &GlobalOptions, watch: bool) -> anyhow::Result<Arc<dyn ConfigStore>> {
    if options.qps.is_some() || options.max_concurrent.is_some() {
        let mut config = AppConfig::load(options.config.as_deref())?;
        if let Some(qps) = options.qps {
            config.tx_qps = Some(i64::from(qps));
        }
        if let Some(max_concurrent) = options.max_concurrent {
            config.tx_max_concurrent = Some(i64::from(max_concurrent));
        }
        let store: Arc<dyn ConfigStore> = Arc::new(MemoryConfigStore::new(config));
        return Ok(store);
    }

    let store = Arc::new(FileConfigStore::open(options.config.clone())?);
    if watch && store.path().is_some() {
        Arc::clone(&store).spawn_watcher(CONFIG_POLL_INTERVAL);
    }
    Ok(store as Arc<dyn ConfigStore>)
}

fn progress_style() -> anyhow::Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("=>-"))
}

/// Handle server command
pub async fn handle_serve(options: &GlobalOptions, host: String, port: u16) -> anyhow::Result<()> {
    use crate::server::api::run_server;

    let store = open_store(options, true)?;
    let engine = Engine::new(store).await?;

    info!("Starting HTTP server on {}:{}", host, port);
    println!("🚀 Server starting on http://{}:{}", host, port);

    run_server(engine, host, port).await?;

    Ok(())
}

/// Handle single-shot action command
pub async fn handle_translate(
    options: &GlobalOptions,
    text: String,
    task: String,
    target_lang: Option<String>,
    model: Option<String>,
) -> anyhow::Result<()> {
    let engine = Engine::new(open_store(options, false)?).await?;

    let mut request = ActionRequest::new(Task::from_feature(&task), text);
    request.target_lang = target_lang;
    if let Some(model) = model {
        let pair: crate::core::models::ModelPair = model.parse()?;
        request.channel = Some(pair.channel);
        request.model = Some(pair.model);
    }

    let result = engine.dispatcher().perform_action(request).await?;
    info!(channel = %result.channel, model = %result.model, "Action completed");
    println!("{}", result.result);
    Ok(())
}

/// Default output path: `<dir>/translated` or `<stem>.<lang>.<ext>`
fn default_output(file: &Path, target_lang: &str) -> PathBuf {
    if file.is_dir() {
        return file.join("translated");
    }
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let name = match file.extension() {
        Some(ext) => format!("{}.{}.{}", stem, target_lang, ext.to_string_lossy()),
        None => format!("{}.{}", stem, target_lang),
    };
    file.with_file_name(name)
}

/// Handle document translation command
pub async fn handle_page(
    options: &GlobalOptions,
    file: PathBuf,
    output: Option<PathBuf>,
    target_lang: Option<String>,
    recursive: bool,
) -> anyhow::Result<()> {
    let start_time = Instant::now();

    let engine = Engine::new(open_store(options, false)?).await?;
    let config = engine.store().get().await?;
    let target_lang = config.target_lang(target_lang.as_deref());
    let output = output.unwrap_or_else(|| default_output(&file, &target_lang));

    info!("Starting document translation");
    info!("Input: {}", file.display());
    info!("Output: {}", output.display());
    info!("Target language: {}", target_lang);
    info!("Recursive: {}", recursive);

    let processor = MarkdownProcessor::new(engine.orchestrator().await?);

    // (input, output) pairs
    let jobs: Vec<(PathBuf, PathBuf)> = if file.is_dir() {
        let files = if recursive {
            processor.find_files_recursive(&file)?
        } else {
            processor.find_files(&file)?
        };
        files
            .into_iter()
            .filter(|path| !path.starts_with(&output))
            .map(|path| {
                let relative = path.strip_prefix(&file).unwrap_or(&path).to_path_buf();
                let target = output.join(relative);
                (path, target)
            })
            .collect()
    } else {
        vec![(file.clone(), output.clone())]
    };

    if jobs.is_empty() {
        anyhow::bail!("No Markdown or text files found");
    }

    let mut processed = 0;
    let mut failed = 0;
    let mut repaired = 0;

    for (input, target) in jobs {
        let pb = ProgressBar::new(0);
        pb.set_style(progress_style()?);
        pb.set_message(format!("{}", input.display()));

        let content = match read_document(&input).await {
            Ok(content) => content,
            Err(e) => {
                failed += 1;
                pb.abandon_with_message(format!("Failed: {}", e));
                continue;
            }
        };
        let format = DocumentFormat::from_path(&input).unwrap_or(DocumentFormat::PlainText);
        let prepared = processor.prepare(&content, &target_lang, format);
        pb.set_length(prepared.total() as u64);

        let mut progress = prepared.progress();
        let bar = pb.clone();
        let ticker = tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                let current = *progress.borrow_and_update();
                bar.set_length(current.total as u64);
                bar.set_position(current.completed as u64);
            }
        });

        let (translated, stats) = processor.complete(prepared).await;
        ticker.abort();
        repaired += stats.repaired + stats.fallbacks;

        match write_document(&target, &translated).await {
            Ok(()) => {
                processed += 1;
                pb.finish_with_message(format!("{} -> {}", input.display(), target.display()));
            }
            Err(e) => {
                failed += 1;
                pb.abandon_with_message(format!("Failed: {}", e));
                eprintln!("Error processing {}: {}", input.display(), e);
            }
        }
    }

    let duration = start_time.elapsed();
    info!(
        "Completed: {} processed, {} failed in {:?}",
        processed, failed, duration
    );

    println!("\n✅ Translation completed!");
    println!("   Processed: {}", processed);
    println!("   Failed: {}", failed);
    println!("   Repaired or untranslated units: {}", repaired);
    println!("   Time: {:?}", duration);

    Ok(())
}

/// Handle channel connectivity test
pub async fn handle_test_channel(
    options: &GlobalOptions,
    channel: String,
    model: Option<String>,
) -> anyhow::Result<()> {
    let engine = Engine::new(open_store(options, false)?).await?;
    let sample = engine
        .dispatcher()
        .test_channel(ChannelTestRequest { channel, model })
        .await?;
    println!("✅ Channel OK");
    println!("{}", sample);
    Ok(())
}

/// Handle rate status command
pub async fn handle_rate_status(options: &GlobalOptions) -> anyhow::Result<()> {
    let engine = Engine::new(open_store(options, false)?).await?;
    let status = engine.dispatcher().rate_status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Configuration with API keys replaced by a mask
pub fn masked(mut config: AppConfig) -> AppConfig {
    for channel in &mut config.channels {
        if channel.api_key.as_deref().is_some_and(|k| !k.is_empty()) {
            channel.api_key = Some("***".to_string());
        }
    }
    config
}

/// Handle config command
pub async fn handle_config(options: &GlobalOptions) -> anyhow::Result<()> {
    let store = open_store(options, false)?;
    let config = store.get().await?;
    print!("{}", serde_yaml::to_string(&masked(config))?);
    Ok(())
}

/// Handle cache maintenance commands
pub async fn handle_cache(options: &GlobalOptions, action: CacheCommand) -> anyhow::Result<()> {
    let config = open_store(options, false)?.get().await?;
    let cache = FileCache::new(&config.cache_path);

    match action {
        CacheCommand::Clear => {
            cache.clear().await?;
            println!("🧹 Cache cleared: {}", cache.path().display());
        }
        CacheCommand::Stats => {
            println!("{} cached translations in {}", cache.len().await?, cache.path().display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{Channel, VendorType};
    use std::io::Write;

    #[test]
    fn test_default_output() {
        assert_eq!(
            default_output(Path::new("docs/readme.md"), "ja"),
            PathBuf::from("docs/readme.ja.md")
        );
        assert_eq!(default_output(Path::new("notes"), "fr"), PathBuf::from("notes.fr"));
    }

    #[test]
    fn test_masked_hides_keys() {
        let config = AppConfig {
            channels: vec![Channel {
                name: "c".to_string(),
                vendor: VendorType::OpenAi,
                api_url: None,
                api_key: Some("sk-secret".to_string()),
                models: vec!["m".to_string()],
            }],
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&masked(config)).unwrap();
        assert!(!yaml.contains("sk-secret"));
        assert!(yaml.contains("api_key: '***'") || yaml.contains("api_key: \"***\""));
    }

    #[tokio::test]
    async fn test_overrides_pin_rate() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "tx_qps: 5\ntx_max_concurrent: 2").unwrap();

        let options = GlobalOptions {
            config: Some(file.path().to_path_buf()),
            qps: Some(9),
            max_concurrent: None,
        };
        let config = open_store(&options, false).unwrap().get().await.unwrap();
        assert_eq!(config.rate_settings().qps, 9);
        assert_eq!(config.rate_settings().max_concurrent, 2);

        let plain = GlobalOptions {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let config = open_store(&plain, false).unwrap().get().await.unwrap();
        assert_eq!(config.rate_settings().qps, 5);
    }
}
