use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use dns_resolver::cache::{prune_cache_task, SharedCache};
use dns_resolver::recursive::Resolver;
use dns_resolver::upstream::UdpUpstream;

use resolved::server::Server;
use resolved::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Plain,
    Json,
}

fn begin_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Plain => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser)]
/// A recursive DNS resolver and caching nameserver.
///
/// Questions are answered from the cache if possible, and otherwise
/// by following referrals down from a root nameserver.  Answers are
/// cached until their TTL expires, and the cache is saved to disk on
/// shutdown.
///
/// Only A, NS, PTR, and AAAA records are supported, and only over
/// UDP.
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "RESOLVED_CONFIG", default_value = "resolved.json")]
    config: PathBuf,

    /// Format of the log output
    #[arg(long, value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    begin_logging(args.log_format);

    let settings = Settings::new(&args.config)
        .with_context(|| format!("could not read settings from {}", args.config.display()))?;

    let cache = SharedCache::load(&settings.cache_filepath)
        .await
        .with_context(|| {
            format!(
                "could not load cache from {}",
                settings.cache_filepath.display()
            )
        })?;
    tracing::info!(entries = %cache.len(), "loaded cache");

    let resolver = Resolver::new(
        UdpUpstream::new(settings.request_size),
        settings.root_server_ip,
        settings.root_server_port,
    );

    let server = Server::bind(&settings, resolver, cache.clone())
        .await
        .with_context(|| {
            format!(
                "could not bind to {}:{}",
                settings.server_ip, settings.server_port
            )
        })?;
    tracing::info!(address = %server.local_addr()?, "listening");

    let pruner = tokio::spawn(prune_cache_task(cache.clone(), settings.clean_interval()));

    server
        .run(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(?error, "could not listen for interrupt");
            }
        })
        .await;

    pruner.abort();

    cache
        .save(&settings.cache_filepath)
        .await
        .with_context(|| {
            format!(
                "could not save cache to {}",
                settings.cache_filepath.display()
            )
        })?;
    tracing::info!(entries = %cache.len(), "saved cache");

    Ok(())
}
