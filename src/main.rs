use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use stubresolv::config::{ResolverSettings, load_settings};
use stubresolv::{ResolveOptions, Resolver, watcher};

#[derive(Parser, Debug)]
#[command(author, version, about = "Caching stub DNS resolver", long_about = None)]
struct Args {
    /// 设置文件路径（JSON），缺省使用内置默认值
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,
    /// resolv.conf 路径，覆盖设置文件中的值
    #[arg(long = "resolv-conf", global = true)]
    resolv_conf: Option<PathBuf>,
    /// 上游 nameserver（`ip` 或 `ip:port`），可重复
    #[arg(short = 's', long = "server", global = true)]
    servers: Vec<String>,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve one name and print the answering records.
    Resolve {
        name: String,
        #[arg(short = 't', long = "type", default_value = "A")]
        rtype: String,
        #[arg(long = "class", default_value = "IN")]
        class: String,
        /// Query over TCP only.
        #[arg(long = "tcp", default_value_t = false)]
        tcp: bool,
    },
    /// Print the apex of the zone holding an absolute name (trailing dot).
    Zone {
        name: String,
        #[arg(long = "class", default_value = "IN")]
        class: String,
    },
    /// Resolve names read from stdin, one per line.
    Batch {
        #[arg(short = 't', long = "type", default_value = "A")]
        rtype: String,
        /// 并发 worker 数量（默认 CPU 核心数）
        #[arg(long = "workers", default_value_t = 0)]
        workers: usize,
        /// Reload resolv.conf when it changes.
        #[arg(long = "watch", default_value_t = false)]
        watch: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let mut settings = match &args.config {
        Some(path) => load_settings(path).context("load settings")?,
        None => ResolverSettings::default(),
    };
    if let Some(path) = &args.resolv_conf {
        settings.resolv_conf = path.clone();
    }
    if !args.servers.is_empty() {
        settings.nameservers = args.servers.clone();
    }
    let resolver = Resolver::from_settings(&settings).context("build resolver")?;

    match args.command {
        Command::Resolve {
            name,
            rtype,
            class,
            tcp,
        } => {
            let name = parse_name(&name)?;
            let rtype = RecordType::from_str(&rtype.to_ascii_uppercase())
                .with_context(|| format!("unknown record type: {rtype}"))?;
            let rclass = parse_class(&class)?;
            let options = ResolveOptions {
                tcp: tcp.then_some(true),
                ..ResolveOptions::default()
            };
            let answer = resolver.resolve_with(&name, rtype, rclass, &options).await?;
            for record in answer.records() {
                println!("{record}");
            }
        }
        Command::Zone { name, class } => {
            let name = parse_name(&name)?;
            let zone = resolver.zone_for_name(&name, parse_class(&class)?).await?;
            println!("{zone}");
        }
        Command::Batch {
            rtype,
            workers,
            watch,
        } => {
            let rtype = RecordType::from_str(&rtype.to_ascii_uppercase())
                .with_context(|| format!("unknown record type: {rtype}"))?;
            if watch {
                if settings.nameservers.is_empty() {
                    watcher::spawn(settings.resolv_conf.clone(), settings.port, resolver.config_handle());
                } else {
                    warn!(target = "watcher", "nameservers given explicitly, not watching resolv.conf");
                }
            }
            // worker 数量：默认为 CPU 核心数，最少 1 个
            let workers = if workers > 0 { workers } else { num_cpus::get() };

            tokio::select! {
                _ = run_batch(resolver.clone(), rtype, workers) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                }
            }
            info!(target = "resolver", stats = %resolver.metrics_snapshot(), "batch finished");
        }
    }
    Ok(())
}

async fn run_batch(resolver: Resolver, rtype: RecordType, workers: usize) {
    let lines = Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines()));
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let resolver = resolver.clone();
        let lines = Arc::clone(&lines);
        handles.push(tokio::spawn(async move {
            loop {
                let line = match lines.lock().await.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "stdin read failed");
                        break;
                    }
                };
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let name = match Name::from_str(line) {
                    Ok(name) => name,
                    Err(err) => {
                        eprintln!("{line}: {err}");
                        continue;
                    }
                };
                match resolver.resolve(&name, rtype, DNSClass::IN).await {
                    Ok(answer) => {
                        for record in answer.records() {
                            println!("{record}");
                        }
                    }
                    Err(err) => eprintln!("{line}: {err}"),
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

fn parse_name(value: &str) -> anyhow::Result<Name> {
    Name::from_str(value).with_context(|| format!("invalid name: {value}"))
}

fn parse_class(value: &str) -> anyhow::Result<DNSClass> {
    DNSClass::from_str(&value.to_ascii_uppercase()).with_context(|| format!("unknown class: {value}"))
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(debug);

    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
