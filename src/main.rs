use anyhow::{bail, Context, Result};
use dht_scraper::{DiscoveryTag, Engine, EngineConfig, NodeId};
use clap::Parser;
use log::info;
use std::time::Duration;

/// A Mainline DHT scraper and crawler.
///
/// With a positional info_hash, looks up peers for that torrent and exits.
/// Without one, crawls the DHT passively, reporting discovered info_hashes
/// and progress until --timeout elapses (or forever, if 0).
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// 40-character hex info_hash; scraper mode if given, crawler mode otherwise
    info_hash: Option<String>,

    #[clap(long, default_value_t = 6881)]
    port: u16,

    /// Scraper: lookup timeout in seconds. Crawler: run duration, 0 = infinite.
    #[clap(long, default_value_t = 20)]
    timeout: u64,

    /// Crawler active-query cadence, in seconds.
    #[clap(long, default_value_t = 3)]
    query_interval: u64,
}

fn parse_info_hash(s: &str) -> Result<NodeId> {
    if s.len() != 40 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        bail!("info_hash must be exactly 40 hex characters, got {:?}", s);
    }
    let mut buf = [0u8; 20];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hex = std::str::from_utf8(chunk).unwrap();
        buf[i] = u8::from_str_radix(hex, 16).with_context(|| format!("invalid hex byte {:?}", hex))?;
    }
    Ok(NodeId::from_bytes(buf))
}

/// Validates CLI arguments and parses them into the engine-facing types.
/// Kept separate from `run` so argument errors can exit(1) distinctly from
/// the runtime failures `run` surfaces as exit(2).
fn validate(cli: &Cli) -> Result<Option<NodeId>> {
    if cli.query_interval < 1 {
        bail!("--query-interval must be >= 1");
    }
    cli.info_hash.as_deref().map(parse_info_hash).transpose()
}

fn run(cli: Cli, info_hash: Option<NodeId>) -> Result<()> {
    let config = EngineConfig {
        port: cli.port,
        crawl_query_interval: cli.query_interval,
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(config).context("failed to start DHT engine")?;
    engine.bootstrap().context("bootstrap failed")?;

    match info_hash {
        Some(info_hash) => {
            info!("scraping for peers of {:?}", info_hash);
            let peers = engine.scrape_peers(info_hash, Duration::from_secs(cli.timeout));
            if peers.is_empty() {
                println!("no peers found");
            } else {
                for peer in peers {
                    println!("{}", peer);
                }
            }
        }
        None => {
            info!("crawling as node {:?}", engine.own_id());
            let duration = if cli.timeout == 0 {
                Duration::ZERO
            } else {
                Duration::from_secs(cli.timeout)
            };
            engine.crawl_network(
                duration,
                cli.query_interval,
                |event| {
                    let tag = match event.tag {
                        DiscoveryTag::GetPeers => "get_peers",
                        DiscoveryTag::Bep51 => "bep51",
                    };
                    println!("{:?} {} {}", event.info_hash, event.source, tag);
                },
                |stats| {
                    eprintln!(
                        "t={}s hashes={} nodes={} req/min={:.1} samples_tx={} samples_rx={}",
                        stats.elapsed_secs,
                        stats.unique_info_hashes,
                        stats.routing_table_size,
                        stats.discoveries_per_minute,
                        stats.bep51_samples_sent,
                        stats.bep51_samples_received,
                    );
                },
            );
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let info_hash = match validate(&cli) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli, info_hash) {
        eprintln!("error: {:#}", e);
        std::process::exit(2);
    }
}
