#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(unreachable_pub)]
#![deny(clippy::correctness)]
#![deny(clippy::suspicious)]
#![deny(clippy::style)]
#![deny(clippy::complexity)]
#![deny(clippy::perf)]
#![deny(clippy::pedantic)]
#![deny(clippy::std_instead_of_core)]

use anyhow::Context;
use stream_tcp_lib::StreamConfig;
use stream_tcp_lib::replay::{PacketSource, PcapFile};
use stream_tcp_lib::stream::{StreamChunk, TracingSink};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,stream_tcp_lib=debug"));
    let fmt_layer = tracing_subscriber::fmt::layer();

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();
}

fn load_config(path: Option<String>) -> anyhow::Result<StreamConfig> {
    let Some(path) = path else {
        return Ok(StreamConfig::default());
    };
    let raw = std::fs::read_to_string(&path).with_context(|| format!("Failed to read {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid stream config in {path}"))
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let capture = args
        .next()
        .context("usage: stream-replay <capture.pcap> [config.json]")?;
    let config = load_config(args.next())?;
    info!(policy = %config.policy, capture = %capture, "Starting replay");

    let mut inspector = |chunk: &StreamChunk<'_>| {
        debug!(
            flow = %chunk.flow,
            direction = %chunk.direction,
            start = %chunk.start,
            len = chunk.bytes.len(),
            "Reassembled data"
        );
    };
    let stats = PcapFile::new(capture).replay(config, &TracingSink, &mut inspector)?;
    info!(stats = %serde_json::to_string(&stats)?, "Done");
    Ok(())
}
