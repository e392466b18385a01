#![deny(clippy::as_conversions)]
use opts::Opts;
use seatlockd::{Node, Parameters};
use std::io;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod opts;

fn main() -> anyhow::Result<()> {
    init_logging();

    let opts = Opts::from_args();

    let params = Parameters::builder()
        .id(opts.id)
        .peers(opts.peers.clone())
        .seats(opts.seats)
        .ack_timeout(Duration::from_millis(opts.ack_timeout_ms))
        .join_timeout(Duration::from_millis(opts.join_timeout_ms))
        .build();

    let node = Node::new(params)?;

    node.get_ctrl().install_signal_handler()?;

    node.wait();

    Ok(())
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(atty::is(atty::Stream::Stderr))
                .with_writer(io::stderr),
        )
        .init();
}
