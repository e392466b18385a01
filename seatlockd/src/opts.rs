use clap::Parser;
use seatlock_api::NodeId;
use seatlockd::Parameters;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

#[derive(Parser, Debug, Clone)]
pub struct Opts {
    /// Our position in the `--peer` list, counted from 1
    #[clap(long = "id", env = "SEATLOCK_ID")]
    pub id: NodeId,

    /// Cluster member address, repeated in membership order
    #[clap(long = "peer", required = true, value_parser = resolve_peer)]
    pub peers: Vec<SocketAddr>,

    #[clap(long = "seats", default_value_t = Parameters::DEFAULT_SEATS)]
    pub seats: u32,

    #[clap(long = "ack-timeout-ms", default_value_t = millis(Parameters::DEFAULT_ACK_TIMEOUT))]
    pub ack_timeout_ms: u64,

    #[clap(long = "join-timeout-ms", default_value_t = millis(Parameters::DEFAULT_JOIN_TIMEOUT))]
    pub join_timeout_ms: u64,
}

impl Opts {
    pub fn from_args() -> Self {
        Opts::parse()
    }
}

fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Resolve `host:port` to the first address it names
fn resolve_peer(s: &str) -> io::Result<SocketAddr> {
    s.trim().to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{s} did not resolve to any address"),
        )
    })
}

#[test]
fn resolve_peer_test() {
    assert_eq!(
        resolve_peer("127.0.0.1:7001").unwrap(),
        "127.0.0.1:7001".parse::<SocketAddr>().unwrap()
    );
    assert_eq!(resolve_peer(" 127.0.0.1:7002 ").unwrap().port(), 7002);
    assert_eq!(resolve_peer("localhost:7003").unwrap().port(), 7003);
    assert!(resolve_peer("127.0.0.1").is_err());
    assert!(resolve_peer("127.0.0.1:notaport").is_err());
}

#[test]
fn opts_parse_test() {
    let opts = Opts::parse_from([
        "seatlockd",
        "--id",
        "2",
        "--peer",
        "127.0.0.1:7001",
        "--peer",
        "127.0.0.1:7002",
        "--seats",
        "3",
    ]);
    assert_eq!(opts.id, NodeId(2));
    assert_eq!(opts.peers.len(), 2);
    assert_eq!(opts.seats, 3);
    assert_eq!(opts.ack_timeout_ms, 5000);
    assert!(Opts::try_parse_from(["seatlockd", "--id", "1"]).is_err());
}
