//! Secondary cell daemon.
//!
//! Listens for a primary cell, completes the handshake and answers every
//! request until the link closes, then waits for the next primary.
//!
//! # Usage
//!
//! ```sh
//! cellsync-peer --listen 0.0.0.0:7410 --config cell.toml
//! ```

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use cellsync::coordinator::{AcceptRequests, Coordinator};
use cellsync::link::TcpAcceptor;
use cellsync::net::Endpoint;
use cellsync::{CellConfig, CellError, CellRole};

/// Default listen address.
const DEFAULT_LISTEN: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 7410);

/// How long one accept call blocks.
const ACCEPT_POLL: Duration = Duration::from_millis(500);

struct Args {
    listen: SocketAddr,
    config: Option<PathBuf>,
}

fn main() {
    cellsync::init_tracing();
    if let Err(e) = run() {
        eprintln!("cellsync-peer: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CellError> {
    let args: Vec<String> = std::env::args().collect();
    let args = parse_args(&args)?;

    let mut config = match &args.config {
        Some(path) => CellConfig::load(path)?,
        None => CellConfig::default(),
    };
    config.link.role = CellRole::Secondary;

    let mut acceptor = TcpAcceptor::bind(Endpoint::from(args.listen)).map_err(transport)?;
    let local = acceptor.local_addr().map_err(transport)?;
    eprintln!("cellsync-peer: listening on {local}");

    loop {
        let Some(link) = acceptor.accept(ACCEPT_POLL).map_err(transport)? else {
            continue;
        };
        eprintln!("cellsync-peer: primary connected");

        let mut coordinator = Coordinator::new(link, AcceptRequests, config.clone());
        match coordinator.serve() {
            Ok(()) => eprintln!("cellsync-peer: link closed"),
            Err(CellError::Cancelled) => return Ok(()),
            Err(e) => eprintln!("cellsync-peer: session ended: {e}"),
        }
    }
}

fn transport(e: io::Error) -> CellError {
    CellError::Transport(e.into())
}

fn invalid(message: impl Into<String>) -> CellError {
    transport(io::Error::new(io::ErrorKind::InvalidInput, message.into()))
}

fn parse_args(args: &[String]) -> Result<Args, CellError> {
    let mut listen = DEFAULT_LISTEN;
    let mut config = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--listen" | "-l" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| invalid("missing value for --listen"))?;
                listen = value
                    .parse()
                    .map_err(|e| invalid(format!("bad --listen address {value}: {e}")))?;
            }
            "--config" | "-c" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| invalid("missing value for --config"))?;
                config = Some(PathBuf::from(value));
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(invalid(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    Ok(Args { listen, config })
}

fn print_usage() {
    eprintln!(
        "Usage: cellsync-peer [OPTIONS]

Options:
  -l, --listen <ADDR>   Address to accept the primary on [default: {DEFAULT_LISTEN}]
  -c, --config <PATH>   Cell configuration (TOML)
  -h, --help            Print help"
    );
}
