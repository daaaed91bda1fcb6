use wolhub::registry;
use wolhub::server;
use wolhub::wol;

use clap::Parser;
use log::info;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "APP_ADDR", default_value = "0.0.0.0")]
    http_addr: IpAddr,

    /// Port to listen on
    #[arg(long, env = "APP_PORT", default_value_t = 8090)]
    port: u16,

    /// JSON file holding the registered devices. Created on first change.
    #[arg(long, env = "WOLHUB_DB", default_value = "./devices.json")]
    db_path: PathBuf,

    /// Broadcast address to retry on when the connected broadcast fails,
    /// e.g. 192.168.1.255 for a host without a default route.
    #[arg(long, env = "WOL_FALLBACK_ADDR", default_value = "255.255.255.255")]
    fallback_broadcast_addr: Ipv4Addr,

    /// Time budget for one magic packet, both attempts included.
    #[arg(
        long,
        env = "WOL_SEND_TIMEOUT_MS",
        default_value_t = 500,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    send_timeout_ms: u64,

    /// If true, log magic packets instead of putting them on the network.
    #[arg(long)]
    use_fake_wol: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("INFO"))
        .format_timestamp(Some(env_logger::fmt::TimestampPrecision::Millis))
        .init();

    let registry = registry::Registry::open(Some(args.db_path))?;

    let transport: Box<dyn wol::Transport> = if args.use_fake_wol {
        info!("Using fake WoL transport, no packets will be sent");
        Box::new(wol::noop::LogOnlyTransport)
    } else {
        Box::new(wol::UdpTransport)
    };
    let config = wol::SendConfig {
        fallback_addr: SocketAddrV4::new(args.fallback_broadcast_addr, wol::WOL_PORT),
        timeout: Duration::from_millis(args.send_timeout_ms),
        ..Default::default()
    };

    let app = server::router(server::AppState {
        registry: Arc::new(registry),
        sender: Arc::new(wol::Sender::new(transport, config)),
    });

    let addr = SocketAddr::new(args.http_addr, args.port);
    info!("Starting server on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
