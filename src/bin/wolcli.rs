use wolhub::wol;

use clap::Parser;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

/// Send a single Wake-on-LAN magic packet.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target MAC address, in xx:xx:xx:xx:xx:xx or xx-xx-xx-xx-xx-xx form.
    mac: String,

    /// Broadcast address to retry on when the connected broadcast fails.
    #[arg(long, env = "WOL_FALLBACK_ADDR", default_value = "255.255.255.255")]
    fallback_broadcast_addr: Ipv4Addr,

    /// Time budget for the packet, both attempts included.
    #[arg(
        long,
        env = "WOL_SEND_TIMEOUT_MS",
        default_value_t = 500,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    send_timeout_ms: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("WARN"))
        .init();

    let sender = wol::Sender::new(
        Box::new(wol::UdpTransport),
        wol::SendConfig {
            fallback_addr: SocketAddrV4::new(args.fallback_broadcast_addr, wol::WOL_PORT),
            timeout: Duration::from_millis(args.send_timeout_ms),
            ..Default::default()
        },
    );
    let (mac, delivery) = sender.wake(&args.mac)?;
    println!("Magic packet sent to {} ({:?} path)", mac, delivery);
    Ok(())
}
