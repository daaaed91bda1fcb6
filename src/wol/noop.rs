use crate::wol::Transport;
use log::info;
use std::io;
use std::net::SocketAddrV4;
use std::time::Duration;

/// Logs packets instead of putting them on the network.
pub struct LogOnlyTransport;

impl Transport for LogOnlyTransport {
    fn send_connected(
        &self,
        dest: SocketAddrV4,
        payload: &[u8],
        _: Duration,
    ) -> io::Result<usize> {
        info!("faking connected send of {} bytes to {}", payload.len(), dest);
        Ok(payload.len())
    }
    fn send_unconnected(
        &self,
        dest: SocketAddrV4,
        payload: &[u8],
        _: Duration,
    ) -> io::Result<usize> {
        info!("faking unconnected send of {} bytes to {}", payload.len(), dest);
        Ok(payload.len())
    }
}
