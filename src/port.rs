//! Free local TCP port allocation

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, TcpListener};
use tokio::net::TcpStream;

/// Host name instances are addressed by. Resolves to both loopback families.
pub const LOCAL_HOST: &str = "localhost";

/// Source of ports for new instances.
///
/// Allocation is best-effort: the port is free when returned, but another
/// process may grab it before the tool binds. That surfaces as a failed
/// instance, never as a supervisor error.
pub trait PortAllocator: Send + Sync {
    fn allocate(&self) -> io::Result<u16>;
}

/// Asks the OS for an ephemeral port on the loopback interface
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalPortAllocator;

impl PortAllocator for LocalPortAllocator {
    fn allocate(&self) -> io::Result<u16> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        let port = listener.local_addr()?.port();
        Ok(port)
    }
}

/// Connect to a tool on a local port, over IPv4 loopback or else IPv6.
///
/// The IPv4 error is reported when both fail.
pub async fn connect_local(port: u16) -> io::Result<TcpStream> {
    match TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
        Ok(stream) => Ok(stream),
        Err(e) => TcpStream::connect((Ipv6Addr::LOCALHOST, port))
            .await
            .map_err(|_| e),
    }
}
