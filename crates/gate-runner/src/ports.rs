use std::io;
use std::net::{Ipv4Addr, TcpListener};

// Nothing is reserved: another process may grab the port before the caller binds it.
pub fn pick_free_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

pub fn pick_port_pair() -> io::Result<(u16, u16)> {
    let http = pick_free_port()?;
    for _ in 0..16 {
        let grpc = pick_free_port()?;
        if grpc != http {
            return Ok((http, grpc));
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "could not allocate two distinct loopback ports",
    ))
}
