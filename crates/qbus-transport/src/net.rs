use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::error::{Result, TransportError};

/// Resolve `host:port` to the first usable socket address.
pub fn resolve(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(ErrorKind::NotFound, "address resolved to nothing"))
}

/// Bind a non-blocking listening socket on `host:port`.
///
/// `SO_REUSEADDR` is set so a restarted provider can rebind immediately.
pub fn bind_listener(host: &str, port: u16) -> Result<TcpListener> {
    let addr = format!("{host}:{port}");
    let wrap = |source| TransportError::Bind {
        addr: addr.clone(),
        source,
    };

    let sockaddr = resolve(host, port).map_err(wrap)?;
    let socket = Socket::new(Domain::for_address(sockaddr), Type::STREAM, Some(Protocol::TCP))
        .map_err(wrap)?;
    socket.set_reuse_address(true).map_err(wrap)?;
    socket.bind(&sockaddr.into()).map_err(wrap)?;
    socket.listen(128).map_err(wrap)?;
    socket.set_nonblocking(true).map_err(wrap)?;

    let listener: TcpListener = socket.into();
    debug!(%addr, "listening");
    Ok(listener)
}

/// Start a non-blocking outbound connection to `host:port`.
///
/// A connect still in progress is not a failure: the returned stream
/// becomes writable (or reports `SO_ERROR`) once the attempt resolves.
/// Only an immediately failing connect returns an error.
pub fn connect_nonblocking(host: &str, port: u16) -> Result<TcpStream> {
    let addr = format!("{host}:{port}");
    let wrap = |source| TransportError::Connect {
        addr: addr.clone(),
        source,
    };

    let sockaddr = resolve(host, port).map_err(wrap)?;
    let socket = Socket::new(Domain::for_address(sockaddr), Type::STREAM, Some(Protocol::TCP))
        .map_err(wrap)?;
    socket.set_nonblocking(true).map_err(wrap)?;

    match socket.connect(&sockaddr.into()) {
        Ok(()) => {}
        Err(err) if connect_in_progress(&err) => {
            debug!(%addr, "connect in progress");
        }
        Err(err) => return Err(wrap(err)),
    }

    Ok(socket.into())
}

/// Whether a connect error just means "still in progress".
fn connect_in_progress(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == Some(libc::EINPROGRESS)
        || err.raw_os_error() == Some(libc::EALREADY)
}

/// Resolve the outcome of a non-blocking connect once the socket reports
/// writability: `Ok` means established, `Err` carries `SO_ERROR`.
pub fn finish_connect(stream: &TcpStream) -> std::io::Result<()> {
    match stream.take_error()? {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_on_ephemeral_port() {
        let listener = bind_listener("127.0.0.1", 0).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_ne!(port, 0);
    }

    #[test]
    fn bind_conflict_reports_addr() {
        let listener = bind_listener("127.0.0.1", 0).unwrap();
        let port = listener.local_addr().unwrap().port();

        // Second plain bind (without SO_REUSEADDR) on the same port fails.
        let err = TcpListener::bind(("127.0.0.1", port)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddrInUse);
    }

    #[test]
    fn nonblocking_connect_reaches_listener() {
        let listener = bind_listener("127.0.0.1", 0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = connect_nonblocking("127.0.0.1", port).unwrap();

        // Loopback connects resolve almost immediately; poll until the
        // listener sees it.
        let accepted = loop {
            match listener.accept() {
                Ok((stream, _)) => break stream,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(err) => panic!("accept failed: {err}"),
            }
        };

        drop(accepted);
        drop(stream);
    }

    #[test]
    fn resolve_rejects_garbage_host() {
        assert!(resolve("definitely-not-a-host.invalid.", 1).is_err());
    }
}
