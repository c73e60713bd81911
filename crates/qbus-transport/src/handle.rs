use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use qbus_frame::FrameDecoder;

use crate::endpoint::Endpoint;

/// Identifies one live connection (or listener) within a provider.
pub type ConnectionId = u64;

/// Lifecycle role of a socket handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Shutdown teardown marker; terminal, never reconnected.
    Disabled,
    /// Listening socket accepting inbound peers.
    Listen,
    /// Outbound connect still in progress.
    Connect,
    /// Established outbound connection.
    Client,
    /// Accepted inbound connection.
    Remote,
}

impl HandleKind {
    /// Whether losing a handle of this kind may schedule a reconnect.
    /// Only a previously live connection qualifies; a disabled teardown
    /// handle never does.
    pub fn allows_reconnect(self) -> bool {
        !matches!(self, HandleKind::Disabled)
    }
}

pub(crate) enum HandleSocket {
    Listener(TcpListener),
    Stream(TcpStream),
}

/// A live OS socket plus its in-progress frame decode state.
pub(crate) struct Handle {
    pub id: ConnectionId,
    pub kind: HandleKind,
    pub socket: HandleSocket,
    pub decoder: FrameDecoder,
    pub endpoint: Arc<Endpoint>,
}

impl Handle {
    pub fn new(
        id: ConnectionId,
        kind: HandleKind,
        socket: HandleSocket,
        endpoint: Arc<Endpoint>,
    ) -> Self {
        Self {
            id,
            kind,
            socket,
            decoder: FrameDecoder::new(),
            endpoint,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        match &self.socket {
            HandleSocket::Listener(listener) => listener.as_raw_fd(),
            HandleSocket::Stream(stream) => stream.as_raw_fd(),
        }
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        match &self.socket {
            HandleSocket::Stream(stream) => Some(stream),
            HandleSocket::Listener(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_disabled_blocks_reconnect() {
        assert!(!HandleKind::Disabled.allows_reconnect());
        assert!(HandleKind::Listen.allows_reconnect());
        assert!(HandleKind::Connect.allows_reconnect());
        assert!(HandleKind::Client.allows_reconnect());
        assert!(HandleKind::Remote.allows_reconnect());
    }
}
