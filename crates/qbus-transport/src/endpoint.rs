use std::sync::atomic::{AtomicBool, Ordering};

/// A peer's persistent identity and reconnect policy, independent of any
/// one live socket.
///
/// The endpoint outlives its connection: when a socket is lost the
/// endpoint stays behind (and, if `reconnect` is set, joins the provider's
/// reconnect queue) so the link can be re-established later. Endpoints
/// hold no reference back to the provider.
#[derive(Debug)]
pub struct Endpoint {
    host: String,
    port: u16,
    reconnect: bool,
    enabled: AtomicBool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, reconnect: bool) -> Self {
        Self {
            host: host.into(),
            port,
            reconnect,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` display form.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether a lost connection to this endpoint should be re-dialed.
    pub fn wants_reconnect(&self) -> bool {
        self.reconnect
    }

    /// Cleared once during provider shutdown; a disabled endpoint is never
    /// queued for reconnect again.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_formats_host_and_port() {
        let endpoint = Endpoint::new("10.0.0.7", 9201, true);
        assert_eq!(endpoint.addr(), "10.0.0.7:9201");
        assert!(endpoint.wants_reconnect());
    }

    #[test]
    fn disable_is_terminal() {
        let endpoint = Endpoint::new("localhost", 1, false);
        assert!(endpoint.is_enabled());
        endpoint.disable();
        assert!(!endpoint.is_enabled());
    }
}
