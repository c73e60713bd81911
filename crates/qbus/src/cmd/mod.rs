use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod methods;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a bus module that listens for peers.
    Serve(ServeArgs),
    /// Call a remote module's method and print the response.
    Call(CallArgs),
    /// List a remote module's registered methods.
    Methods(MethodsArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::Call(args) => call::run(args, format),
        Command::Methods(args) => methods::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Module name this bus registers under.
    pub module: String,
    /// Host to bind.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    /// Port to bind (0 picks an ephemeral port).
    #[arg(long, default_value = "9201")]
    pub port: u16,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Peer address, host:port.
    pub addr: String,
    /// Target module name.
    pub module: String,
    /// Target method name.
    pub method: String,
    /// Public payload as JSON.
    #[arg(long)]
    pub json: Option<String>,
    /// Routing/trust context as JSON.
    #[arg(long)]
    pub rinfo: Option<String>,
    /// Maximum time to wait for the response (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct MethodsArgs {
    /// Peer address, host:port.
    pub addr: String,
    /// Module to list.
    pub module: String,
    /// Maximum time to wait for the listing (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Split `host:port`.
pub fn parse_addr(addr: &str) -> CliResult<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| CliError::new(USAGE, format!("address `{addr}` is not host:port")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid port in `{addr}`")))?;
    Ok((host.to_string(), port))
}

/// Parse `5s` / `500ms` style durations.
pub fn parse_duration(text: &str) -> CliResult<Duration> {
    let invalid = || CliError::new(USAGE, format!("invalid duration `{text}`"));
    if let Some(value) = text.strip_suffix("ms") {
        let millis: u64 = value.parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(millis));
    }
    if let Some(value) = text.strip_suffix('s') {
        let secs: u64 = value.parse().map_err(|_| invalid())?;
        return Ok(Duration::from_secs(secs));
    }
    Err(invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let (host, port) = parse_addr("127.0.0.1:9201").unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 9201);
    }

    #[test]
    fn rejects_bare_host() {
        let err = parse_addr("localhost").unwrap_err();
        assert_eq!(err.code, USAGE);
    }

    #[test]
    fn parses_seconds_and_millis() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn rejects_unitless_duration() {
        assert_eq!(parse_duration("5").unwrap_err().code, USAGE);
    }
}
