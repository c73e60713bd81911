use std::sync::mpsc::channel;
use std::time::Instant;

use qbus_router::{Bus, Message};

use crate::cmd::{parse_addr, parse_duration, CallArgs};
use crate::exit::{router_error, CliError, CliResult, DATA_INVALID, FAILURE, SUCCESS, TIMEOUT};
use crate::output::{print_envelope, OutputFormat};

const CLI_MODULE: &str = "CLI";

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let (host, port) = parse_addr(&args.addr)?;
    let timeout = parse_duration(&args.timeout)?;

    let mut msg = Message::new();
    if let Some(json) = &args.json {
        let value = serde_json::from_str(json)
            .map_err(|err| CliError::new(DATA_INVALID, format!("invalid --json payload: {err}")))?;
        msg.set_cdata(value);
    }
    if let Some(rinfo) = &args.rinfo {
        let value = serde_json::from_str(rinfo)
            .map_err(|err| CliError::new(DATA_INVALID, format!("invalid --rinfo payload: {err}")))?;
        msg.set_rinfo(value);
    }

    let bus = Bus::new(CLI_MODULE).map_err(|err| router_error("bus start failed", err))?;
    bus.connect_with(&host, port, false)
        .map_err(|err| router_error("connect failed", err))?;
    wait_for_route(&bus, &args.module, timeout)?;

    let (tx, rx) = channel();
    bus.send(&args.module, &args.method, msg, move |_bus, reply| {
        let _ = tx.send(reply);
    })
    .map_err(|err| router_error("call failed", err))?;

    let reply = rx
        .recv_timeout(timeout)
        .map_err(|_| CliError::new(TIMEOUT, format!("no response within {}", args.timeout)))?;

    print_envelope(&reply, format);
    let code = if reply.is_err() { FAILURE } else { SUCCESS };
    bus.shutdown();
    Ok(code)
}

/// Route exchange happens right after connect; poll until the target
/// module becomes resolvable or the deadline passes.
pub fn wait_for_route(
    bus: &Bus,
    module: &str,
    timeout: std::time::Duration,
) -> CliResult<()> {
    let key = module.to_uppercase();
    let deadline = Instant::now() + timeout;
    while !bus.known_modules().contains(&key) {
        if Instant::now() >= deadline {
            return Err(CliError::new(
                FAILURE,
                format!("module `{module}` not reachable through this peer"),
            ));
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    Ok(())
}
