use std::sync::mpsc::channel;

use qbus_router::Bus;

use crate::cmd::call::wait_for_route;
use crate::cmd::{parse_addr, parse_duration, MethodsArgs};
use crate::exit::{router_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_methods, OutputFormat};

const CLI_MODULE: &str = "CLI";

pub fn run(args: MethodsArgs, format: OutputFormat) -> CliResult<i32> {
    let (host, port) = parse_addr(&args.addr)?;
    let timeout = parse_duration(&args.timeout)?;

    let bus = Bus::new(CLI_MODULE).map_err(|err| router_error("bus start failed", err))?;
    bus.connect_with(&host, port, false)
        .map_err(|err| router_error("connect failed", err))?;
    wait_for_route(&bus, &args.module, timeout)?;

    let (tx, rx) = channel();
    bus.methods(&args.module, move |_bus, names| {
        let _ = tx.send(names);
    })
    .map_err(|err| router_error("listing failed", err))?;

    let names = rx
        .recv_timeout(timeout)
        .map_err(|_| CliError::new(TIMEOUT, format!("no listing within {}", args.timeout)))?;

    print_methods(&args.module, &names, format);
    bus.shutdown();
    Ok(SUCCESS)
}
