use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use qbus_router::{Bus, Message, Responder};
use serde_json::{json, Value};
use tracing::info;

use crate::cmd::ServeArgs;
use crate::exit::{router_error, CliError, CliResult, INTERNAL, SUCCESS};

pub fn run(args: ServeArgs) -> CliResult<i32> {
    let bus = Bus::new(&args.module).map_err(|err| router_error("bus start failed", err))?;

    // Baseline methods every served module answers.
    bus.register("echo", |bus: &Bus, mut msg: Message, responder: Responder| {
        let data = msg.take_cdata().unwrap_or(Value::Null);
        responder.respond(bus, Message::new().with_cdata(data));
    });
    bus.register("ping", |bus: &Bus, _msg: Message, responder: Responder| {
        responder.respond(
            bus,
            Message::new().with_cdata(json!({"pong": true, "module": bus.module()})),
        );
    });

    let port = bus
        .listen(&args.host, args.port)
        .map_err(|err| router_error("listen failed", err))?;
    info!(module = %args.module, host = %args.host, port, "serving");
    println!("{} listening on {}:{port}", args.module, args.host);

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    bus.shutdown();
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
