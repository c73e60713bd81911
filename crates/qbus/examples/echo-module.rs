//! Minimal bus module: listens on an ephemeral port and answers `echo`.
//!
//! Run with `cargo run --example echo-module`, then from another shell:
//! `qbus call 127.0.0.1:<port> ECHO echo --json '{"hello":"world"}'`

use qbus::router::{Bus, Message, Responder};
use serde_json::Value;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let bus = Bus::new("ECHO")?;

    bus.register("echo", |bus: &Bus, mut msg: Message, responder: Responder| {
        let data = msg.take_cdata().unwrap_or(Value::Null);
        responder.respond(bus, Message::new().with_cdata(data));
    });

    let port = bus.listen("127.0.0.1", 0)?;
    println!("ECHO listening on 127.0.0.1:{port}");

    loop {
        std::thread::sleep(std::time::Duration::from_secs(1));
    }
}
