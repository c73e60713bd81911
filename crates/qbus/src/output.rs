use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use qbus_router::Message;
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct EnvelopeOutput<'a> {
    sender: &'a str,
    chain_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cdata: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    err_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    err_text: Option<&'a str>,
}

pub fn print_envelope(msg: &Message, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = EnvelopeOutput {
                sender: &msg.sender,
                chain_key: &msg.chain_key,
                cdata: msg.cdata(),
                err_code: msg.err().map(|err| err.code),
                err_text: msg.err().map(|err| err.text.as_str()),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SENDER", "CHAIN", "RESULT"])
                .add_row(vec![
                    msg.sender.clone(),
                    msg.chain_key.clone(),
                    result_cell(msg),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "sender={} chain_key={} {}",
                msg.sender,
                msg.chain_key,
                result_cell(msg)
            );
        }
    }
}

pub fn print_methods(module: &str, names: &[String], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({"module": module, "methods": names})
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["MODULE", "METHOD"]);
            for name in names {
                table.add_row(vec![module.to_string(), name.clone()]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for name in names {
                println!("{module}.{name}");
            }
        }
    }
}

fn result_cell(msg: &Message) -> String {
    if let Some(err) = msg.err() {
        return format!("error {err}");
    }
    match msg.cdata() {
        Some(value) => value.to_string(),
        None => "(empty)".to_string(),
    }
}
