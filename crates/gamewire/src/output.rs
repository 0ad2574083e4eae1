use std::io::{IsTerminal, Write};
use std::time::Duration;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use gamewire_session::{SessionConfig, SessionSnapshot};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
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

/// An answered (or sent) call, as reported by `gamewire call`.
pub struct CallOutcome<'a> {
    pub endpoint: &'a str,
    pub session_id: &'a str,
    pub service_id: u16,
    pub method_id: u16,
    /// `None` for one-way sends.
    pub response: Option<&'a [u8]>,
    pub elapsed: Duration,
}

#[derive(Serialize)]
struct CallOutput<'a> {
    schema_id: &'a str,
    endpoint: &'a str,
    session_id: &'a str,
    service_id: u16,
    method_id: u16,
    one_way: bool,
    response_size: usize,
    response: Option<String>,
    elapsed_ms: u64,
}

pub fn print_call(outcome: &CallOutcome<'_>, format: OutputFormat) {
    let response = outcome.response.map(payload_preview);
    let size = outcome.response.map_or(0, <[u8]>::len);
    let elapsed_ms = outcome.elapsed.as_millis() as u64;
    match format {
        OutputFormat::Json => {
            let out = CallOutput {
                schema_id: "gamewire.cli.v1.call-result",
                endpoint: outcome.endpoint,
                session_id: outcome.session_id,
                service_id: outcome.service_id,
                method_id: outcome.method_id,
                one_way: outcome.response.is_none(),
                response_size: size,
                response,
                elapsed_ms,
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["METHOD", "SESSION", "SIZE", "ELAPSED", "RESPONSE"])
                .add_row(vec![
                    format!("{}:{}", outcome.service_id, outcome.method_id),
                    outcome.session_id.to_string(),
                    size.to_string(),
                    format!("{elapsed_ms}ms"),
                    response.unwrap_or_else(|| "<one-way>".to_string()),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "method={}:{} session={} size={} elapsed={}ms response={}",
                outcome.service_id,
                outcome.method_id,
                outcome.session_id,
                size,
                elapsed_ms,
                response.unwrap_or_else(|| "<one-way>".to_string())
            );
        }
        OutputFormat::Raw => {
            if let Some(data) = outcome.response {
                print_raw(data);
            }
        }
    }
}

#[derive(Serialize)]
struct ListeningOutput<'a> {
    schema_id: &'a str,
    endpoint: String,
    loop_threads: usize,
    methods: Vec<String>,
}

pub fn print_listening(
    endpoint: &str,
    config: &SessionConfig,
    methods: &[(u16, u16)],
    format: OutputFormat,
) {
    let methods: Vec<String> = methods
        .iter()
        .map(|(service, method)| format!("{service}:{method}"))
        .collect();
    match format {
        OutputFormat::Json => print_json(&ListeningOutput {
            schema_id: "gamewire.cli.v1.listening",
            endpoint: endpoint.to_string(),
            loop_threads: config.loop_threads,
            methods,
        }),
        _ => println!(
            "listening on {endpoint} (loops={}, methods={})",
            config.loop_threads,
            methods.join(",")
        ),
    }
    let _ = std::io::stdout().flush();
}

#[derive(Serialize)]
struct SessionOutput<'a> {
    session_id: &'a str,
    identity: &'a str,
    role: &'a str,
    state: &'a str,
    peer: &'a str,
    received: u64,
    peer_acked: u64,
    unacked: usize,
    pending_calls: usize,
}

pub fn print_sessions(sessions: &[SessionSnapshot], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let rows: Vec<SessionOutput<'_>> = sessions
                .iter()
                .map(|snapshot| SessionOutput {
                    session_id: &snapshot.info.session_id,
                    identity: &snapshot.info.identity,
                    role: snapshot.info.role.name(),
                    state: snapshot.state.name(),
                    peer: &snapshot.info.peer,
                    received: snapshot.received,
                    peer_acked: snapshot.peer_acked,
                    unacked: snapshot.unacked,
                    pending_calls: snapshot.pending_calls,
                })
                .collect();
            print_json(&serde_json::json!({
                "schema_id": "gamewire.cli.v1.sessions",
                "sessions": rows,
            }));
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    "SESSION", "IDENTITY", "STATE", "PEER", "RECEIVED", "UNACKED", "PENDING",
                ]);
            for snapshot in sessions {
                table.add_row(vec![
                    snapshot.info.session_id.clone(),
                    snapshot.info.identity.clone(),
                    snapshot.state.name().to_string(),
                    snapshot.info.peer.clone(),
                    snapshot.received.to_string(),
                    snapshot.unacked.to_string(),
                    snapshot.pending_calls.to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            for snapshot in sessions {
                println!(
                    "session={} identity={} state={} peer={} received={} unacked={} pending={}",
                    snapshot.info.session_id,
                    snapshot.info.identity,
                    snapshot.state.name(),
                    snapshot.info.peer,
                    snapshot.received,
                    snapshot.unacked,
                    snapshot.pending_calls
                );
            }
        }
    }
}

pub fn print_config(config: &SessionConfig, format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => {
            println!(
                "{}",
                serde_json::to_string_pretty(config).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            let value = serde_json::to_value(config).unwrap_or_default();
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["KEY", "VALUE"]);
            if let serde_json::Value::Object(fields) = value {
                for (key, value) in fields {
                    table.add_row(vec![key, value.to_string()]);
                }
            }
            println!("{table}");
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_payloads_are_summarised() {
        assert_eq!(payload_preview(b"pong"), "pong");
        assert_eq!(payload_preview(&[0xff, 0xfe, 0x00]), "<binary 3 bytes>");
    }
}
