use std::io::IsTerminal;

use cipher_relay_local::StatsSnapshot;
use cipher_relay_remote::RemoteStats;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
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
struct Report<'a, T: Serialize> {
    role: &'a str,
    stats: &'a T,
}

fn print_json<T: Serialize>(role: &str, stats: &T) {
    let report = Report { role, stats };
    println!(
        "{}",
        serde_json::to_string(&report).unwrap_or_else(|_| "{}".to_string())
    );
}

fn metric_table(rows: Vec<(&str, String)>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["METRIC", "VALUE"]);
    for (name, value) in rows {
        table.add_row(vec![name.to_string(), value]);
    }
    table
}

/// Final report printed when the local relay stops.
pub fn print_local_stats(stats: &StatsSnapshot, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json("local", stats),
        OutputFormat::Table => {
            println!(
                "{}",
                metric_table(vec![
                    ("connections", stats.total_connections.to_string()),
                    ("upload bytes", stats.upload_bytes.to_string()),
                    ("download bytes", stats.download_bytes.to_string()),
                    ("wire sent bytes", stats.wire_sent_bytes.to_string()),
                    ("wire received bytes", stats.wire_received_bytes.to_string()),
                ])
            );
            if stats.destinations.is_empty() {
                return;
            }
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["DESTINATION", "CONNECTIONS", "UPLOAD", "DOWNLOAD"]);
            for dest in &stats.destinations {
                table.add_row(vec![
                    dest.destination.clone(),
                    dest.connections.to_string(),
                    dest.upload_bytes.to_string(),
                    dest.download_bytes.to_string(),
                ]);
            }
            println!("{table}");
        }
    }
}

/// Final report printed when the remote relay stops.
pub fn print_remote_stats(stats: &RemoteStats, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json("remote", stats),
        OutputFormat::Table => println!(
            "{}",
            metric_table(vec![
                ("connections", stats.connections_accepted.to_string()),
                ("streams opened", stats.streams_opened.to_string()),
                ("streams refused", stats.streams_refused.to_string()),
                ("upstream bytes", stats.upstream_bytes.to_string()),
                ("downstream bytes", stats.downstream_bytes.to_string()),
                ("wire sent bytes", stats.wire_sent_bytes.to_string()),
                ("wire received bytes", stats.wire_received_bytes.to_string()),
            ])
        ),
    }
}
