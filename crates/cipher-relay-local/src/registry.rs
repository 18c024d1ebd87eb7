//! Active client connections and traffic statistics.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Write as _};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use cipher_relay_peer::{Destination, TrafficCounters};
use serde::Serialize;

/// How a client reached the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Socks5,
    HttpConnect,
    HttpForward,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Socks5 => "socks5",
            Protocol::HttpConnect => "http-connect",
            Protocol::HttpForward => "http-forward",
        })
    }
}

struct ActiveEntry {
    client: SocketAddr,
    protocol: Protocol,
    destination: String,
    counters: Arc<TrafficCounters>,
    opened: Instant,
}

#[derive(Default)]
struct Aggregate {
    connections: u64,
    upload: u64,
    download: u64,
}

#[derive(Default)]
struct RegistryState {
    active: HashMap<u64, ActiveEntry>,
    destinations: BTreeMap<String, Aggregate>,
    total_connections: u64,
    upload: u64,
    download: u64,
}

/// Tracks relayed client connections.
///
/// Byte counts of finished connections are folded into per-destination and
/// global totals when their [`RegisteredConnection`] is dropped.
#[derive(Default)]
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a new relayed connection.
    pub fn register(
        self: &Arc<Self>,
        client: SocketAddr,
        protocol: Protocol,
        destination: &Destination,
    ) -> RegisteredConnection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let counters = Arc::new(TrafficCounters::default());
        let destination = destination.to_string();

        let mut state = self.lock();
        state.total_connections += 1;
        state
            .destinations
            .entry(destination.clone())
            .or_default()
            .connections += 1;
        state.active.insert(
            id,
            ActiveEntry {
                client,
                protocol,
                destination,
                counters: counters.clone(),
                opened: Instant::now(),
            },
        );

        RegisteredConnection {
            id,
            counters,
            registry: self.clone(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    fn finish(&self, id: u64) {
        let mut state = self.lock();
        let Some(entry) = state.active.remove(&id) else {
            return;
        };
        let (upload, download) = (entry.counters.upload(), entry.counters.download());
        state.upload += upload;
        state.download += download;
        let aggregate = state.destinations.entry(entry.destination).or_default();
        aggregate.upload += upload;
        aggregate.download += download;
    }

    /// Client-side view of traffic; transport fields are left at zero.
    pub fn snapshot(&self) -> StatsSnapshot {
        let state = self.lock();
        let mut snapshot = StatsSnapshot {
            total_connections: state.total_connections,
            upload_bytes: state.upload,
            download_bytes: state.download,
            ..StatsSnapshot::default()
        };

        let mut live: HashMap<&str, (u64, u64)> = HashMap::new();
        let mut active: Vec<ConnectionStat> = state
            .active
            .iter()
            .map(|(id, entry)| {
                let (upload, download) = (entry.counters.upload(), entry.counters.download());
                let slot = live.entry(entry.destination.as_str()).or_default();
                slot.0 += upload;
                slot.1 += download;
                ConnectionStat {
                    id: *id,
                    client: entry.client.to_string(),
                    protocol: entry.protocol,
                    destination: entry.destination.clone(),
                    upload_bytes: upload,
                    download_bytes: download,
                    age_ms: entry.opened.elapsed().as_millis() as u64,
                }
            })
            .collect();
        active.sort_by_key(|conn| conn.id);

        snapshot.upload_bytes += active.iter().map(|c| c.upload_bytes).sum::<u64>();
        snapshot.download_bytes += active.iter().map(|c| c.download_bytes).sum::<u64>();
        snapshot.destinations = state
            .destinations
            .iter()
            .map(|(destination, aggregate)| {
                let (up, down) = live.get(destination.as_str()).copied().unwrap_or_default();
                DestinationStat {
                    destination: destination.clone(),
                    connections: aggregate.connections,
                    upload_bytes: aggregate.upload + up,
                    download_bytes: aggregate.download + down,
                }
            })
            .collect();
        snapshot.active_connections = active;
        snapshot
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registration of one relayed connection; unregisters on drop.
pub struct RegisteredConnection {
    id: u64,
    counters: Arc<TrafficCounters>,
    registry: Arc<ConnectionRegistry>,
}

impl RegisteredConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn counters(&self) -> &TrafficCounters {
        &self.counters
    }
}

impl Drop for RegisteredConnection {
    fn drop(&mut self) {
        self.registry.finish(self.id);
    }
}

/// One live client connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStat {
    pub id: u64,
    pub client: String,
    pub protocol: Protocol,
    pub destination: String,
    pub upload_bytes: u64,
    pub download_bytes: u64,
    pub age_ms: u64,
}

/// Lifetime totals for one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationStat {
    pub destination: String,
    pub connections: u64,
    pub upload_bytes: u64,
    pub download_bytes: u64,
}

/// Point-in-time traffic report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    /// Plaintext bytes from clients toward destinations.
    pub upload_bytes: u64,
    /// Plaintext bytes from destinations back to clients.
    pub download_bytes: u64,
    /// Sealed bytes written to transport connections.
    pub wire_sent_bytes: u64,
    /// Sealed bytes read from transport connections.
    pub wire_received_bytes: u64,
    pub transport_connections: usize,
    pub active_streams: usize,
    pub active_connections: Vec<ConnectionStat>,
    pub destinations: Vec<DestinationStat>,
}

impl StatsSnapshot {
    /// Plain-text report served by the stats endpoint.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "connections: {} active, {} total",
            self.active_connections.len(),
            self.total_connections
        );
        let _ = writeln!(
            out,
            "traffic: {} bytes up, {} bytes down",
            self.upload_bytes, self.download_bytes
        );
        let _ = writeln!(
            out,
            "wire: {} bytes sent, {} bytes received",
            self.wire_sent_bytes, self.wire_received_bytes
        );
        let _ = writeln!(
            out,
            "transport: {} connections, {} streams",
            self.transport_connections, self.active_streams
        );
        if !self.active_connections.is_empty() {
            out.push_str("active:\n");
            for conn in &self.active_connections {
                let _ = writeln!(
                    out,
                    "  #{} {} {} -> {} up={} down={} age={}ms",
                    conn.id,
                    conn.protocol,
                    conn.client,
                    conn.destination,
                    conn.upload_bytes,
                    conn.download_bytes,
                    conn.age_ms
                );
            }
        }
        if !self.destinations.is_empty() {
            out.push_str("destinations:\n");
            for dest in &self.destinations {
                let _ = writeln!(
                    out,
                    "  {} connections={} up={} down={}",
                    dest.destination, dest.connections, dest.upload_bytes, dest.download_bytes
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SocketAddr {
        "127.0.0.1:50000".parse().expect("addr")
    }

    #[test]
    fn totals_survive_connection_close() {
        let registry = ConnectionRegistry::new();
        let dest = Destination::Domain("example.com".to_string(), 443);

        let first = registry.register(client(), Protocol::Socks5, &dest);
        first.counters().add_upload(100);
        first.counters().add_download(400);
        let second = registry.register(client(), Protocol::HttpConnect, &dest);
        second.counters().add_upload(10);
        assert_eq!(registry.active_count(), 2);

        let live = registry.snapshot();
        assert_eq!(live.upload_bytes, 110);
        assert_eq!(live.download_bytes, 400);
        assert_eq!(live.active_connections.len(), 2);

        drop(first);
        drop(second);
        assert_eq!(registry.active_count(), 0);

        let done = registry.snapshot();
        assert_eq!(done.total_connections, 2);
        assert_eq!(done.upload_bytes, 110);
        assert_eq!(done.download_bytes, 400);
        assert_eq!(
            done.destinations,
            vec![DestinationStat {
                destination: "example.com:443".to_string(),
                connections: 2,
                upload_bytes: 110,
                download_bytes: 400,
            }]
        );
    }

    #[test]
    fn snapshot_serializes_protocol_names() {
        let registry = ConnectionRegistry::new();
        let _conn = registry.register(
            client(),
            Protocol::HttpForward,
            &Destination::Domain("a.test".to_string(), 80),
        );
        let json = serde_json::to_value(registry.snapshot()).expect("serialize");
        assert_eq!(json["active_connections"][0]["protocol"], "http-forward");
        assert_eq!(json["destinations"][0]["destination"], "a.test:80");
    }

    #[test]
    fn text_report_lists_destinations() {
        let registry = ConnectionRegistry::new();
        drop(registry.register(
            client(),
            Protocol::Socks5,
            &Destination::Ip("10.0.0.1:22".parse().expect("addr")),
        ));
        let text = registry.snapshot().render_text();
        assert!(text.starts_with("connections: 0 active, 1 total\n"));
        assert!(text.contains("  10.0.0.1:22 connections=1 up=0 down=0"));
    }
}
