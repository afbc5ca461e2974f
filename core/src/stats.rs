/*
 * stats.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portiere, an asynchronous HTTP and WebSocket server.
 *
 * Portiere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portiere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portiere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Process-wide server statistics: plain atomic counters, no ordering
//! requirement beyond eventual visibility.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

#[derive(Debug)]
pub struct ServerStats {
    pub total_requests: AtomicU64,
    pub active_connections: AtomicU64,
    pub total_connections: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub active_websockets: AtomicU64,
    pub total_websockets: AtomicU64,
    /// Unix seconds at construction.
    pub start_time: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            total_requests: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            active_websockets: AtomicU64::new(0),
            total_websockets: AtomicU64::new(0),
            start_time,
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(self.start_time);
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            active_websockets: self.active_websockets.load(Ordering::Relaxed),
            total_websockets: self.total_websockets.load(Ordering::Relaxed),
            uptime_seconds: now.saturating_sub(self.start_time),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view, serializable for a status handler.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub active_connections: u64,
    pub total_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_websockets: u64,
    pub total_websockets: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = ServerStats::new();
        stats.total_requests.fetch_add(3, Ordering::Relaxed);
        stats.active_connections.fetch_add(2, Ordering::Relaxed);
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        stats.bytes_sent.fetch_add(1024, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.bytes_sent, 1024);
    }

    #[test]
    fn snapshot_serializes() {
        let stats = ServerStats::new();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert!(json.get("total_requests").is_some());
        assert!(json.get("uptime_seconds").is_some());
    }
}
