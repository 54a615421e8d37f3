// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::Duration;

use strum_macros::Display;

const SMOOTHING_PERIOD_MS: f64 = 5000.0;

/// Lifecycle state as seen from outside the torrent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum Status {
    #[default]
    Stopped,
    #[strum(serialize = "Downloading Metadata")]
    DownloadingMetadata,
    Allocating,
    Verifying,
    Downloading,
    Seeding,
    Stopping,
}

/// Byte counter with an exponentially smoothed per-second rate. `tick` is driven by
/// the owner's one second timer.
#[derive(Debug, Clone, Default)]
pub struct SpeedMeter {
    total: u64,
    in_tick: u64,
    ema: f64,
}

impl SpeedMeter {
    pub fn mark(&mut self, bytes: u64) {
        self.total += bytes;
        self.in_tick += bytes;
    }

    pub fn tick(&mut self, dt: Duration) {
        let dt_ms = dt.as_millis() as f64;
        let scaling_factor = if dt_ms > 0.0 { 1000.0 / dt_ms } else { 1.0 };
        let alpha = 1.0 - (-dt_ms / SMOOTHING_PERIOD_MS).exp();
        let instant = self.in_tick as f64 * scaling_factor;
        self.ema = instant * alpha + self.ema * (1.0 - alpha);
        self.in_tick = 0;
    }

    /// Bytes per second.
    pub fn rate(&self) -> u64 {
        self.ema as u64
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn reset_rate(&mut self) {
        self.in_tick = 0;
        self.ema = 0.0;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PieceStats {
    /// Pieces hashed so far while verifying.
    pub checked: u32,
    pub have: u32,
    pub missing: u32,
    /// Distinct pieces at least one connected peer has.
    pub available: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ByteStats {
    pub completed: u64,
    pub incomplete: u64,
    pub total: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    /// Received bytes that were thrown away: failed hashes and unrequested blocks.
    pub wasted: u64,
    pub allocated: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerStats {
    pub total: usize,
    pub incoming: usize,
    pub outgoing: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddressStats {
    pub total: usize,
    pub dht: usize,
    pub incoming: usize,
    pub fixed: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadStats {
    pub total: usize,
    pub running: usize,
    pub snubbed: usize,
    pub choked: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataDownloadStats {
    pub total: usize,
    pub running: usize,
    pub snubbed: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpeedStats {
    pub download: u64,
    pub upload: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    pub info_hash: String,
    pub status: Status,
    /// Why the torrent stopped on its own, if it did.
    pub error: Option<String>,
    /// May change once metadata is downloaded.
    pub name: String,
    pub piece_length: u32,
    pub seeded_for: Duration,
    pub speed: SpeedStats,
    /// `None` means unknown or infinite.
    pub eta: Option<Duration>,
    pub pieces: PieceStats,
    pub bytes: ByteStats,
    pub peers: PeerStats,
    pub addresses: AddressStats,
    pub downloads: DownloadStats,
    pub metadata_downloads: MetadataDownloadStats,
}

/// Remaining time at the current download rate, rounded coarser as it grows.
pub fn eta(incomplete: u64, download_bps: u64) -> Option<Duration> {
    if download_bps == 0 {
        return None;
    }
    let secs = incomplete / download_bps;
    let round_to = match secs {
        s if s > 8 * 3600 => 3600,
        s if s > 4 * 3600 => 1800,
        s if s > 2 * 3600 => 900,
        s if s > 3600 => 300,
        s if s > 1800 => 60,
        s if s > 900 => 30,
        s if s > 300 => 15,
        s if s > 60 => 5,
        _ => 1,
    };
    let rounded = (secs + round_to / 2) / round_to * round_to;
    Some(Duration::from_secs(rounded))
}

/// Drops control characters from names that came off the wire.
pub fn printable(name: &str) -> String {
    name.chars().filter(|c| !c.is_control()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_meter_converges_to_steady_rate() {
        let mut meter = SpeedMeter::default();
        for _ in 0..60 {
            meter.mark(1000);
            meter.tick(Duration::from_secs(1));
        }
        assert!((990..=1000).contains(&meter.rate()), "rate {}", meter.rate());
        assert_eq!(meter.total(), 60_000);

        for _ in 0..60 {
            meter.tick(Duration::from_secs(1));
        }
        assert!(meter.rate() < 10);
        meter.reset_rate();
        assert_eq!(meter.rate(), 0);
        assert_eq!(meter.total(), 60_000);
    }

    #[test]
    fn test_single_burst_is_smoothed() {
        let mut meter = SpeedMeter::default();
        meter.mark(10_000);
        meter.tick(Duration::from_secs(1));
        let alpha = 1.0 - (-1000.0f64 / SMOOTHING_PERIOD_MS).exp();
        assert_eq!(meter.rate(), (10_000.0 * alpha) as u64);
    }

    #[test]
    fn test_eta_rounding() {
        assert_eq!(eta(100, 0), None);
        assert_eq!(eta(100, 10), Some(Duration::from_secs(10)));
        assert_eq!(eta(123, 1), Some(Duration::from_secs(125)));
        assert_eq!(eta(9 * 3600 + 1000, 1), Some(Duration::from_secs(9 * 3600)));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::DownloadingMetadata.to_string(), "Downloading Metadata");
        assert_eq!(Status::Seeding.to_string(), "Seeding");
    }

    #[test]
    fn test_printable_strips_control_chars() {
        assert_eq!(printable("a\u{7}b\nc"), "abc");
    }
}
