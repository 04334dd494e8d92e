//! Progress-line aggregation (spec.md §4.3).
//!
//! The puller only ever reports deltas (`AddSize`, `AddItems`, ...); this
//! module turns that stream into the per-layer lines a Docker client
//! already knows how to render, throttled to roughly one line per ID
//! every 100ms so a fast local pull doesn't flood the client with a line
//! per chunk.
//!
//! Client rendering only has screen space for a handful of concurrent
//! layer lines. The first two completed items keep their own line, keyed
//! by the manifest digest and the first layer digest respectively — the
//! two IDs a client is most likely to already have cached from a
//! previous pull. From the third layer on, lines collapse into one
//! "bulk layers" line keyed by the second layer's digest, carrying the
//! combined current/total of every layer from the third one onward. This
//! avoids fabricating per-blob progress for a render budget the puller
//! was never asked to supply per-layer detail for beyond the first two.

use std::time::{Duration, Instant};

use super::puller::ProgressEvent;

const THROTTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressLine {
    pub id: Option<String>,
    pub status: String,
    pub current: Option<u64>,
    pub total: Option<u64>,
}

impl ProgressLine {
    pub fn status(status: impl Into<String>) -> Self {
        Self { id: None, status: status.into(), current: None, total: None }
    }

    fn progress(id: String, status: impl Into<String>, current: u64, total: u64) -> Self {
        Self { id: Some(id), status: status.into(), current: Some(current), total: Some(total) }
    }

    /// Renders the `[====>   ]  1.2MB/4.5MB` bar text Docker clients print
    /// alongside `status`, matching the classic CLI layout.
    pub fn bar(&self) -> Option<String> {
        let (current, total) = (self.current?, self.total?);
        if total == 0 {
            return Some(format!("[{}] {}/{}", "=".repeat(24), format_bytes(current), format_bytes(total)));
        }
        let filled = ((current as f64 / total as f64) * 24.0).round().min(24.0) as usize;
        let bar = if filled == 0 {
            format!(">{}", " ".repeat(23))
        } else if filled >= 24 {
            "=".repeat(24)
        } else {
            format!("{}>{}", "=".repeat(filled - 1), " ".repeat(24 - filled))
        };
        Some(format!("[{}] {}/{}", bar, format_bytes(current), format_bytes(total)))
    }
}

fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", n, UNITS[0])
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}

fn short_id(digest: &str) -> String {
    digest.trim_start_matches("sha256:").chars().take(12).collect()
}

/// One layer's role in the collapsed display: its own line, or folded
/// into the shared bulk line.
enum Slot {
    Own(usize),
    Bulk,
}

pub struct ProgressTracker {
    manifest_digest: String,
    layer_digests: Vec<String>,
    layer_sizes: Vec<u64>,
    downloaded: Vec<u64>,
    completed: usize,
    last_emit: std::collections::HashMap<String, Instant>,
}

impl ProgressTracker {
    pub fn new(layer_digests: Vec<String>) -> Self {
        Self::with_manifest(String::new(), layer_digests)
    }

    pub fn with_manifest(manifest_digest: String, layer_digests: Vec<String>) -> Self {
        let n = layer_digests.len();
        Self {
            manifest_digest,
            layer_digests,
            layer_sizes: vec![0; n],
            downloaded: vec![0; n],
            completed: 0,
            last_emit: std::collections::HashMap::new(),
        }
    }

    fn slot_for(&self, index: usize) -> Slot {
        if index < 2 {
            Slot::Own(index)
        } else {
            Slot::Bulk
        }
    }

    fn id_for_index(&self, index: usize) -> String {
        match index {
            0 if !self.manifest_digest.is_empty() => short_id(&self.manifest_digest),
            0 => self.layer_digests.first().map(|d| short_id(d)).unwrap_or_default(),
            1 => self.layer_digests.get(0).map(|d| short_id(d)).unwrap_or_default(),
            _ => self.layer_digests.get(1).map(|d| short_id(d)).unwrap_or_else(|| "bulk".to_string()),
        }
    }

    /// Throttle key is the layer index, not the rendered id: indices >= 2
    /// share one rendered id (the bulk line) but must not share a
    /// throttle window, or finishing layer N would suppress the first
    /// line of layer N+1.
    fn throttled(&mut self, index: usize) -> bool {
        let key = format!("idx{}", index);
        let now = Instant::now();
        match self.last_emit.get(&key) {
            Some(last) if now.duration_since(*last) < THROTTLE => false,
            _ => {
                self.last_emit.insert(key, now);
                true
            }
        }
    }

    /// Consume one raw puller event, returning zero or more lines to push
    /// to the client. Total-size/total-item events never produce a line
    /// directly; they only arm the bars that later `AddSize`/`AddItems`
    /// events render.
    pub fn apply(&mut self, event: ProgressEvent) -> Vec<ProgressLine> {
        match event {
            // Per-layer totals come from `set_layer_sizes` (the Image Store
            // already has them from the resolved manifest); the aggregate
            // total this event carries has no layer to attribute it to.
            ProgressEvent::AddTotalSize(_) => Vec::new(),
            ProgressEvent::AddTotalItems(_) => Vec::new(),
            ProgressEvent::AddSize(n) => {
                if self.completed >= self.downloaded.len() {
                    return Vec::new();
                }
                self.downloaded[self.completed] += n;
                self.emit_for(self.completed, "Downloading")
            }
            ProgressEvent::AddItems(_) => {
                let lines = self.emit_for_forced(self.completed, "Download complete");
                self.completed += 1;
                lines
            }
            ProgressEvent::ContainerSetupStart(id) => vec![ProgressLine::status(format!("{}: Extracting", id))],
            ProgressEvent::ContainerSetupComplete => vec![ProgressLine::status("Pull complete")],
        }
    }

    /// Set per-layer totals directly, bypassing the lossy `AddTotalSize`
    /// aggregate event — used once the Image Store already has the
    /// resolved manifest's per-layer sizes at pull start.
    pub fn set_layer_sizes(&mut self, sizes: Vec<u64>) {
        self.layer_sizes = sizes;
    }

    fn emit_for(&mut self, index: usize, status: &str) -> Vec<ProgressLine> {
        if !self.throttled(index) {
            return Vec::new();
        }
        self.emit_for_forced(index, status)
    }

    fn emit_for_forced(&self, index: usize, status: &str) -> Vec<ProgressLine> {
        let id = self.id_for_index(index);
        match self.slot_for(index) {
            Slot::Own(i) => {
                let total = self.layer_sizes.get(i).copied().unwrap_or(0);
                let current = self.downloaded.get(i).copied().unwrap_or(0);
                vec![ProgressLine::progress(id, status, current, total)]
            }
            Slot::Bulk => {
                let (current, total) = self.bulk_totals();
                vec![ProgressLine::progress(id, status, current, total)]
            }
        }
    }

    fn bulk_totals(&self) -> (u64, u64) {
        if self.layer_digests.len() <= 2 {
            return (0, 0);
        }
        let current: u64 = self.downloaded[2..].iter().sum();
        let total: u64 = self.layer_sizes[2..].iter().sum();
        (current, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST_DIGEST: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn tracker_with_sizes(n: usize, size: u64) -> ProgressTracker {
        let digests: Vec<String> = (0..n).map(|i| format!("sha256:{:064x}", i + 1)).collect();
        let mut t = ProgressTracker::with_manifest(MANIFEST_DIGEST.to_string(), digests);
        t.set_layer_sizes(vec![size; n]);
        t
    }

    #[test]
    fn first_two_layers_get_individual_ids() {
        let mut t = tracker_with_sizes(4, 100);
        let lines = t.apply(ProgressEvent::AddSize(50));
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].id.as_deref(), Some(short_id(MANIFEST_DIGEST).as_str()));

        t.apply(ProgressEvent::AddItems(1));
        let lines = t.apply(ProgressEvent::AddSize(50));
        assert_eq!(lines[0].id.as_deref(), Some(short_id(&format!("sha256:{:064x}", 1)).as_str()));
    }

    #[test]
    fn third_and_later_layers_collapse_to_bulk_line() {
        let mut t = tracker_with_sizes(4, 100);
        t.apply(ProgressEvent::AddSize(100));
        t.apply(ProgressEvent::AddItems(1));
        t.apply(ProgressEvent::AddSize(100));
        t.apply(ProgressEvent::AddItems(1));

        let bulk_id = short_id(&format!("sha256:{:064x}", 2));

        let lines = t.apply(ProgressEvent::AddSize(40));
        assert_eq!(lines[0].id.as_deref(), Some(bulk_id.as_str()));
        assert_eq!(lines[0].current, Some(40));
        assert_eq!(lines[0].total, Some(200)); // layers 3 and 4 combined

        t.apply(ProgressEvent::AddItems(1));
        let lines = t.apply(ProgressEvent::AddSize(30));
        assert_eq!(lines[0].id.as_deref(), Some(bulk_id.as_str()));
        assert_eq!(lines[0].current, Some(130));
    }

    #[test]
    fn throttle_suppresses_rapid_repeat_lines() {
        let mut t = tracker_with_sizes(1, 1000);
        let first = t.apply(ProgressEvent::AddSize(10));
        assert_eq!(first.len(), 1);
        let second = t.apply(ProgressEvent::AddSize(10));
        assert!(second.is_empty(), "second call within throttle window should be suppressed");
    }

    #[test]
    fn bar_renders_human_readable_sizes() {
        let line = ProgressLine::progress("abc".into(), "Downloading", 1_500_000, 4_500_000);
        let bar = line.bar().unwrap();
        assert!(bar.contains("1.5MB"));
        assert!(bar.contains("4.5MB"));
    }
}
