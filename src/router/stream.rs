//! Wire framing for streaming endpoints (spec.md §6): the 8-byte Docker
//! log header for `logs`/`attach` without a TTY, and newline-delimited
//! JSON progress lines for image pulls and similar long-running POSTs.

use serde::Serialize;

use crate::image::ProgressLine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
}

/// `byte0=stream, bytes1-3=0, bytes4-7=big-endian length`, exactly
/// spec.md §6's framing.
pub fn docker_log_header(stream: StreamType, payload_len: u32) -> [u8; 8] {
    let mut header = [0u8; 8];
    header[0] = stream as u8;
    header[4..8].copy_from_slice(&payload_len.to_be_bytes());
    header
}

pub fn frame(stream: StreamType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&docker_log_header(stream, payload.len() as u32));
    out.extend_from_slice(payload);
    out
}

#[derive(Debug, Serialize)]
struct ProgressDetail {
    current: u64,
    total: u64,
}

#[derive(Debug, Serialize)]
struct WireProgressLine {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    status: String,
    #[serde(rename = "progressDetail", skip_serializing_if = "Option::is_none")]
    progress_detail: Option<ProgressDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<String>,
}

/// Renders one NDJSON line (including the trailing `\n`) for an image
/// pull progress event, matching spec.md §6's field names exactly.
pub fn progress_line_json(line: &ProgressLine) -> String {
    let wire = WireProgressLine {
        id: line.id.clone(),
        status: line.status.clone(),
        progress_detail: match (line.current, line.total) {
            (Some(current), Some(total)) => Some(ProgressDetail { current, total }),
            _ => None,
        },
        progress: line.bar(),
    };
    let mut json = serde_json::to_string(&wire).unwrap_or_default();
    json.push('\n');
    json
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_encodes_stream_and_length_big_endian() {
        let header = docker_log_header(StreamType::Stdout, 0x0102);
        assert_eq!(header[0], 1);
        assert_eq!(&header[1..4], &[0, 0, 0]);
        assert_eq!(&header[4..8], &[0, 0, 1, 2]);
    }

    #[test]
    fn progress_line_json_includes_progress_detail_when_present() {
        let line = ProgressLine::status("Pulling fs layer");
        let json = progress_line_json(&line);
        assert!(json.contains("\"status\":\"Pulling fs layer\""));
        assert!(!json.contains("progressDetail"));
        assert!(json.ends_with('\n'));
    }
}
