//! `show trace` output parser

use crate::{ProbeError, Result};
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

const NO_PACKETS: &str = "No packets in trace buffer";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capture {
    pub name: String,
    /// Time since boot when the node saw the packet
    pub start: Duration,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Packet {
    pub id: u32,
    /// Thread the packet was captured on
    pub thread: u32,
    pub captures: Vec<Capture>,
}

fn thread_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^-+ Start of thread (\d+) (\S+) -+\n").expect("valid regex")
    })
}

fn packet_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Packet (\d+)\s*$").expect("valid regex"))
}

fn capture_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^((?:[0-9]{2}:){3}[0-9]{6}): (\S+)\n").expect("valid regex")
    })
}

fn blank_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n[ \t]*\n").expect("valid regex"))
}

/// Parse raw trace output into packets. Malformed captures are logged and
/// skipped. Output without thread sections yields no packets, the caller
/// keeps the raw text.
pub fn parse_trace(raw: &str) -> Result<Vec<Packet>> {
    let text = raw.replace("\r\n", "\n").replace('\r', "\n");

    let headers: Vec<_> = thread_header().captures_iter(&text).collect();
    if headers.is_empty() {
        if !text.trim().is_empty() && !text.contains(NO_PACKETS) {
            warn!(
                "Trace output has no thread sections: {:?}",
                text.lines().next().unwrap_or_default()
            );
        }
        return Ok(Vec::new());
    }

    let mut packets = Vec::new();
    for (i, caps) in headers.iter().enumerate() {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        let thread: u32 = caps[1].parse().unwrap_or_else(|_| {
            warn!("Invalid thread number {:?}", &caps[1]);
            0
        });
        let end = headers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(text.len(), |m| m.start());
        parse_thread(thread, &text[whole.end..end], &mut packets);
    }
    Ok(packets)
}

fn parse_thread(thread: u32, section: &str, packets: &mut Vec<Packet>) {
    let mut current: Option<Packet> = None;

    for block in blank_line().split(section) {
        let block = block.trim_matches('\n');
        if block.trim().is_empty() {
            continue;
        }

        let first_line = block.lines().next().unwrap_or_default();
        if let Some(caps) = packet_header().captures(first_line.trim_end()) {
            if let Some(done) = current.take() {
                packets.push(done);
            }
            let id = match caps[1].parse() {
                Ok(id) => id,
                Err(e) => {
                    warn!("Invalid packet id {:?}: {}", &caps[1], e);
                    continue;
                }
            };
            let mut packet = Packet {
                id,
                thread,
                captures: Vec::new(),
            };
            let rest = block[first_line.len()..].trim_start_matches('\n');
            parse_captures(rest, &mut packet);
            current = Some(packet);
            continue;
        }

        match current.as_mut() {
            Some(packet) => parse_captures(block, packet),
            None => {
                if !block.contains(NO_PACKETS) {
                    warn!("Trace text outside of a packet on thread {}", thread);
                }
            }
        }
    }

    if let Some(done) = current {
        packets.push(done);
    }
}

fn parse_captures(block: &str, packet: &mut Packet) {
    let text = if block.ends_with('\n') {
        block.to_string()
    } else {
        format!("{}\n", block)
    };
    let headers: Vec<_> = capture_header().captures_iter(&text).collect();

    for (i, caps) in headers.iter().enumerate() {
        let header = match caps.get(0) {
            Some(m) => m,
            None => continue,
        };
        let end = headers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(text.len(), |m| m.start());

        let start = match parse_timestamp(&caps[1]) {
            Ok(start) => start,
            Err(e) => {
                warn!("Packet {}: skipping capture {}: {}", packet.id, &caps[2], e);
                continue;
            }
        };

        packet.captures.push(Capture {
            name: caps[2].to_string(),
            start,
            content: dedent(&text[header.end()..end]),
        });
    }
}

/// Decode `HH:MM:SS:uuuuuu`
pub fn parse_timestamp(ts: &str) -> Result<Duration> {
    let parts: Vec<&str> = ts.split(':').collect();
    let [h, m, s, us] = parts.as_slice() else {
        return Err(ProbeError::Parse(format!("malformed timestamp {:?}", ts)));
    };
    let num = |v: &str| {
        v.parse::<u64>()
            .map_err(|e| ProbeError::Parse(format!("malformed timestamp {:?}: {}", ts, e)))
    };
    let (h, m, s, us) = (num(*h)?, num(*m)?, num(*s)?, num(*us)?);
    if m >= 60 || s >= 60 {
        return Err(ProbeError::Parse(format!(
            "timestamp {:?} out of range",
            ts
        )));
    }
    Ok(Duration::from_secs(h * 3600 + m * 60 + s) + Duration::from_micros(us))
}

/// Strip the first line's indentation from every line
fn dedent(content: &str) -> String {
    let content = content.trim_end_matches('\n');
    let indent = content
        .lines()
        .next()
        .map(|l| l.len() - l.trim_start().len())
        .unwrap_or(0);

    let mut out = String::with_capacity(content.len());
    for (i, line) in content.lines().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let ws = line.len() - line.trim_start().len();
        out.push_str(&line[ws.min(indent)..]);
    }
    out
}
