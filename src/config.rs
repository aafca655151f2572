//! Decodes the on-disk action graph (§6.1) into a validated `Graph`.
//!
//! This mirrors the teacher's `app::config` module: a leading `{`
//! selects JSON, anything else is parsed as YAML, and the raw
//! `serde`-derived structs are kept separate from the semantic model
//! (`Action`/`Graph`) so that deserialization failures and validation
//! failures are both reported as a single `TgenError::Graph`.

use std::collections::BTreeMap;

use action::{Action, Protocol, TransferKind};
use error::TgenError;
use graph::{Graph, GraphBuilder, VertexId};
use peer::{Peer, PeerPool};

pub fn from_str(text: &str) -> Result<Graph, TgenError> {
    let doc: RawDoc = parse_doc(text)?;
    build_graph(doc)
}

fn parse_doc(text: &str) -> Result<RawDoc, TgenError> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') {
        serde_json::from_str(text).map_err(|e| TgenError::Graph(format!("invalid JSON graph: {}", e)))
    } else {
        serde_yaml::from_str(text).map_err(|e| TgenError::Graph(format!("invalid YAML graph: {}", e)))
    }
}

#[derive(Deserialize, Debug)]
struct RawDoc {
    vertices: BTreeMap<String, RawVertex>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct RawVertex {
    action: RawAction,
    #[serde(default)]
    time: Option<u64>,
    #[serde(default)]
    serverport: Option<u16>,
    #[serde(default)]
    peers: Option<String>,
    #[serde(default)]
    socksproxy: Option<String>,
    #[serde(default)]
    count: Option<u64>,
    #[serde(default)]
    size: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    successors: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum RawAction {
    Start,
    End,
    Pause,
    Synchronize,
    // The original schema spells this with a digit in place of the `O`;
    // that's a typo in the source, not a distinct action (§9).
    #[serde(rename = "synchr0nize")]
    SynchronizeTypo,
    Transfer,
}

fn build_graph(doc: RawDoc) -> Result<Graph, TgenError> {
    let mut builder = GraphBuilder::new();
    let mut ids: BTreeMap<String, VertexId> = BTreeMap::new();

    // First pass: materialize every vertex so forward references in
    // `successors` resolve regardless of map iteration order.
    for (name, raw) in &doc.vertices {
        let action = to_action(name, raw)?;
        let id = builder.add_vertex(action);
        ids.insert(name.clone(), id);
    }

    for (name, raw) in &doc.vertices {
        let from = ids[name];
        for succ_name in &raw.successors {
            let to = *ids.get(succ_name).ok_or_else(|| {
                TgenError::Graph(format!(
                    "vertex '{}' lists unknown successor '{}'",
                    name, succ_name
                ))
            })?;
            builder.add_edge(from, to);
        }
    }

    builder.build()
}

fn to_action(name: &str, raw: &RawVertex) -> Result<Action, TgenError> {
    match raw.action {
        RawAction::Start => {
            let time_s = raw.time.unwrap_or(0);
            let server_port = raw.serverport.ok_or_else(|| {
                TgenError::Graph(format!("start vertex '{}' is missing 'serverport'", name))
            })?;
            let peers = parse_peer_list(name, raw.peers.as_deref())?;
            let socks_proxy = match raw.socksproxy {
                None => None,
                Some(ref s) => Some(s.parse()?),
            };
            Ok(Action::Start {
                time_s,
                server_port,
                peers,
                socks_proxy,
            })
        }
        RawAction::End => Ok(Action::End {
            time_s: raw.time.unwrap_or(0),
            count: raw.count.unwrap_or(0),
            size_bytes: match raw.size {
                None => 0,
                Some(ref s) => parse_size_bytes(s)?,
            },
        }),
        RawAction::Pause => {
            let time_s = raw.time.ok_or_else(|| {
                TgenError::Graph(format!("pause vertex '{}' is missing 'time'", name))
            })?;
            Ok(Action::Pause { time_s })
        }
        RawAction::Synchronize | RawAction::SynchronizeTypo => Ok(Action::Synchronize),
        RawAction::Transfer => {
            let kind = match raw.kind.as_deref() {
                Some("get") => TransferKind::Get,
                Some("put") => TransferKind::Put,
                Some(other) => {
                    return Err(TgenError::Graph(format!(
                        "transfer vertex '{}' has unknown type '{}'",
                        name, other
                    )))
                }
                None => {
                    return Err(TgenError::Graph(format!(
                        "transfer vertex '{}' is missing 'type'",
                        name
                    )))
                }
            };
            match raw.protocol.as_deref() {
                Some("tcp") | None => {}
                Some(other) => {
                    return Err(TgenError::Graph(format!(
                        "transfer vertex '{}' requests unsupported protocol '{}' (only 'tcp' is implemented)",
                        name, other
                    )))
                }
            }
            let size_bytes = match raw.size {
                None => {
                    return Err(TgenError::Graph(format!(
                        "transfer vertex '{}' is missing 'size'",
                        name
                    )))
                }
                Some(ref s) => parse_size_bytes(s)?,
            };
            let peers = match raw.peers {
                None => None,
                Some(ref s) => Some(parse_peer_list(name, Some(s))?),
            };
            Ok(Action::Transfer {
                kind,
                protocol: Protocol::Tcp,
                size_bytes,
                peers,
            })
        }
    }
}

fn parse_peer_list(vertex: &str, peers: Option<&str>) -> Result<PeerPool, TgenError> {
    let pool = PeerPool::new();
    let peers = match peers {
        None => return Ok(pool),
        Some(p) => p,
    };
    for entry in peers.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let peer: Peer = entry.parse().map_err(|_| {
            TgenError::Graph(format!("vertex '{}' has invalid peer '{}'", vertex, entry))
        })?;
        pool.add(peer);
    }
    Ok(pool)
}

/// Parses a byte count with an optional SI (`kb`=10³, `mb`=10⁶, `gb`=10⁹,
/// `tb`=10¹²) or IEC (`kib`=2¹⁰, `mib`=2²⁰, `gib`=2³⁰, `tib`=2⁴⁰) suffix,
/// per §3. A bare integer is bytes.
pub fn parse_size_bytes(s: &str) -> Result<u64, TgenError> {
    let s = s.trim();
    let lower = s.to_ascii_lowercase();

    const IEC: &[(&str, u64)] = &[
        ("tib", 1u64 << 40),
        ("gib", 1u64 << 30),
        ("mib", 1u64 << 20),
        ("kib", 1u64 << 10),
    ];
    const SI: &[(&str, u64)] = &[
        ("tb", 1_000_000_000_000),
        ("gb", 1_000_000_000),
        ("mb", 1_000_000),
        ("kb", 1_000),
    ];

    for &(suffix, mult) in IEC.iter().chain(SI.iter()) {
        if let Some(stripped) = lower.strip_suffix(suffix) {
            let n: u64 = stripped.trim().parse().map_err(|_| {
                TgenError::Graph(format!("invalid byte size '{}'", s))
            })?;
            return Ok(n * mult);
        }
    }

    lower
        .parse()
        .map_err(|_| TgenError::Graph(format!("invalid byte size '{}'", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_si_and_iec_suffixes() {
        assert_eq!(parse_size_bytes("1024").unwrap(), 1024);
        assert_eq!(parse_size_bytes("1kb").unwrap(), 1_000);
        assert_eq!(parse_size_bytes("1KB").unwrap(), 1_000);
        assert_eq!(parse_size_bytes("1kib").unwrap(), 1024);
        assert_eq!(parse_size_bytes("1mib").unwrap(), 1024 * 1024);
        assert_eq!(parse_size_bytes("2mb").unwrap(), 2_000_000);
        assert_eq!(parse_size_bytes("1gib").unwrap(), 1 << 30);
    }

    #[test]
    fn rejects_garbage_size() {
        assert!(parse_size_bytes("banana").is_err());
        assert!(parse_size_bytes("").is_err());
    }

    #[test]
    fn parses_minimal_yaml_graph() {
        let yaml = "
vertices:
  start:
    action: start
    time: 0
    serverport: 9000
    peers: \"127.0.0.1:9000\"
    successors: [xfer]
  xfer:
    action: transfer
    type: get
    protocol: tcp
    size: 1mib
    successors: [end]
  end:
    action: end
    count: 1
";
        let g = from_str(yaml).unwrap();
        assert_eq!(g.len(), 3);
        match g.action_of(g.start_vertex()) {
            Action::Start { server_port, .. } => assert_eq!(*server_port, 9000),
            _ => panic!("expected start action"),
        }
    }

    #[test]
    fn rejects_non_tcp_protocol() {
        let yaml = "
vertices:
  start:
    action: start
    serverport: 9000
    successors: [xfer]
  xfer:
    action: transfer
    type: get
    protocol: udp
    size: 1024
";
        assert!(from_str(yaml).is_err());
    }

    #[test]
    fn rejects_unknown_successor() {
        let yaml = "
vertices:
  start:
    action: start
    serverport: 9000
    successors: [nope]
";
        assert!(from_str(yaml).is_err());
    }

    #[test]
    fn parses_json_graph() {
        let json = r#"{"vertices":{"start":{"action":"start","serverport":9000,"peers":"127.0.0.1:9000","successors":["end"]},"end":{"action":"end","count":1}}}"#;
        let g = from_str(json).unwrap();
        assert_eq!(g.len(), 2);
    }
}
