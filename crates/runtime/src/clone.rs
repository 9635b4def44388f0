use base64::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ErrorKind, HostError, HostResult};
use crate::host::{HostState, get_arg, opt_arg};

/// Structured-clone graph. The preamble lowers script values into this
/// typed node table; node indices double as the identity memo, so shared
/// references and cycles survive the round trip. This is the typed
/// replacement for the string protocols the bridge used to carry.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "t", content = "v", rename_all = "camelCase")]
pub enum CloneNode {
  Undefined,
  Null,
  Bool(bool),
  Number(f64),
  BigInt(String),
  Text(String),
  /// Milliseconds since epoch.
  Date(f64),
  Array(Vec<u32>),
  Object(Vec<(String, u32)>),
  Map(Vec<(u32, u32)>),
  Set(Vec<u32>),
  Error {
    name: String,
    message: String,
    stack: Option<String>,
  },
  /// Base64 payload. `detached` is set on deserialized transfer sources.
  ArrayBuffer {
    data: String,
    #[serde(default)]
    detached: bool,
  },
  View {
    kind: ViewKind,
    buffer: u32,
    offset: u32,
    length: u32,
  },
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub enum ViewKind {
  Int8Array,
  Uint8Array,
  Uint8ClampedArray,
  Int16Array,
  Uint16Array,
  Int32Array,
  Uint32Array,
  Float32Array,
  Float64Array,
  BigInt64Array,
  BigUint64Array,
  DataView,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CloneGraph {
  pub nodes: Vec<CloneNode>,
  pub root: u32,
}

fn clone_error(message: impl Into<String>) -> HostError {
  return HostError::new(ErrorKind::DataCloneError, message);
}

/// Reference validation shared by serialize and the second deserialize
/// pass: every edge in bounds, views pointing at actual buffers.
fn validate(graph: &CloneGraph) -> HostResult<()> {
  let len = graph.nodes.len() as u32;
  let check = |id: u32| -> HostResult<()> {
    if id >= len {
      return Err(clone_error(format!("node reference {id} out of bounds")));
    }
    return Ok(());
  };

  check(graph.root)?;
  for node in &graph.nodes {
    match node {
      CloneNode::Array(items) | CloneNode::Set(items) => {
        for id in items {
          check(*id)?;
        }
      }
      CloneNode::Object(entries) => {
        for (_, id) in entries {
          check(*id)?;
        }
      }
      CloneNode::Map(entries) => {
        for (k, v) in entries {
          check(*k)?;
          check(*v)?;
        }
      }
      CloneNode::View { buffer, .. } => {
        check(*buffer)?;
        if !matches!(graph.nodes[*buffer as usize], CloneNode::ArrayBuffer { .. }) {
          return Err(clone_error("view does not reference an ArrayBuffer"));
        }
      }
      CloneNode::Number(n) => {
        // NaN and infinities clone fine; nothing to check.
        let _ = n;
      }
      _ => {}
    }
  }
  return Ok(());
}

/// Serialize a graph to its byte image. Transfer entries must name
/// ArrayBuffer nodes; the returned list confirms which sources the caller
/// must detach.
pub fn serialize(graph: &CloneGraph, transfer: &[u32]) -> HostResult<(Vec<u8>, Vec<u32>)> {
  validate(graph)?;

  for id in transfer {
    match graph.nodes.get(*id as usize) {
      Some(CloneNode::ArrayBuffer { .. }) => {}
      Some(_) => {
        return Err(clone_error(format!("node {id} is not transferable")));
      }
      None => {
        return Err(clone_error(format!("transfer reference {id} out of bounds")));
      }
    }
  }

  let bytes = serde_json::to_vec(graph).map_err(|err| clone_error(err.to_string()))?;
  return Ok((bytes, transfer.to_vec()));
}

/// Two-pass deserialize: decode all nodes (allocate), then validate every
/// reference (fill).
pub fn deserialize(bytes: &[u8]) -> HostResult<CloneGraph> {
  let graph: CloneGraph =
    serde_json::from_slice(bytes).map_err(|err| clone_error(err.to_string()))?;
  validate(&graph)?;
  return Ok(graph);
}

pub(crate) fn register(
  runtime: &mut rustyscript::Runtime,
  _state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  {
    runtime.register_function("clone_serialize", move |args: &[serde_json::Value]| {
      let graph: CloneGraph = get_arg(args, 0)?;
      let transfer: Vec<u32> = opt_arg(args, 1).unwrap_or_default();

      let (bytes, detached) = serialize(&graph, &transfer)?;
      return Ok(serde_json::json!({
        "data": BASE64_STANDARD.encode(bytes),
        "detached": detached,
      }));
    })?;
  }
  {
    runtime.register_function("clone_deserialize", move |args: &[serde_json::Value]| {
      let data: String = get_arg(args, 0)?;
      let bytes = BASE64_STANDARD
        .decode(&data)
        .map_err(|err| clone_error(err.to_string()))?;

      let graph = deserialize(&bytes)?;
      return Ok(serde_json::to_value(graph).map_err(|err| clone_error(err.to_string()))?);
    })?;
  }

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  fn round_trip(graph: &CloneGraph) -> CloneGraph {
    let (bytes, _) = serialize(graph, &[]).unwrap();
    return deserialize(&bytes).unwrap();
  }

  #[test]
  fn test_primitives_round_trip() {
    let graph = CloneGraph {
      nodes: vec![
        CloneNode::Array(vec![1, 2, 3, 4, 5]),
        CloneNode::Undefined,
        CloneNode::Bool(true),
        CloneNode::Number(1.5),
        CloneNode::BigInt("123456789012345678901234567890".to_string()),
        CloneNode::Date(1_700_000_000_000.0),
      ],
      root: 0,
    };
    assert_eq!(graph, round_trip(&graph));
  }

  #[test]
  fn test_cycles_survive() {
    // node 0 = [self, obj], obj = { me: node 0 }
    let graph = CloneGraph {
      nodes: vec![
        CloneNode::Array(vec![0, 1]),
        CloneNode::Object(vec![("me".to_string(), 0)]),
      ],
      root: 0,
    };
    let back = round_trip(&graph);
    assert_eq!(graph, back);

    // The cycle is by index, so identity is preserved structurally.
    let CloneNode::Array(items) = &back.nodes[0] else {
      panic!("root should stay an array");
    };
    assert_eq!(0, items[0]);
  }

  #[test]
  fn test_map_set_identity() {
    let graph = CloneGraph {
      nodes: vec![
        CloneNode::Map(vec![(1, 2), (2, 1)]),
        CloneNode::Text("key".to_string()),
        CloneNode::Set(vec![1]),
      ],
      root: 0,
    };
    assert_eq!(graph, round_trip(&graph));
  }

  #[test]
  fn test_buffers_and_views() {
    let graph = CloneGraph {
      nodes: vec![
        CloneNode::View {
          kind: ViewKind::Uint16Array,
          buffer: 1,
          offset: 0,
          length: 2,
        },
        CloneNode::ArrayBuffer {
          data: BASE64_STANDARD.encode([1u8, 0, 2, 0]),
          detached: false,
        },
      ],
      root: 0,
    };
    assert_eq!(graph, round_trip(&graph));
  }

  #[test]
  fn test_transfer_requires_array_buffer() {
    let graph = CloneGraph {
      nodes: vec![
        CloneNode::Text("not a buffer".to_string()),
        CloneNode::ArrayBuffer {
          data: "AAAA".to_string(),
          detached: false,
        },
      ],
      root: 0,
    };

    let (_, detached) = serialize(&graph, &[1]).unwrap();
    assert_eq!(vec![1], detached);

    let err = serialize(&graph, &[0]).unwrap_err();
    assert_eq!(ErrorKind::DataCloneError, err.kind);
  }

  #[test]
  fn test_dangling_reference_rejected() {
    let graph = CloneGraph {
      nodes: vec![CloneNode::Array(vec![7])],
      root: 0,
    };
    assert_eq!(
      ErrorKind::DataCloneError,
      serialize(&graph, &[]).unwrap_err().kind
    );

    let view_without_buffer = CloneGraph {
      nodes: vec![
        CloneNode::View {
          kind: ViewKind::DataView,
          buffer: 1,
          offset: 0,
          length: 0,
        },
        CloneNode::Text("nope".to_string()),
      ],
      root: 0,
    };
    assert_eq!(
      ErrorKind::DataCloneError,
      serialize(&view_without_buffer, &[]).unwrap_err().kind
    );
  }

  #[test]
  fn test_unsupported_tag_is_data_clone_error() {
    // A function snuck into the payload: unknown tag fails decoding.
    let bytes = br#"{"nodes":[{"t":"Function","v":"() => {}"}],"root":0}"#;
    assert_eq!(
      ErrorKind::DataCloneError,
      deserialize(bytes).unwrap_err().kind
    );
  }
}
