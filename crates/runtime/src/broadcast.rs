use log::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::host::{HostState, get_arg};
use crate::resource::{BroadcastSubResource, Resource};
use crate::runtime::{Message, build_call_async_js_function_message};

/// Per-name subscriber registry. Endpoints sharing a name deliver each
/// other's messages but never their own.
pub struct BroadcastHub {
  by_name: Mutex<HashMap<String, Vec<u64>>>,
}

impl Default for BroadcastHub {
  fn default() -> Self {
    return Self::new();
  }
}

impl BroadcastHub {
  pub fn new() -> Self {
    return Self {
      by_name: Mutex::new(HashMap::new()),
    };
  }

  pub fn subscribe(&self, name: &str, rid: u64) {
    self
      .by_name
      .lock()
      .entry(name.to_string())
      .or_default()
      .push(rid);
  }

  pub fn unsubscribe(&self, name: &str, rid: u64) {
    let mut by_name = self.by_name.lock();
    if let Some(subs) = by_name.get_mut(name) {
      subs.retain(|id| *id != rid);
      if subs.is_empty() {
        by_name.remove(name);
      }
    }
  }

  /// Every open endpoint with the same name, minus the sender.
  pub fn peers(&self, name: &str, sender: u64) -> Vec<u64> {
    return self
      .by_name
      .lock()
      .get(name)
      .map(|subs| subs.iter().copied().filter(|id| *id != sender).collect())
      .unwrap_or_default();
  }
}

pub(crate) fn register(
  runtime: &mut rustyscript::Runtime,
  state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  {
    let state = state.clone();
    runtime.register_function("broadcast_subscribe", move |args: &[serde_json::Value]| {
      let name: String = get_arg(args, 0)?;
      let rid = state
        .resources
        .insert(Resource::BroadcastSub(BroadcastSubResource {
          name: name.clone(),
        }));
      state.broadcast.subscribe(&name, rid);
      return Ok(rid.into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("broadcast_send", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      // Payload is an opaque structured-clone image produced by
      // clone_serialize; it is handed to receivers verbatim.
      let payload: String = get_arg(args, 1)?;

      let name = state.resources.with_entry(rid, |r| match r {
        Resource::BroadcastSub(sub) => Ok(sub.name.clone()),
        other => Err(crate::resource::wrong_kind(
          rid,
          crate::resource::ResourceKind::BroadcastSub,
          other.kind(),
        )),
      })?;

      // Delivery happens after a microtask checkpoint, never inline.
      for peer in state.broadcast.peers(&name, rid) {
        let payload = payload.clone();
        state.schedule_microtask(Box::new(move |runtime, completers| {
          let message = build_call_async_js_function_message::<serde_json::Value>(
            format!("broadcast-{peer}"),
            None,
            "__dispatchMessage",
            (peer, payload),
            move |result| {
              if let Err(err) = result {
                error!("broadcast delivery to {peer} failed: {err}");
              }
            },
          );
          if let Message::Run(_module, f) = message {
            f(None, runtime, completers);
          }
        }));
      }
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("broadcast_unsubscribe", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      if let Some(Resource::BroadcastSub(sub)) = state.resources.remove(rid) {
        state.broadcast.unsubscribe(&sub.name, rid);
      }
      return Ok(serde_json::Value::Null);
    })?;
  }

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fan_out_excludes_sender_and_other_names() {
    let hub = BroadcastHub::new();
    hub.subscribe("x", 1);
    hub.subscribe("x", 2);
    hub.subscribe("y", 3);

    // a1.post delivers to a2 only; never to itself, never to "y".
    assert_eq!(vec![2], hub.peers("x", 1));
    assert_eq!(vec![1], hub.peers("x", 2));
    assert_eq!(Vec::<u64>::new(), hub.peers("y", 3));
  }

  #[test]
  fn test_unsubscribe_stops_delivery() {
    let hub = BroadcastHub::new();
    hub.subscribe("x", 1);
    hub.subscribe("x", 2);

    hub.unsubscribe("x", 2);
    assert_eq!(Vec::<u64>::new(), hub.peers("x", 1));
  }
}
