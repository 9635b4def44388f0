use indexmap::IndexMap;
use log::*;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::HostError;
use crate::host::{HostState, get_arg, opt_arg};
use crate::resource::{Resource, ResourceTable};
use crate::runtime::{Message, build_call_async_js_function_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Exclusive,
  Shared,
}

impl LockMode {
  pub fn as_str(&self) -> &'static str {
    return match self {
      LockMode::Exclusive => "exclusive",
      LockMode::Shared => "shared",
    };
  }

  fn parse(s: Option<String>) -> LockMode {
    return match s.as_deref() {
      Some("shared") => LockMode::Shared,
      _ => LockMode::Exclusive,
    };
  }
}

#[derive(Debug, Clone)]
pub struct LockGrantResource {
  pub name: String,
  pub mode: LockMode,
}

/// What happened to a lock request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GrantOutcome {
  /// Granted; carries the grant resource id the holder releases later.
  Granted(u64),
  /// `ifAvailable` request that lost: callback runs with null.
  Unavailable,
  Aborted,
}

pub type GrantCallback = Box<dyn FnOnce(GrantOutcome) + Send>;

struct HeldLock {
  grant_rid: u64,
  mode: LockMode,
  /// Set when a `steal` evicted this holder; its eventual release is a
  /// no-op.
  stolen: bool,
}

struct PendingLock {
  request_id: u64,
  mode: LockMode,
  callback: GrantCallback,
}

#[derive(Default)]
struct Tables {
  /// name → holders. Multiple holders only for coalesced shared grants.
  held: IndexMap<String, Vec<HeldLock>>,
  pending: IndexMap<String, VecDeque<PendingLock>>,
  /// grant resource id → name, for release lookups.
  grants: HashMap<u64, String>,
}

/// Web-locks scheduler: FIFO per name with shared-grant coalescing,
/// `ifAvailable` fast path, `steal` preemption.
pub struct LockManager {
  inner: Mutex<Tables>,
  next_request: AtomicU64,
}

impl Default for LockManager {
  fn default() -> Self {
    return Self::new();
  }
}

impl LockManager {
  pub fn new() -> Self {
    return Self {
      inner: Mutex::new(Tables::default()),
      next_request: AtomicU64::new(1),
    };
  }

  /// Request ids are handed out up front so the grant dispatch can be
  /// wired to the id before the scheduler runs.
  pub fn allocate_request_id(&self) -> u64 {
    return self.next_request.fetch_add(1, Ordering::SeqCst);
  }

  fn grantable(tables: &Tables, name: &str, mode: LockMode) -> bool {
    let queue_empty = tables.pending.get(name).is_none_or(VecDeque::is_empty);
    let holders = tables.held.get(name).map_or(&[][..], Vec::as_slice);
    if holders.iter().any(|h| !h.stolen) {
      // Shared may join shared, but never jumps queued requests.
      return mode == LockMode::Shared
        && holders.iter().all(|h| h.stolen || h.mode == LockMode::Shared)
        && queue_empty;
    }
    return queue_empty;
  }

  fn grant(tables: &mut Tables, resources: &ResourceTable, name: &str, mode: LockMode) -> u64 {
    let grant_rid = resources.insert(Resource::LockGrant(LockGrantResource {
      name: name.to_string(),
      mode,
    }));
    tables
      .held
      .entry(name.to_string())
      .or_default()
      .push(HeldLock {
        grant_rid,
        mode,
        stolen: false,
      });
    tables.grants.insert(grant_rid, name.to_string());
    return grant_rid;
  }

  /// Returns the callbacks to run, outside the table lock.
  pub fn request(
    &self,
    resources: &ResourceTable,
    request_id: u64,
    name: &str,
    mode: LockMode,
    if_available: bool,
    steal: bool,
    callback: GrantCallback,
  ) -> Vec<(GrantCallback, GrantOutcome)> {
    let mut tables = self.inner.lock();

    if steal {
      // Abort current holders and preempt the queue.
      if let Some(holders) = tables.held.get_mut(name) {
        for holder in holders.iter_mut() {
          holder.stolen = true;
          resources.remove(holder.grant_rid);
        }
      }
      let grant_rid = Self::grant(&mut tables, resources, name, mode);
      return vec![(callback, GrantOutcome::Granted(grant_rid))];
    }

    if Self::grantable(&tables, name, mode) {
      let grant_rid = Self::grant(&mut tables, resources, name, mode);
      return vec![(callback, GrantOutcome::Granted(grant_rid))];
    }

    if if_available {
      return vec![(callback, GrantOutcome::Unavailable)];
    }

    tables
      .pending
      .entry(name.to_string())
      .or_default()
      .push_back(PendingLock {
        request_id,
        mode,
        callback,
      });
    return vec![];
  }

  /// Release a grant; returns follow-up grants to dispatch. FIFO order,
  /// with consecutive shared requests coalesced into one generation.
  pub fn release(
    &self,
    resources: &ResourceTable,
    grant_rid: u64,
  ) -> Vec<(GrantCallback, GrantOutcome)> {
    let mut tables = self.inner.lock();
    let Some(name) = tables.grants.remove(&grant_rid) else {
      return vec![];
    };
    resources.remove(grant_rid);

    if let Some(holders) = tables.held.get_mut(&name) {
      holders.retain(|h| h.grant_rid != grant_rid);
      if holders.iter().any(|h| !h.stolen) {
        // Other shared holders remain; nothing to grant yet.
        return vec![];
      }
      tables.held.shift_remove(&name);
    }

    let mut callbacks: Vec<(GrantCallback, GrantOutcome)> = vec![];
    loop {
      let Some(queue) = tables.pending.get_mut(&name) else {
        break;
      };
      let Some(front_mode) = queue.front().map(|p| p.mode) else {
        tables.pending.shift_remove(&name);
        break;
      };

      // First pop always proceeds; afterwards only shared joins shared.
      if !callbacks.is_empty() && front_mode == LockMode::Exclusive {
        break;
      }

      let pending = queue.pop_front().expect("checked front");
      if queue.is_empty() {
        tables.pending.shift_remove(&name);
      }
      let grant_rid = Self::grant(&mut tables, resources, &name, pending.mode);
      callbacks.push((pending.callback, GrantOutcome::Granted(grant_rid)));

      if pending.mode == LockMode::Exclusive {
        break;
      }
    }
    return callbacks;
  }

  /// Abort a still-pending request (AbortSignal). Returns the callback to
  /// reject, if the request was still queued.
  pub fn abort(&self, request_id: u64) -> Option<GrantCallback> {
    let mut tables = self.inner.lock();
    for (_name, queue) in tables.pending.iter_mut() {
      if let Some(pos) = queue.iter().position(|p| p.request_id == request_id) {
        return queue.remove(pos).map(|p| p.callback);
      }
    }
    return None;
  }

  /// Snapshot of held and pending locks.
  pub fn query(&self) -> serde_json::Value {
    let tables = self.inner.lock();

    let held: Vec<serde_json::Value> = tables
      .held
      .iter()
      .flat_map(|(name, holders)| {
        holders
          .iter()
          .filter(|h| !h.stolen)
          .map(move |h| serde_json::json!({ "name": name, "mode": h.mode.as_str() }))
      })
      .collect();
    let pending: Vec<serde_json::Value> = tables
      .pending
      .iter()
      .flat_map(|(name, queue)| {
        queue
          .iter()
          .map(move |p| serde_json::json!({ "name": name, "mode": p.mode.as_str() }))
      })
      .collect();

    return serde_json::json!({ "held": held, "pending": pending });
  }
}

/// Grant callbacks land as `__dispatchLock(requestId, status, grantRid)`
/// through the microtask checkpoint.
fn make_callback(state: Arc<HostState>, request_id: u64) -> GrantCallback {
  return Box::new(move |outcome| {
    let (status, grant_rid) = match outcome {
      GrantOutcome::Granted(rid) => ("granted", Some(rid)),
      GrantOutcome::Unavailable => ("unavailable", None),
      GrantOutcome::Aborted => ("aborted", None),
    };

    state.schedule_microtask(Box::new(move |runtime, completers| {
      let message = build_call_async_js_function_message::<serde_json::Value>(
        format!("lock-{request_id}"),
        None,
        "__dispatchLock",
        (request_id, status, grant_rid),
        move |result| {
          if let Err(err) = result {
            error!("lock callback for request {request_id} failed: {err}");
          }
        },
      );
      if let Message::Run(_module, f) = message {
        f(None, runtime, completers);
      }
    }));
  });
}

pub(crate) fn register(
  runtime: &mut rustyscript::Runtime,
  state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  {
    let state = state.clone();
    runtime.register_function("lock_request", move |args: &[serde_json::Value]| {
      let name: String = get_arg(args, 0)?;
      let mode = LockMode::parse(opt_arg(args, 1));
      let if_available: bool = opt_arg(args, 2).unwrap_or(false);
      let steal: bool = opt_arg(args, 3).unwrap_or(false);

      if steal && mode != LockMode::Exclusive {
        return Err(HostError::invalid_input("steal requires exclusive mode").into());
      }
      if steal && if_available {
        return Err(HostError::invalid_input("steal excludes ifAvailable").into());
      }

      let request_id = state.locks.allocate_request_id();
      let callback = make_callback(state.clone(), request_id);
      let outcomes = state.locks.request(
        &state.resources,
        request_id,
        &name,
        mode,
        if_available,
        steal,
        callback,
      );
      for (callback, outcome) in outcomes {
        callback(outcome);
      }
      return Ok(request_id.into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("lock_release", move |args: &[serde_json::Value]| {
      let grant_rid: u64 = get_arg(args, 0)?;
      let outcomes = state.locks.release(&state.resources, grant_rid);
      for (callback, outcome) in outcomes {
        callback(outcome);
      }
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("lock_abort", move |args: &[serde_json::Value]| {
      let request_id: u64 = get_arg(args, 0)?;
      if let Some(callback) = state.locks.abort(request_id) {
        callback(GrantOutcome::Aborted);
      }
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("lock_query", move |_args: &[serde_json::Value]| {
      return Ok(state.locks.query());
    })?;
  }

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  fn log_cb(log: &Arc<Mutex<Vec<(u64, GrantOutcome)>>>, tag: u64) -> GrantCallback {
    let log = log.clone();
    return Box::new(move |outcome| {
      log.lock().push((tag, outcome));
    });
  }

  fn request(
    manager: &LockManager,
    resources: &ResourceTable,
    log: &Arc<Mutex<Vec<(u64, GrantOutcome)>>>,
    tag: u64,
    name: &str,
    mode: LockMode,
    if_available: bool,
    steal: bool,
  ) -> (u64, Option<u64>) {
    let request_id = manager.allocate_request_id();
    let outcomes = manager.request(
      resources,
      request_id,
      name,
      mode,
      if_available,
      steal,
      log_cb(log, tag),
    );
    let mut grant = None;
    for (callback, outcome) in outcomes {
      if let GrantOutcome::Granted(rid) = outcome {
        grant = Some(rid);
      }
      callback(outcome);
    }
    return (request_id, grant);
  }

  #[test]
  fn test_fifo_with_shared_coalescing() {
    let manager = LockManager::new();
    let resources = ResourceTable::new();
    let log = Arc::new(Mutex::new(vec![]));

    let (_, first) = request(&manager, &resources, &log, 1, "n", LockMode::Exclusive, false, false);
    let first = first.unwrap();

    for tag in [2, 3] {
      let (_, grant) = request(&manager, &resources, &log, tag, "n", LockMode::Shared, false, false);
      assert!(grant.is_none());
    }
    let (_, grant) = request(&manager, &resources, &log, 4, "n", LockMode::Exclusive, false, false);
    assert!(grant.is_none());

    // Release: both shared coalesce into one generation; exclusive waits.
    let mut shared_rids = vec![];
    for (callback, outcome) in manager.release(&resources, first) {
      if let GrantOutcome::Granted(rid) = outcome {
        shared_rids.push(rid);
      }
      callback(outcome);
    }
    assert_eq!(2, shared_rids.len());
    assert_eq!(vec![1, 2, 3], log.lock().iter().map(|(t, _)| *t).collect::<Vec<_>>());

    // Exclusive only granted once both shared holders released.
    assert!(manager.release(&resources, shared_rids[0]).is_empty());
    for (callback, outcome) in manager.release(&resources, shared_rids[1]) {
      assert!(matches!(outcome, GrantOutcome::Granted(_)));
      callback(outcome);
    }
    assert_eq!(
      vec![1, 2, 3, 4],
      log.lock().iter().map(|(t, _)| *t).collect::<Vec<_>>()
    );
  }

  #[test]
  fn test_if_available_when_contested() {
    let manager = LockManager::new();
    let resources = ResourceTable::new();
    let log = Arc::new(Mutex::new(vec![]));

    request(&manager, &resources, &log, 1, "n", LockMode::Exclusive, false, false);
    request(&manager, &resources, &log, 2, "n", LockMode::Exclusive, true, false);

    assert_eq!(
      Some(&(2u64, GrantOutcome::Unavailable)),
      log.lock().iter().find(|(t, _)| *t == 2)
    );
  }

  #[test]
  fn test_steal_preempts_holder() {
    let manager = LockManager::new();
    let resources = ResourceTable::new();
    let log = Arc::new(Mutex::new(vec![]));

    let (_, victim) = request(&manager, &resources, &log, 1, "n", LockMode::Exclusive, false, false);
    let victim = victim.unwrap();
    let (_, queued) = request(&manager, &resources, &log, 2, "n", LockMode::Exclusive, false, false);
    assert!(queued.is_none());

    let (_, thief) = request(&manager, &resources, &log, 3, "n", LockMode::Exclusive, false, true);
    assert!(thief.is_some());
    // The victim's grant record is gone and its release is a no-op.
    assert!(!resources.contains(victim));
    assert!(manager.release(&resources, victim).is_empty());

    // The queued request waits for the thief, not the victim.
    for (callback, outcome) in manager.release(&resources, thief.unwrap()) {
      assert!(matches!(outcome, GrantOutcome::Granted(_)));
      callback(outcome);
    }
    assert!(log.lock().iter().any(|(t, o)| *t == 2 && matches!(o, GrantOutcome::Granted(_))));
  }

  #[test]
  fn test_abort_pending_request() {
    let manager = LockManager::new();
    let resources = ResourceTable::new();
    let log = Arc::new(Mutex::new(vec![]));

    request(&manager, &resources, &log, 1, "n", LockMode::Exclusive, false, false);
    let (pending_id, grant) =
      request(&manager, &resources, &log, 2, "n", LockMode::Exclusive, false, false);
    assert!(grant.is_none());

    let callback = manager.abort(pending_id).unwrap();
    callback(GrantOutcome::Aborted);
    assert!(manager.abort(pending_id).is_none());

    assert_eq!(
      Some(&(2u64, GrantOutcome::Aborted)),
      log.lock().iter().find(|(t, _)| *t == 2)
    );
  }

  #[test]
  fn test_query_snapshot() {
    let manager = LockManager::new();
    let resources = ResourceTable::new();
    let log = Arc::new(Mutex::new(vec![]));

    request(&manager, &resources, &log, 1, "a", LockMode::Exclusive, false, false);
    request(&manager, &resources, &log, 2, "a", LockMode::Shared, false, false);

    let snapshot = manager.query();
    assert_eq!(1, snapshot["held"].as_array().unwrap().len());
    assert_eq!("exclusive", snapshot["held"][0]["mode"]);
    assert_eq!(1, snapshot["pending"].as_array().unwrap().len());
  }
}
