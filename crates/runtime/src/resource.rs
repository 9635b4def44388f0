use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::error::{ErrorKind, HostError, HostResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
  TcpListener,
  TcpConn,
  File,
  ReadableStream,
  Blob,
  FormData,
  SqliteConn,
  SqliteStmt,
  FfiLib,
  FfiCallback,
  CacheName,
  Timer,
  BroadcastSub,
  LockGrant,
  CanvasCtx,
  ImageBitmap,
}

impl fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    return write!(f, "{self:?}");
  }
}

#[derive(Debug, Clone)]
pub struct BlobResource {
  pub data: bytes::Bytes,
  pub mime: String,
}

#[derive(Debug, Clone)]
pub enum FormDataValue {
  Text(String),
  File {
    name: String,
    mime: String,
    data: bytes::Bytes,
  },
}

#[derive(Debug, Clone, Default)]
pub struct FormDataResource {
  pub entries: Vec<(String, FormDataValue)>,
}

pub struct SqliteConnResource {
  pub conn: andromeda_sqlite::Connection,
  pub load_extension_enabled: Arc<AtomicBool>,
}

pub struct SqliteStmtResource {
  pub conn: andromeda_sqlite::Connection,
  pub stmt_id: u64,
  pub read_bigints: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TimerResource {
  pub interval: bool,
}

#[derive(Debug, Clone)]
pub struct BroadcastSubResource {
  pub name: String,
}

/// Typed records owned by the process-wide table. Every script-visible
/// handle corresponds to a live entry here, or its next operation fails
/// with `BadResource`.
pub enum Resource {
  TcpListener(crate::serve::ListenerResource),
  TcpConn(crate::serve::TcpConnResource),
  File(crate::fs_ops::FileResource),
  ReadableStream(crate::streams::StreamHandle),
  Blob(BlobResource),
  FormData(FormDataResource),
  SqliteConn(SqliteConnResource),
  SqliteStmt(SqliteStmtResource),
  FfiLib(crate::ffi::FfiLibResource),
  FfiCallback(crate::ffi::FfiCallbackResource),
  CacheName(crate::cache::CacheNameResource),
  Timer(TimerResource),
  BroadcastSub(BroadcastSubResource),
  LockGrant(crate::locks::LockGrantResource),
  CanvasCtx(crate::canvas::CanvasHandle),
  ImageBitmap(crate::canvas::ImageBitmapResource),
}

impl Resource {
  pub fn kind(&self) -> ResourceKind {
    return match self {
      Resource::TcpListener(_) => ResourceKind::TcpListener,
      Resource::TcpConn(_) => ResourceKind::TcpConn,
      Resource::File(_) => ResourceKind::File,
      Resource::ReadableStream(_) => ResourceKind::ReadableStream,
      Resource::Blob(_) => ResourceKind::Blob,
      Resource::FormData(_) => ResourceKind::FormData,
      Resource::SqliteConn(_) => ResourceKind::SqliteConn,
      Resource::SqliteStmt(_) => ResourceKind::SqliteStmt,
      Resource::FfiLib(_) => ResourceKind::FfiLib,
      Resource::FfiCallback(_) => ResourceKind::FfiCallback,
      Resource::CacheName(_) => ResourceKind::CacheName,
      Resource::Timer(_) => ResourceKind::Timer,
      Resource::BroadcastSub(_) => ResourceKind::BroadcastSub,
      Resource::LockGrant(_) => ResourceKind::LockGrant,
      Resource::CanvasCtx(_) => ResourceKind::CanvasCtx,
      Resource::ImageBitmap(_) => ResourceKind::ImageBitmap,
    };
  }
}

pub fn wrong_kind(id: u64, expected: ResourceKind, actual: ResourceKind) -> HostError {
  return HostError::new(
    ErrorKind::BadResource,
    format!("resource {id} is {actual}, expected {expected}"),
  );
}

struct Inner {
  next_id: u64,
  entries: BTreeMap<u64, Resource>,
}

/// Process-wide registry mapping opaque ids to typed records. Ids are
/// monotonically allocated and never reused within a run.
pub struct ResourceTable {
  inner: Mutex<Inner>,
}

impl Default for ResourceTable {
  fn default() -> Self {
    return Self::new();
  }
}

impl ResourceTable {
  pub fn new() -> Self {
    return Self {
      inner: Mutex::new(Inner {
        next_id: 1,
        entries: BTreeMap::new(),
      }),
    };
  }

  pub fn insert(&self, resource: Resource) -> u64 {
    let mut inner = self.inner.lock();
    let id = inner.next_id;
    inner.next_id += 1;
    inner.entries.insert(id, resource);
    return id;
  }

  pub fn with_entry<R>(
    &self,
    id: u64,
    f: impl FnOnce(&mut Resource) -> HostResult<R>,
  ) -> HostResult<R> {
    let mut inner = self.inner.lock();
    let entry = inner
      .entries
      .get_mut(&id)
      .ok_or_else(|| HostError::bad_resource(id))?;
    return f(entry);
  }

  pub fn kind_of(&self, id: u64) -> Option<ResourceKind> {
    return self.inner.lock().entries.get(&id).map(Resource::kind);
  }

  pub fn contains(&self, id: u64) -> bool {
    return self.inner.lock().entries.contains_key(&id);
  }

  /// Remove the entry. Idempotent: a second remove is a no-op. Dropping
  /// the returned record releases whatever OS handle it owned.
  pub fn remove(&self, id: u64) -> Option<Resource> {
    return self.inner.lock().entries.remove(&id);
  }

  pub fn ids_of(&self, kind: ResourceKind) -> Vec<u64> {
    return self
      .inner
      .lock()
      .entries
      .iter()
      .filter(|(_, r)| r.kind() == kind)
      .map(|(id, _)| *id)
      .collect();
  }

  pub fn len(&self) -> usize {
    return self.inner.lock().entries.len();
  }

  pub fn is_empty(&self) -> bool {
    return self.len() == 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_ids_monotonic_never_reused() {
    let table = ResourceTable::new();
    let a = table.insert(Resource::Timer(TimerResource { interval: false }));
    let b = table.insert(Resource::Timer(TimerResource { interval: false }));
    assert!(b > a);

    table.remove(a);
    let c = table.insert(Resource::Timer(TimerResource { interval: true }));
    assert!(c > b);
  }

  #[test]
  fn test_entry_stable_until_drop() {
    let table = ResourceTable::new();
    let id = table.insert(Resource::Timer(TimerResource { interval: true }));

    for _ in 0..3 {
      let interval = table
        .with_entry(id, |r| match r {
          Resource::Timer(t) => Ok(t.interval),
          other => Err(wrong_kind(id, ResourceKind::Timer, other.kind())),
        })
        .unwrap();
      assert!(interval);
    }

    assert!(table.remove(id).is_some());
    assert!(table.remove(id).is_none());

    let err = table.with_entry(id, |_| Ok(())).unwrap_err();
    assert_eq!(crate::error::ErrorKind::BadResource, err.kind);
  }

  #[test]
  fn test_iter_by_kind() {
    let table = ResourceTable::new();
    let t = table.insert(Resource::Timer(TimerResource { interval: false }));
    let b = table.insert(Resource::Blob(BlobResource {
      data: bytes::Bytes::from_static(b"x"),
      mime: "text/plain".to_string(),
    }));

    assert_eq!(vec![t], table.ids_of(ResourceKind::Timer));
    assert_eq!(vec![b], table.ids_of(ResourceKind::Blob));
    assert_eq!(Some(ResourceKind::Blob), table.kind_of(b));
  }
}
