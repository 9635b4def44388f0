use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

use crate::bridge::{CompletionSlot, await_completion};
use crate::error::{ErrorKind, HostError, HostResult};
use crate::host::{HostState, bytes_arg, encode_bytes, get_arg, opt_arg};
use crate::resource::{Resource, ResourceKind, ResourceTable, wrong_kind};

pub type StreamHandle = Arc<Mutex<StreamInner>>;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamPhase {
  Readable,
  Closed,
  Errored(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamKind {
  Default,
  Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome {
  pub chunk: Option<Bytes>,
  pub done: bool,
}

enum ReadWait {
  Ready(ReadOutcome),
  Pending(oneshot::Receiver<HostResult<ReadOutcome>>),
}

/// Outstanding BYOB pull-into request. The borrowed view of the web API is
/// modeled as a host-side fill buffer; `respond` appends written bytes and
/// settles the request with the filled region.
struct PullIntoPending {
  length: usize,
  element_size: usize,
  filled: Vec<u8>,
  slot: CompletionSlot<ReadOutcome>,
}

impl PullIntoPending {
  fn remaining(&self) -> usize {
    return self.length - self.filled.len();
  }
}

pub struct StreamInner {
  phase: StreamPhase,
  kind: StreamKind,
  hwm: u32,
  desired_override: Option<i64>,
  queue: VecDeque<Bytes>,
  /// Total queued payload bytes. For default streams backpressure counts
  /// chunks; for byte streams it counts bytes.
  queued_bytes: usize,
  locked: bool,
  reader_token: Option<u64>,
  next_token: u64,
  pending_reads: VecDeque<CompletionSlot<ReadOutcome>>,
  byob_pending: VecDeque<PullIntoPending>,
  cancel_requested: bool,
  /// Tee fan-out: a source carries its two branches, a branch a weak link
  /// back to its source.
  branches: Option<(StreamHandle, StreamHandle)>,
  tee_source: Option<Weak<Mutex<StreamInner>>>,
}

impl StreamInner {
  fn new(kind: StreamKind, hwm: u32) -> Self {
    return Self {
      phase: StreamPhase::Readable,
      kind,
      hwm,
      desired_override: None,
      queue: VecDeque::new(),
      queued_bytes: 0,
      locked: false,
      reader_token: None,
      next_token: 1,
      pending_reads: VecDeque::new(),
      byob_pending: VecDeque::new(),
      cancel_requested: false,
      branches: None,
      tee_source: None,
    };
  }

  pub fn state_name(&self) -> &'static str {
    return match self.phase {
      StreamPhase::Readable => "readable",
      StreamPhase::Closed => "closed",
      StreamPhase::Errored(_) => "errored",
    };
  }

  pub fn chunk_count(&self) -> usize {
    return self.queue.len();
  }

  pub fn queued_bytes(&self) -> usize {
    return self.queued_bytes;
  }

  pub fn desired_size(&self) -> i64 {
    if let Some(v) = self.desired_override {
      return v;
    }
    let queued = match self.kind {
      StreamKind::Default => self.queue.len(),
      StreamKind::Bytes => self.queued_bytes,
    };
    return i64::from(self.hwm) - queued as i64;
  }

  pub fn set_desired_size(&mut self, v: i64) {
    self.desired_override = Some(v);
  }

  fn error_of(&self) -> Option<HostError> {
    if let StreamPhase::Errored(reason) = &self.phase {
      return Some(HostError::new(ErrorKind::Internal, reason.clone()));
    }
    return None;
  }

  fn enqueue(&mut self, chunk: Bytes) -> HostResult<()> {
    if self.phase != StreamPhase::Readable {
      return Err(HostError::invalid_input(format!(
        "cannot enqueue on {} stream",
        self.state_name()
      )));
    }

    let mut data = chunk;

    // Byte streams feed outstanding pull-intos before the queue.
    if self.kind == StreamKind::Bytes {
      while !data.is_empty() {
        let Some(front) = self.byob_pending.front_mut() else {
          break;
        };
        let n = front.remaining().min(data.len());
        front.filled.extend_from_slice(&data.split_to(n));
        if front.filled.len() >= front.element_size {
          let mut settled = self.byob_pending.pop_front().expect("checked front");
          settled.slot.complete(Ok(ReadOutcome {
            chunk: Some(Bytes::from(std::mem::take(&mut settled.filled))),
            done: false,
          }));
        }
      }
      if data.is_empty() {
        return Ok(());
      }
    }

    if let Some(mut slot) = self.pending_reads.pop_front() {
      slot.complete(Ok(ReadOutcome {
        chunk: Some(data),
        done: false,
      }));
      return Ok(());
    }

    self.queued_bytes += data.len();
    self.queue.push_back(data);
    return Ok(());
  }

  fn do_close(&mut self) -> HostResult<()> {
    match self.phase {
      StreamPhase::Readable => {}
      StreamPhase::Closed => return Ok(()),
      StreamPhase::Errored(_) => {
        return Err(HostError::invalid_input("cannot close an errored stream"));
      }
    }
    self.phase = StreamPhase::Closed;

    // Pending reads only exist while the queue is empty; they resolve done.
    for mut slot in self.pending_reads.drain(..) {
      slot.complete(Ok(ReadOutcome {
        chunk: None,
        done: true,
      }));
    }
    for mut pending in self.byob_pending.drain(..) {
      let filled = std::mem::take(&mut pending.filled);
      pending.slot.complete(Ok(ReadOutcome {
        chunk: if filled.is_empty() {
          None
        } else {
          Some(Bytes::from(filled))
        },
        done: true,
      }));
    }
    return Ok(());
  }

  fn do_error(&mut self, reason: String) {
    if self.phase != StreamPhase::Readable {
      return;
    }
    self.phase = StreamPhase::Errored(reason.clone());
    self.queue.clear();
    self.queued_bytes = 0;

    let err = HostError::new(ErrorKind::Internal, reason);
    for mut slot in self.pending_reads.drain(..) {
      slot.complete(Err(err.clone()));
    }
    for mut pending in self.byob_pending.drain(..) {
      pending.slot.complete(Err(err.clone()));
    }
  }

  fn do_cancel(&mut self) {
    self.cancel_requested = true;
    self.queue.clear();
    self.queued_bytes = 0;
    if self.phase == StreamPhase::Readable {
      self.phase = StreamPhase::Closed;
    }
    for mut slot in self.pending_reads.drain(..) {
      slot.complete(Ok(ReadOutcome {
        chunk: None,
        done: true,
      }));
    }
    for mut pending in self.byob_pending.drain(..) {
      pending.slot.complete(Ok(ReadOutcome {
        chunk: None,
        done: true,
      }));
    }
  }

  fn check_reader(&self, token: Option<u64>) -> HostResult<()> {
    if self.locked && token != self.reader_token {
      return Err(HostError::invalid_input(
        "stream is locked to another reader",
      ));
    }
    return Ok(());
  }

  fn lock(&mut self) -> HostResult<u64> {
    if self.locked {
      return Err(HostError::invalid_input("stream is already locked"));
    }
    let token = self.next_token;
    self.next_token += 1;
    self.locked = true;
    self.reader_token = Some(token);
    return Ok(token);
  }

  fn unlock(&mut self, token: u64) -> HostResult<()> {
    if !self.locked || self.reader_token != Some(token) {
      return Err(HostError::invalid_input("stream is not locked by caller"));
    }
    self.locked = false;
    self.reader_token = None;
    return Ok(());
  }

  fn start_read(&mut self, token: Option<u64>) -> HostResult<ReadWait> {
    self.check_reader(token)?;
    if let Some(err) = self.error_of() {
      return Err(err);
    }

    if let Some(chunk) = self.queue.pop_front() {
      self.queued_bytes -= chunk.len();
      return Ok(ReadWait::Ready(ReadOutcome {
        chunk: Some(chunk),
        done: false,
      }));
    }

    if self.phase == StreamPhase::Closed {
      return Ok(ReadWait::Ready(ReadOutcome {
        chunk: None,
        done: true,
      }));
    }

    // Data not available yet: the read parks until enqueue/close/error.
    let (slot, receiver) = CompletionSlot::new();
    self.pending_reads.push_back(slot);
    return Ok(ReadWait::Pending(receiver));
  }

  fn start_pull_into(
    &mut self,
    token: Option<u64>,
    length: usize,
    element_size: usize,
  ) -> HostResult<ReadWait> {
    if self.kind != StreamKind::Bytes {
      return Err(HostError::type_mismatch("pull-into requires a byte stream"));
    }
    self.check_reader(token)?;
    if element_size == 0 || length == 0 || length % element_size != 0 {
      return Err(HostError::invalid_input("invalid pull-into view geometry"));
    }
    if let Some(err) = self.error_of() {
      return Err(err);
    }

    if !self.queue.is_empty() {
      let mut filled = Vec::with_capacity(length);
      while filled.len() < length {
        let Some(mut chunk) = self.queue.pop_front() else {
          break;
        };
        self.queued_bytes -= chunk.len();
        let n = (length - filled.len()).min(chunk.len());
        filled.extend_from_slice(&chunk.split_to(n));
        if !chunk.is_empty() {
          self.queued_bytes += chunk.len();
          self.queue.push_front(chunk);
        }
      }
      // Only whole elements may be handed out; the tail stays queued.
      let usable = filled.len() - filled.len() % element_size;
      if usable < filled.len() {
        let tail = filled.split_off(usable);
        self.queued_bytes += tail.len();
        self.queue.push_front(Bytes::from(tail));
      }
      if !filled.is_empty() {
        return Ok(ReadWait::Ready(ReadOutcome {
          chunk: Some(Bytes::from(filled)),
          done: false,
        }));
      }
    }

    if self.phase == StreamPhase::Closed {
      return Ok(ReadWait::Ready(ReadOutcome {
        chunk: None,
        done: true,
      }));
    }

    let (slot, receiver) = CompletionSlot::new();
    self.byob_pending.push_back(PullIntoPending {
      length,
      element_size,
      filled: Vec::new(),
      slot,
    });
    return Ok(ReadWait::Pending(receiver));
  }

  /// Source-side answer to an outstanding pull-into. `replace` swaps the
  /// whole view (respondWithNewView); otherwise bytes append to the fill.
  fn respond(&mut self, data: &[u8], replace: bool) -> HostResult<()> {
    let Some(front) = self.byob_pending.front_mut() else {
      return Err(HostError::invalid_input("no pull-into request outstanding"));
    };
    if replace {
      front.filled.clear();
      if data.len() > front.length {
        return Err(HostError::invalid_input("new view exceeds requested size"));
      }
    } else if data.len() > front.remaining() {
      return Err(HostError::invalid_input(format!(
        "respond with {} bytes exceeds remaining {}",
        data.len(),
        front.remaining()
      )));
    }
    front.filled.extend_from_slice(data);

    let mut settled = self.byob_pending.pop_front().expect("checked front");
    settled.slot.complete(Ok(ReadOutcome {
      chunk: Some(Bytes::from(std::mem::take(&mut settled.filled))),
      done: false,
    }));
    return Ok(());
  }
}

pub fn create_stream(table: &ResourceTable, kind: StreamKind, hwm: u32) -> u64 {
  let handle: StreamHandle = Arc::new(Mutex::new(StreamInner::new(kind, hwm)));
  return table.insert(Resource::ReadableStream(handle));
}

pub fn stream_handle(table: &ResourceTable, id: u64) -> HostResult<StreamHandle> {
  return table.with_entry(id, |r| match r {
    Resource::ReadableStream(handle) => Ok(handle.clone()),
    other => Err(wrong_kind(id, ResourceKind::ReadableStream, other.kind())),
  });
}

/// Enqueue one chunk. On a teed source the chunk replicates to both
/// branches instead of the source's own queue.
pub fn enqueue(table: &ResourceTable, id: u64, chunk: Bytes) -> HostResult<()> {
  let handle = stream_handle(table, id)?;
  let branches = {
    let mut inner = handle.lock();
    match inner.branches.clone() {
      Some(branches) if inner.phase == StreamPhase::Readable => Some(branches),
      Some(_) => {
        return Err(HostError::invalid_input(format!(
          "cannot enqueue on {} stream",
          inner.state_name()
        )));
      }
      None => {
        return inner.enqueue(chunk);
      }
    }
  };

  if let Some((a, b)) = branches {
    // A cancelled branch silently drops its copy.
    for branch in [a, b] {
      let mut inner = branch.lock();
      if inner.phase == StreamPhase::Readable {
        inner.enqueue(chunk.clone())?;
      }
    }
  }
  return Ok(());
}

pub fn close(table: &ResourceTable, id: u64) -> HostResult<()> {
  let handle = stream_handle(table, id)?;
  let branches = {
    let mut inner = handle.lock();
    inner.do_close()?;
    inner.branches.clone()
  };
  if let Some((a, b)) = branches {
    let _ = a.lock().do_close();
    let _ = b.lock().do_close();
  }
  return Ok(());
}

pub fn error_stream(table: &ResourceTable, id: u64, reason: String) -> HostResult<()> {
  let handle = stream_handle(table, id)?;
  let branches = {
    let mut inner = handle.lock();
    inner.do_error(reason.clone());
    inner.branches.clone()
  };
  // Errors propagate to both branches.
  if let Some((a, b)) = branches {
    a.lock().do_error(reason.clone());
    b.lock().do_error(reason);
  }
  return Ok(());
}

/// Cancelling one tee branch leaves its sibling alone; the source is only
/// cancelled once both branches asked for it.
pub fn cancel(table: &ResourceTable, id: u64) -> HostResult<()> {
  let handle = stream_handle(table, id)?;
  let source = {
    let mut inner = handle.lock();
    inner.do_cancel();
    inner.tee_source.clone()
  };

  if let Some(source) = source.and_then(|weak| weak.upgrade()) {
    let both_cancelled = {
      let inner = source.lock();
      match &inner.branches {
        Some((a, b)) => a.lock().cancel_requested && b.lock().cancel_requested,
        None => false,
      }
    };
    if both_cancelled {
      source.lock().do_cancel();
    }
  }
  return Ok(());
}

/// Two fresh streams independently consuming the source.
pub fn tee(table: &ResourceTable, id: u64) -> HostResult<(u64, u64)> {
  let handle = stream_handle(table, id)?;

  let mut inner = handle.lock();
  if inner.branches.is_some() {
    return Err(HostError::invalid_input("stream is already teed"));
  }
  if let Some(err) = inner.error_of() {
    return Err(err);
  }

  let kind = inner.kind;
  let hwm = inner.hwm;
  let phase = inner.phase.clone();
  let weak = Arc::downgrade(&handle);
  let branch = move |queue: VecDeque<Bytes>| -> StreamHandle {
    let mut state = StreamInner::new(kind, hwm);
    state.queued_bytes = queue.iter().map(Bytes::len).sum();
    state.queue = queue;
    state.phase = phase.clone();
    state.tee_source = Some(weak.clone());
    return Arc::new(Mutex::new(state));
  };

  // Chunks already queued on the source are replayed on both branches so a
  // branch started later still observes the full sequence.
  let queue_a = inner.queue.clone();
  let queue_b = std::mem::take(&mut inner.queue);
  let a = branch(queue_a);
  let b = branch(queue_b);
  inner.queued_bytes = 0;
  inner.branches = Some((a.clone(), b.clone()));
  drop(inner);

  let a_id = table.insert(Resource::ReadableStream(a));
  let b_id = table.insert(Resource::ReadableStream(b));
  return Ok((a_id, b_id));
}

async fn read_wait(wait: ReadWait) -> HostResult<ReadOutcome> {
  return match wait {
    ReadWait::Ready(outcome) => Ok(outcome),
    ReadWait::Pending(receiver) => await_completion(receiver).await,
  };
}

fn outcome_json(outcome: ReadOutcome) -> serde_json::Value {
  return serde_json::json!({
    "value": outcome.chunk.map(|c| encode_bytes(&c)),
    "done": outcome.done,
  });
}

pub(crate) fn register(
  runtime: &mut rustyscript::Runtime,
  state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  {
    let state = state.clone();
    runtime.register_function("streams_create", move |args: &[serde_json::Value]| {
      let hwm: u32 = opt_arg(args, 0).unwrap_or(1);
      return Ok(create_stream(&state.resources, StreamKind::Default, hwm).into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("streams_createByob", move |args: &[serde_json::Value]| {
      let hwm: u32 = opt_arg(args, 0).unwrap_or(0);
      return Ok(create_stream(&state.resources, StreamKind::Bytes, hwm).into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("streams_enqueue", move |args: &[serde_json::Value]| {
      let id: u64 = get_arg(args, 0)?;
      let chunk = bytes_arg(args, 1)?;
      enqueue(&state.resources, id, Bytes::from(chunk))?;
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("streams_close", move |args: &[serde_json::Value]| {
      let id: u64 = get_arg(args, 0)?;
      close(&state.resources, id)?;
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("streams_error", move |args: &[serde_json::Value]| {
      let id: u64 = get_arg(args, 0)?;
      let reason: String = opt_arg(args, 1).unwrap_or_default();
      error_stream(&state.resources, id, reason)?;
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("streams_cancel", move |args: &[serde_json::Value]| {
      let id: u64 = get_arg(args, 0)?;
      cancel(&state.resources, id)?;
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("streams_read", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let id: u64 = get_arg(&args, 0)?;
        let token: Option<u64> = opt_arg(&args, 1);

        let wait = stream_handle(&state.resources, id)?.lock().start_read(token)?;
        let outcome = read_wait(wait).await?;
        return Ok(outcome_json(outcome));
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("streams_byobReaderRead", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let id: u64 = get_arg(&args, 0)?;
        let length: usize = get_arg(&args, 1)?;
        let token: Option<u64> = opt_arg(&args, 2);

        let wait = stream_handle(&state.resources, id)?
          .lock()
          .start_pull_into(token, length, 1)?;
        let outcome = read_wait(wait).await?;
        return Ok(outcome_json(outcome));
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("streams_pullInto", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let id: u64 = get_arg(&args, 0)?;
        let length: usize = get_arg(&args, 1)?;
        let element_size: usize = opt_arg(&args, 2).unwrap_or(1);
        let token: Option<u64> = opt_arg(&args, 3);

        let wait = stream_handle(&state.resources, id)?
          .lock()
          .start_pull_into(token, length, element_size)?;
        let outcome = read_wait(wait).await?;
        return Ok(outcome_json(outcome));
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("streams_respond", move |args: &[serde_json::Value]| {
      let id: u64 = get_arg(args, 0)?;
      let data = bytes_arg(args, 1)?;
      stream_handle(&state.resources, id)?.lock().respond(&data, false)?;
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("streams_respondWithNewView", move |args: &[serde_json::Value]| {
      let id: u64 = get_arg(args, 0)?;
      let data = bytes_arg(args, 1)?;
      stream_handle(&state.resources, id)?.lock().respond(&data, true)?;
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("streams_lock", move |args: &[serde_json::Value]| {
      let id: u64 = get_arg(args, 0)?;
      let token = stream_handle(&state.resources, id)?.lock().lock()?;
      return Ok(token.into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("streams_unlock", move |args: &[serde_json::Value]| {
      let id: u64 = get_arg(args, 0)?;
      let token: u64 = get_arg(args, 1)?;
      stream_handle(&state.resources, id)?.lock().unlock(token)?;
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("streams_getState", move |args: &[serde_json::Value]| {
      let id: u64 = get_arg(args, 0)?;
      let name = stream_handle(&state.resources, id)?.lock().state_name();
      return Ok(name.into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("streams_getChunkCount", move |args: &[serde_json::Value]| {
      let id: u64 = get_arg(args, 0)?;
      let n = stream_handle(&state.resources, id)?.lock().chunk_count();
      return Ok((n as u64).into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("streams_setDesiredSize", move |args: &[serde_json::Value]| {
      let id: u64 = get_arg(args, 0)?;
      let v: i64 = get_arg(args, 1)?;
      stream_handle(&state.resources, id)?.lock().set_desired_size(v);
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("streams_getDesiredSize", move |args: &[serde_json::Value]| {
      let id: u64 = get_arg(args, 0)?;
      let v = stream_handle(&state.resources, id)?.lock().desired_size();
      return Ok(v.into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("streams_tee", move |args: &[serde_json::Value]| {
      let id: u64 = get_arg(args, 0)?;
      let (a, b) = tee(&state.resources, id)?;
      return Ok(serde_json::json!([a, b]));
    })?;
  }

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  fn table_with_stream(kind: StreamKind) -> (ResourceTable, u64) {
    let table = ResourceTable::new();
    let id = create_stream(&table, kind, 4);
    return (table, id);
  }

  fn read_now(table: &ResourceTable, id: u64) -> ReadOutcome {
    match stream_handle(table, id).unwrap().lock().start_read(None).unwrap() {
      ReadWait::Ready(outcome) => outcome,
      ReadWait::Pending(_) => panic!("expected ready read"),
    }
  }

  #[test]
  fn test_queue_accounting() {
    let (table, id) = table_with_stream(StreamKind::Bytes);

    enqueue(&table, id, Bytes::from_static(b"abc")).unwrap();
    enqueue(&table, id, Bytes::from_static(b"de")).unwrap();

    let handle = stream_handle(&table, id).unwrap();
    assert_eq!(2, handle.lock().chunk_count());
    assert_eq!(5, handle.lock().queued_bytes());
    assert_eq!(4 - 5, handle.lock().desired_size());

    assert_eq!(Some(Bytes::from_static(b"abc")), read_now(&table, id).chunk);
    assert_eq!(2, handle.lock().queued_bytes());
  }

  #[test]
  fn test_enqueue_after_close_fails() {
    let (table, id) = table_with_stream(StreamKind::Default);
    close(&table, id).unwrap();

    let err = enqueue(&table, id, Bytes::from_static(b"x")).unwrap_err();
    assert_eq!(ErrorKind::InvalidInput, err.kind);
  }

  #[test]
  fn test_close_drains_queue_then_done() {
    let (table, id) = table_with_stream(StreamKind::Default);
    enqueue(&table, id, Bytes::from_static(b"last")).unwrap();
    close(&table, id).unwrap();

    let first = read_now(&table, id);
    assert_eq!(Some(Bytes::from_static(b"last")), first.chunk);
    assert!(!first.done);

    assert!(read_now(&table, id).done);
  }

  #[tokio::test]
  async fn test_read_parks_until_enqueue() {
    let (table, id) = table_with_stream(StreamKind::Default);

    let wait = stream_handle(&table, id).unwrap().lock().start_read(None).unwrap();
    let ReadWait::Pending(receiver) = wait else {
      panic!("expected parked read");
    };

    enqueue(&table, id, Bytes::from_static(b"later")).unwrap();
    let outcome = await_completion(receiver).await.unwrap();
    assert_eq!(Some(Bytes::from_static(b"later")), outcome.chunk);
  }

  #[test]
  fn test_errored_read_rejects_with_reason() {
    let (table, id) = table_with_stream(StreamKind::Default);
    error_stream(&table, id, "boom".to_string()).unwrap();

    let err = stream_handle(&table, id)
      .unwrap()
      .lock()
      .start_read(None)
      .unwrap_err();
    assert_eq!("boom", err.message);
  }

  #[test]
  fn test_lock_excludes_other_readers() {
    let (table, id) = table_with_stream(StreamKind::Default);
    enqueue(&table, id, Bytes::from_static(b"x")).unwrap();

    let handle = stream_handle(&table, id).unwrap();
    let token = handle.lock().lock().unwrap();
    assert!(handle.lock().lock().is_err());

    assert!(handle.lock().start_read(None).is_err());
    assert!(handle.lock().start_read(Some(token)).is_ok());

    handle.lock().unlock(token).unwrap();
    assert!(handle.lock().start_read(None).is_ok());
  }

  #[test]
  fn test_tee_both_branches_observe_in_order() {
    let (table, id) = table_with_stream(StreamKind::Default);
    enqueue(&table, id, Bytes::from_static(b"A")).unwrap();

    // Branch two starts "later": chunk A was already queued on the source.
    let (b1, b2) = tee(&table, id).unwrap();
    enqueue(&table, id, Bytes::from_static(b"B")).unwrap();
    enqueue(&table, id, Bytes::from_static(b"C")).unwrap();

    for branch in [b1, b2] {
      let seen: Vec<Bytes> = (0..3).map(|_| read_now(&table, branch).chunk.unwrap()).collect();
      assert_eq!(
        vec![
          Bytes::from_static(b"A"),
          Bytes::from_static(b"B"),
          Bytes::from_static(b"C")
        ],
        seen
      );
    }
  }

  #[test]
  fn test_tee_cancel_semantics() {
    let (table, id) = table_with_stream(StreamKind::Default);
    let (b1, b2) = tee(&table, id).unwrap();

    cancel(&table, b1).unwrap();
    let source = stream_handle(&table, id).unwrap();
    assert_eq!("readable", source.lock().state_name());

    // Sibling still receives chunks.
    enqueue(&table, id, Bytes::from_static(b"x")).unwrap();
    assert_eq!(Some(Bytes::from_static(b"x")), read_now(&table, b2).chunk);

    cancel(&table, b2).unwrap();
    assert_eq!("closed", source.lock().state_name());
  }

  #[test]
  fn test_byob_immediate_fill_respects_elements() {
    let (table, id) = table_with_stream(StreamKind::Bytes);
    enqueue(&table, id, Bytes::from_static(b"abcde")).unwrap();

    let handle = stream_handle(&table, id).unwrap();
    let wait = handle.lock().start_pull_into(None, 4, 4).unwrap();
    let ReadWait::Ready(outcome) = wait else {
      panic!("expected immediate fill");
    };
    assert_eq!(Some(Bytes::from_static(b"abcd")), outcome.chunk);

    // The odd tail stays queued for the next read.
    assert_eq!(1, handle.lock().queued_bytes());
  }

  #[tokio::test]
  async fn test_byob_respond_partial() {
    let (table, id) = table_with_stream(StreamKind::Bytes);
    let handle = stream_handle(&table, id).unwrap();

    let wait = handle.lock().start_pull_into(None, 8, 1).unwrap();
    let ReadWait::Pending(receiver) = wait else {
      panic!("expected parked pull-into");
    };

    // Over-long respond is rejected while the request stays outstanding.
    assert!(handle.lock().respond(&[0u8; 9], false).is_err());

    handle.lock().respond(b"xy", false).unwrap();
    let outcome = await_completion(receiver).await.unwrap();
    assert_eq!(Some(Bytes::from_static(b"xy")), outcome.chunk);

    // No request outstanding anymore.
    assert!(handle.lock().respond(b"z", false).is_err());
  }
}
