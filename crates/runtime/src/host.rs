use base64::prelude::*;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::bridge::Gauge;
use crate::data_dir::DataDir;
use crate::error::{HostError, HostResult};
use crate::fetch::policy::EmbedderPolicy;
use crate::pool::WorkPool;
use crate::resource::ResourceTable;
use crate::runtime::{Completer, Message};
use crate::timers::TimerWheel;

/// Host-scheduled microtask: runs on the script thread, drained to
/// completion between two macrotasks.
pub type Microtask =
  Box<dyn FnOnce(&mut rustyscript::Runtime, &mut Vec<Box<dyn Completer>>) + Send>;

#[derive(Clone, Debug)]
pub struct HostOptions {
  pub data_dir: DataDir,
  pub pool_threads: usize,
  pub user_agent: String,
  pub embedder_policy: EmbedderPolicy,
  /// Client origin used by the fetch security checks. `None` behaves like
  /// an opaque (file/about) caller.
  pub origin: Option<url::Url>,
  pub cli_args: Vec<String>,
  pub allow_ffi: bool,
}

impl Default for HostOptions {
  fn default() -> Self {
    return Self {
      data_dir: DataDir::default(),
      pool_threads: 4,
      user_agent: format!("Andromeda/{}", env!("CARGO_PKG_VERSION")),
      embedder_policy: EmbedderPolicy::UnsafeNone,
      origin: None,
      cli_args: vec![],
      allow_ffi: true,
    };
  }
}

/// Everything the host ops share. Ops run on the script thread; I/O tasks
/// and pool workers only reach in through the typed subsystem interfaces
/// and post outcomes back through the loop channel.
pub struct HostState {
  pub options: HostOptions,
  pub resources: ResourceTable,
  pub timers: Mutex<TimerWheel>,
  pub pool: WorkPool,
  /// In-flight async host ops; keeps the engine pumping.
  pub pending_ops: Gauge,
  /// Live resources that hold the loop up (TCP listeners, subscriptions).
  pub keepalive: Gauge,
  pub loop_sender: kanal::AsyncSender<Message>,
  pub microtasks: Mutex<VecDeque<Microtask>>,
  pub io: tokio::runtime::Handle,
  pub http: reqwest::Client,
  pub storage: crate::storage::StorageEngine,
  pub caches: crate::cache::CacheRegistry,
  pub locks: crate::locks::LockManager,
  pub broadcast: crate::broadcast::BroadcastHub,
  pub performance: crate::performance::PerformanceState,
  pub console: Mutex<crate::console::ConsoleState>,
  pub blob_urls: Mutex<HashMap<String, u64>>,
  /// AbortSignal-shaped tokens: the preamble registers a token with an
  /// async op, and `abort_trigger` flips the shared flag.
  cancellations: Mutex<HashMap<u64, crate::pool::CancellationFlag>>,
  /// Set once the event loop starts; FFI trampolines use it to refuse
  /// re-entrant synchronous callbacks that would deadlock the loop.
  pub script_thread: std::sync::OnceLock<std::thread::ThreadId>,
}

impl HostState {
  pub(crate) fn new(
    options: HostOptions,
    loop_sender: kanal::AsyncSender<Message>,
    io: tokio::runtime::Handle,
  ) -> HostResult<Arc<Self>> {
    options.data_dir.ensure_directory_structure()?;

    let storage = io.block_on(crate::storage::StorageEngine::open(&options.data_dir))?;

    let http = reqwest::Client::builder()
      .redirect(reqwest::redirect::Policy::none())
      .user_agent(options.user_agent.clone())
      .build()
      .map_err(|err| HostError::internal(format!("http client: {err}")))?;

    return Ok(Arc::new(Self {
      resources: ResourceTable::new(),
      timers: Mutex::new(TimerWheel::new()),
      pool: WorkPool::new(options.pool_threads),
      pending_ops: Gauge::new(),
      keepalive: Gauge::new(),
      loop_sender,
      microtasks: Mutex::new(VecDeque::new()),
      io,
      http,
      storage,
      caches: crate::cache::CacheRegistry::new(),
      locks: crate::locks::LockManager::new(),
      broadcast: crate::broadcast::BroadcastHub::new(),
      performance: crate::performance::PerformanceState::new(),
      console: Mutex::new(crate::console::ConsoleState::new()),
      blob_urls: Mutex::new(HashMap::new()),
      cancellations: Mutex::new(HashMap::new()),
      script_thread: std::sync::OnceLock::new(),
      options,
    }));
  }

  pub fn schedule_microtask(&self, task: Microtask) {
    self.microtasks.lock().push_back(task);
  }

  pub fn cancellation_register(&self, token: u64) -> crate::pool::CancellationFlag {
    return self.cancellations.lock().entry(token).or_default().clone();
  }

  pub fn cancellation_trigger(&self, token: u64) {
    if let Some(flag) = self.cancellations.lock().get(&token) {
      flag.cancel();
    }
  }

  pub fn cancellation_clear(&self, token: u64) {
    self.cancellations.lock().remove(&token);
  }
}

pub(crate) fn get_arg<T>(args: &[serde_json::Value], i: usize) -> Result<T, rustyscript::Error>
where
  T: serde::de::DeserializeOwned,
{
  use rustyscript::Error;
  let arg = args
    .get(i)
    .ok_or_else(|| Error::Runtime(format!("Range err {i} > {}", args.len())))?;
  return serde_json::from_value::<T>(arg.clone()).map_err(|err| Error::Runtime(err.to_string()));
}

/// `get_arg` flavor for code paths that work in `HostResult` end to end
/// (pool closures, shared sync/async op bodies).
pub(crate) fn arg<T>(args: &[serde_json::Value], i: usize) -> HostResult<T>
where
  T: serde::de::DeserializeOwned,
{
  let value = args
    .get(i)
    .ok_or_else(|| HostError::invalid_input(format!("missing argument {i}")))?;
  return serde_json::from_value::<T>(value.clone())
    .map_err(|err| HostError::type_mismatch(err.to_string()));
}

pub(crate) fn bytes_at(args: &[serde_json::Value], i: usize) -> HostResult<Vec<u8>> {
  let value = args
    .get(i)
    .ok_or_else(|| HostError::invalid_input(format!("missing argument {i}")))?;
  return decode_bytes(value);
}

pub(crate) fn opt_arg<T>(args: &[serde_json::Value], i: usize) -> Option<T>
where
  T: serde::de::DeserializeOwned,
{
  let arg = args.get(i)?;
  if arg.is_null() {
    return None;
  }
  return serde_json::from_value::<T>(arg.clone()).ok();
}

/// Byte payloads cross the bridge as base64 strings; plain number arrays
/// are accepted too since some preamble paths build them directly.
pub(crate) fn bytes_arg(args: &[serde_json::Value], i: usize) -> Result<Vec<u8>, rustyscript::Error> {
  use rustyscript::Error;
  let arg = args
    .get(i)
    .ok_or_else(|| Error::Runtime(format!("Range err {i} > {}", args.len())))?;
  return decode_bytes(arg).map_err(Into::into);
}

pub(crate) fn decode_bytes(value: &serde_json::Value) -> HostResult<Vec<u8>> {
  return match value {
    serde_json::Value::String(s) => BASE64_STANDARD
      .decode(s)
      .map_err(|err| HostError::type_mismatch(format!("invalid base64 payload: {err}"))),
    serde_json::Value::Array(items) => items
      .iter()
      .map(|v| {
        v.as_u64()
          .filter(|n| *n <= 255)
          .map(|n| n as u8)
          .ok_or_else(|| HostError::type_mismatch("byte array element out of range"))
      })
      .collect(),
    _ => Err(HostError::type_mismatch("expected bytes")),
  };
}

pub(crate) fn encode_bytes(data: &[u8]) -> String {
  return BASE64_STANDARD.encode(data);
}

/// Install the whole `HOST` surface onto a freshly initialized engine.
pub(crate) fn register_all(
  runtime: &mut rustyscript::Runtime,
  state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  {
    let state = state.clone();
    runtime.register_function("abort_trigger", move |args: &[serde_json::Value]| {
      let token: u64 = get_arg(args, 0)?;
      state.cancellation_trigger(token);
      return Ok(serde_json::Value::Null);
    })?;
  }

  crate::broadcast::register(runtime, state)?;
  crate::cache::register(runtime, state)?;
  crate::canvas::register(runtime, state)?;
  crate::clone::register(runtime, state)?;
  crate::console::register(runtime, state)?;
  crate::crypto::register(runtime, state)?;
  crate::fetch::register(runtime, state)?;
  crate::ffi::register(runtime, state)?;
  crate::fs_ops::register(runtime, state)?;
  crate::locks::register(runtime, state)?;
  crate::navigator::register(runtime, state)?;
  crate::performance::register(runtime, state)?;
  crate::process::register(runtime, state)?;
  crate::serve::register(runtime, state)?;
  crate::sqlite::register(runtime, state)?;
  crate::storage::register(runtime, state)?;
  crate::streams::register(runtime, state)?;
  crate::timers::register(runtime, state)?;
  crate::urls::register(runtime, state)?;
  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_bytes_roundtrip() {
    let encoded = encode_bytes(b"host core");
    let decoded = decode_bytes(&serde_json::Value::String(encoded)).unwrap();
    assert_eq!(b"host core".to_vec(), decoded);
  }

  #[test]
  fn test_bytes_from_number_array() {
    let decoded = decode_bytes(&serde_json::json!([104, 105])).unwrap();
    assert_eq!(b"hi".to_vec(), decoded);

    assert!(decode_bytes(&serde_json::json!([300])).is_err());
    assert!(decode_bytes(&serde_json::json!({})).is_err());
  }
}
