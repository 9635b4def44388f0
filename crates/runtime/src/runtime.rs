use futures_util::future::LocalBoxFuture;
use log::*;
use rustyscript::{deno_core::PollEventLoopOptions, init_platform, js_value::Promise};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing_subscriber::prelude::*;

use crate::host::{HostOptions, HostState, register_all};
use crate::timers::DueTimer;

pub use rustyscript::{Error, Module, ModuleHandle, Runtime};

type AnyError = Box<dyn std::error::Error + Send + Sync>;

#[allow(clippy::type_complexity)]
pub enum Message {
  Run(
    Option<Module>,
    Box<dyn (FnOnce(Option<&ModuleHandle>, &mut Runtime, &mut Vec<Box<dyn Completer>>)) + Send>,
  ),
  NotifyIdle(oneshot::Sender<()>),
}

/// Pending host→script call whose promise the loop keeps pumping until the
/// engine settles it.
pub trait Completer {
  fn is_ready(&self, runtime: &mut Runtime) -> bool;
  fn resolve<'a>(self: Box<Self>, runtime: &'a mut Runtime) -> LocalBoxFuture<'a, ()>;
}

pub struct CompleterImpl<T: serde::de::DeserializeOwned + Send + 'static> {
  /// Identifier for book-keeping.
  #[allow(unused)]
  pub name: String,
  /// Promise eventually resolved by the JS engine.
  pub promise: Promise<T>,
  /// Back channel to eventually resolve with the value from the promise above.
  pub resolver: Box<dyn FnOnce(Result<T, Error>) + Send>,
}

impl<T: serde::de::DeserializeOwned + Send + 'static> Completer for CompleterImpl<T> {
  fn is_ready(&self, runtime: &mut Runtime) -> bool {
    return !self.promise.is_pending(runtime);
  }

  fn resolve<'a>(self: Box<Self>, runtime: &'a mut Runtime) -> LocalBoxFuture<'a, ()> {
    let resolver = self.resolver;
    let promise = self.promise;
    Box::pin(async {
      resolver(promise.into_future(runtime).await);
    })
  }
}

pub fn build_call_sync_js_function_message<T>(
  module: Option<Module>,
  function_name: &'static str,
  args: impl serde::ser::Serialize + Send + 'static,
  resolver: impl FnOnce(Result<T, Error>) + Send + 'static,
) -> Message
where
  T: serde::de::DeserializeOwned + Send,
{
  return Message::Run(
    module,
    Box::new(
      move |module_handle, runtime: &mut Runtime, _completers: &mut Vec<Box<dyn Completer>>| {
        resolver(runtime.call_function_immediate::<T>(module_handle, function_name, &args));
      },
    ),
  );
}

pub fn build_call_async_js_function_message<T>(
  id: String,
  module: Option<Module>,
  function_name: &'static str,
  args: impl serde::ser::Serialize + Send + 'static,
  resolver: impl FnOnce(Result<T, Error>) + Send + 'static,
) -> Message
where
  T: serde::de::DeserializeOwned + Send + 'static,
{
  return Message::Run(
    module,
    Box::new(
      move |module_handle, runtime: &mut Runtime, completers: &mut Vec<Box<dyn Completer>>| {
        let promise_or =
          runtime.call_function_immediate::<Promise<T>>(module_handle, function_name, &args);

        match promise_or {
          Ok(promise) => {
            completers.push(Box::new(CompleterImpl::<T> {
              name: id,
              promise,
              resolver: Box::new(resolver),
            }));
          }
          Err(err) => resolver(Err(err)),
        };
      },
    ),
  );
}

struct ScriptThread {
  // Thread handle.
  handle: Option<std::thread::JoinHandle<()>>,

  sender: kanal::AsyncSender<Message>,

  state: Arc<HostState>,

  // Background runtime carrying network tasks; alive for the whole process.
  #[allow(unused)]
  io: tokio::runtime::Runtime,
}

impl Drop for ScriptThread {
  fn drop(&mut self) {
    if let Some(handle) = self.handle.take() {
      let _ = self.sender.close();
      if let Err(err) = handle.join() {
        error!("Failed to join script thread: {err:?}");
      }
    }
  }
}

impl ScriptThread {
  fn new(options: HostOptions) -> Self {
    let io = tokio::runtime::Builder::new_multi_thread()
      .worker_threads(2)
      .enable_all()
      .thread_name("andromeda-io")
      .build()
      .expect("startup");

    let (sender, receiver) = kanal::unbounded_async::<Message>();

    let state = match HostState::new(options, sender.clone(), io.handle().clone()) {
      Ok(state) => state,
      // Fatal host initialization: one-line diagnostic, then exit.
      Err(err) => panic!("host initialization failed: {err}"),
    };

    let thread_state = state.clone();
    let handle = std::thread::Builder::new()
      .name("andromeda-script".to_string())
      .spawn(move || {
        // swc_ecma_codegen is very spammy (or at least used to be):
        //   https://github.com/swc-project/swc/pull/9604
        tracing_subscriber::Registry::default()
          .with(tracing_subscriber::filter::Targets::new().with_target(
            "tracing::span",
            tracing_subscriber::filter::LevelFilter::WARN,
          ))
          .set_default();

        init_platform(1, true);

        let tokio_runtime = std::rc::Rc::new(
          tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .enable_io()
            .thread_name("andromeda-script-rt")
            .build()
            .expect("startup"),
        );

        let mut js_runtime = match init_runtime(tokio_runtime, &thread_state) {
          Ok(js_runtime) => js_runtime,
          Err(err) => {
            panic!("Failed to init v8 runtime: {err}");
          }
        };

        event_loop(&mut js_runtime, receiver, thread_state);
      })
      .expect("startup");

    return ScriptThread {
      handle: Some(handle),
      sender,
      state,
      io,
    };
  }
}

fn init_runtime(
  tokio_runtime: std::rc::Rc<tokio::runtime::Runtime>,
  state: &Arc<HostState>,
) -> Result<Runtime, AnyError> {
  let mut runtime = rustyscript::Runtime::with_tokio_runtime(
    rustyscript::RuntimeOptions {
      import_provider: Some(Box::new(crate::import_provider::ImportProvider)),
      schema_whlist: HashSet::from(["andromeda".to_string()]),
      ..Default::default()
    },
    tokio_runtime,
  )?;

  register_all(&mut runtime, state)?;

  return Ok(runtime);
}

#[inline]
async fn handle_message(
  runtime: &mut Runtime,
  msg: Message,
  completers: &mut Vec<Box<dyn Completer>>,
  idle_waiters: &mut Vec<oneshot::Sender<()>>,
) -> Result<(), AnyError> {
  match msg {
    Message::Run(module, f) => {
      if let Some(module) = module {
        let module_handle = runtime.load_module_async(&module).await?;
        f(Some(&module_handle), runtime, completers);
      } else {
        f(None, runtime, completers);
      }
    }
    Message::NotifyIdle(sender) => idle_waiters.push(sender),
  }

  return Ok(());
}

fn dispatch_timer(
  runtime: &mut Runtime,
  state: &Arc<HostState>,
  due: DueTimer,
  completers: &mut Vec<Box<dyn Completer>>,
) {
  if !due.rearmed {
    // One-shot timers are gone once fired.
    state.resources.remove(due.id);
  }

  let started = Instant::now();
  let message = build_call_async_js_function_message::<serde_json::Value>(
    format!("timer-{}", due.id),
    None,
    "__dispatchTimer",
    [due.id],
    move |result| {
      if let Err(err) = result {
        error!(
          "Unhandled timer rejection after {:?}: {err}",
          started.elapsed()
        );
      }
    },
  );
  if let Message::Run(_module, f) = message {
    f(None, runtime, completers);
  }
}

/// The event loop on the script thread.
///
/// One tick: settle resolved completers, fire due timers (a macrotask
/// each), drain host microtasks, then wait on the earliest of timer
/// deadline / engine pump / incoming message. Exits when every handle to
/// the channel is gone.
fn event_loop(
  runtime: &mut Runtime,
  receiver: kanal::AsyncReceiver<Message>,
  state: Arc<HostState>,
) {
  const DURATION: Option<Duration> = Some(Duration::from_millis(25));
  const OPTS: PollEventLoopOptions = PollEventLoopOptions {
    wait_for_inspector: false,
    pump_v8_message_loop: true,
  };

  let _ = state.script_thread.set(std::thread::current().id());

  runtime.tokio_runtime().block_on(async {
    let mut completers: Vec<Box<dyn Completer>> = vec![];
    let mut idle_waiters: Vec<oneshot::Sender<()>> = vec![];

    loop {
      let completed_indexes = completers
        .iter()
        .enumerate()
        .filter_map(|(idx, completer)| {
          if completer.is_ready(runtime) {
            Some(idx)
          } else {
            None
          }
        })
        .collect::<Vec<_>>();

      for index in completed_indexes.into_iter().rev() {
        completers.swap_remove(index).resolve(runtime).await;
      }

      loop {
        let due = state.timers.lock().pop_due(Instant::now());
        match due {
          Some(due) => dispatch_timer(runtime, &state, due, &mut completers),
          None => break,
        };
      }

      // Host-scheduled microtasks drain to completion between macrotasks.
      loop {
        let task = state.microtasks.lock().pop_front();
        match task {
          Some(task) => task(runtime, &mut completers),
          None => break,
        };
      }

      let busy = !completers.is_empty() || state.pending_ops.count() > 0;

      if !idle_waiters.is_empty()
        && !busy
        && !state.timers.lock().has_active()
        && state.keepalive.count() == 0
        && state.microtasks.lock().is_empty()
      {
        for waiter in idle_waiters.drain(..) {
          let _ = waiter.send(());
        }
      }

      let next_deadline = state.timers.lock().next_deadline();
      let wakeup = tokio::time::sleep_until(
        next_deadline
          .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))
          .into(),
      );

      tokio::select! {
        _ = wakeup, if next_deadline.is_some() => {},
        // Keep pumping while host→script calls or async ops are in flight.
        result = runtime.await_event_loop(OPTS, DURATION), if busy => {
          if let Err(err) = result {
            error!("JS event loop: {err}");
          }
        },
        msg = receiver.recv() => {
          let Ok(msg) = msg else {
            // All handles are gone; shut down.
            return;
          };
          if let Err(err) = handle_message(runtime, msg, &mut completers, &mut idle_waiters).await {
            error!("Handle message: {err}");
          }
        },
      }
    }
  });
}

// NOTE: Repeated v8 initialization in one process segfaults, so the
// platform and its script thread are process-wide singletons.
fn get_runtime(options: Option<HostOptions>) -> &'static ScriptThread {
  static RUNTIME: OnceLock<ScriptThread> = OnceLock::new();
  return RUNTIME.get_or_init(move || ScriptThread::new(options.unwrap_or_default()));
}

#[derive(Clone)]
pub struct RuntimeHandle {
  runtime: &'static ScriptThread,
}

impl RuntimeHandle {
  #[allow(clippy::new_without_default)]
  pub fn new() -> Self {
    return Self {
      runtime: get_runtime(None),
    };
  }

  pub fn new_with_options(options: HostOptions) -> Self {
    return Self {
      runtime: get_runtime(Some(options)),
    };
  }

  pub fn state(&self) -> &Arc<HostState> {
    return &self.runtime.state;
  }

  pub async fn send(&self, msg: Message) -> Result<(), kanal::SendError> {
    return self.runtime.sender.send(msg).await;
  }

  /// Evaluate a module on the script thread; resolves once the module
  /// finished evaluating, including top-level await.
  pub async fn load_module(&self, module: Module) -> Result<(), AnyError> {
    let (sender, receiver) = oneshot::channel::<Result<(), AnyError>>();

    self
      .send(Message::Run(
        Some(module),
        Box::new(|module_handle, _runtime, _completers| {
          let _ = match module_handle {
            Some(_) => sender.send(Ok(())),
            None => sender.send(Err("Failed to load module".into())),
          };
        }),
      ))
      .await?;

    let _ = receiver.await.map_err(|err| {
      error!("Failed to await module loading: {err}");
      return err;
    })?;

    return Ok(());
  }

  /// Resolves when no scheduled work remains: no pending completions or
  /// in-flight ops, no live timers, and no keepalive resource (a live TCP
  /// listener keeps the loop up indefinitely).
  pub async fn wait_until_idle(&self) -> Result<(), AnyError> {
    let (sender, receiver) = oneshot::channel::<()>();
    self.send(Message::NotifyIdle(sender)).await?;
    receiver.await?;
    return Ok(());
  }

  /// Call a script function and await its promised result.
  pub async fn call_function<T>(
    &self,
    module: Option<Module>,
    function_name: &'static str,
    args: impl serde::ser::Serialize + Send + 'static,
  ) -> Result<T, AnyError>
  where
    T: serde::de::DeserializeOwned + Send + 'static,
  {
    let (sender, receiver) = oneshot::channel::<Result<T, Error>>();
    self
      .send(build_call_async_js_function_message(
        function_name.to_string(),
        module,
        function_name,
        args,
        move |result| {
          let _ = sender.send(result);
        },
      ))
      .await?;
    return Ok(receiver.await??);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_serial_tests() {
    // NOTE: needs to run serially, the v8 platform and its script thread
    // are process-wide singletons.
    test_runtime_apply().await;
    test_runtime_javascript().await;
    test_timer_dispatch().await;
    test_wait_until_idle().await;
  }

  async fn test_runtime_apply() {
    let (sender, receiver) = oneshot::channel::<i64>();

    let handle = RuntimeHandle::new();
    handle
      .send(Message::Run(
        None,
        Box::new(|_m, _rt, _c| {
          sender.send(5).unwrap();
        }),
      ))
      .await
      .unwrap();

    assert_eq!(5, receiver.await.unwrap());
  }

  async fn test_runtime_javascript() {
    let handle = RuntimeHandle::new();

    let module = Module::new(
      "module.js",
      r#"
        export function test_fun() {
          return "test0";
        }
      "#,
    );

    let (sender, receiver) = oneshot::channel::<Result<String, Error>>();
    handle
      .send(build_call_sync_js_function_message::<String>(
        Some(module),
        "test_fun",
        Vec::<serde_json::Value>::new(),
        move |value_or| {
          sender.send(value_or).unwrap();
        },
      ))
      .await
      .unwrap();

    assert_eq!("test0", receiver.await.unwrap().unwrap());
  }

  async fn test_timer_dispatch() {
    let handle = RuntimeHandle::new();

    handle
      .load_module(Module::new(
        "timers.js",
        r#"
          globalThis.__firedTimers = [];
          globalThis.__dispatchTimer = async (id) => {
            globalThis.__firedTimers.push(id);
          };
        "#,
      ))
      .await
      .unwrap();

    let state = handle.state().clone();
    let timer = |interval| {
      crate::resource::Resource::Timer(crate::resource::TimerResource { interval })
    };
    let a = state.resources.insert(timer(false));
    let b = state.resources.insert(timer(false));

    // Same deadline: insertion order decides.
    let deadline = Instant::now() + Duration::from_millis(10);
    {
      let mut timers = state.timers.lock();
      timers.insert(a, deadline, None);
      timers.insert(b, deadline, None);
    }

    handle.wait_until_idle().await.unwrap();

    let (sender, receiver) = oneshot::channel::<Result<Vec<u64>, Error>>();
    handle
      .send(build_call_sync_js_function_message::<Vec<u64>>(
        Some(Module::new(
          "read_timers.js",
          "export function read() { return globalThis.__firedTimers; }",
        )),
        "read",
        Vec::<serde_json::Value>::new(),
        move |value_or| {
          sender.send(value_or).unwrap();
        },
      ))
      .await
      .unwrap();

    assert_eq!(vec![a, b], receiver.await.unwrap().unwrap());
    // One-shot timers drop their resource once fired.
    assert!(!state.resources.contains(a));
  }

  async fn test_wait_until_idle() {
    let handle = RuntimeHandle::new();
    // No timers, no pending ops: resolves promptly.
    handle.wait_until_idle().await.unwrap();
  }
}
