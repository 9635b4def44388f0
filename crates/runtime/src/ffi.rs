//! Dynamic library loading and typed foreign calls.
//!
//! Raw symbol pointers, libffi call frames, and the documented-unsafe
//! pointer reads all live here. Safety at the pointer-op surface is the
//! script's responsibility.

use libffi::middle::{Arg, Cif, CodePtr, Closure, Type};
use log::*;
use serde::Deserialize;
use std::collections::HashMap;
use std::ffi::c_void;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;

use crate::error::{ErrorKind, HostError, HostResult};
use crate::host::{HostState, get_arg, opt_arg};
use crate::pool::CancellationFlag;
use crate::resource::{Resource, ResourceKind, wrong_kind};
use crate::runtime::build_call_sync_js_function_message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NativeType {
  U8,
  I8,
  U16,
  I16,
  U32,
  I32,
  U64,
  I64,
  USize,
  ISize,
  F32,
  F64,
  Bool,
  Void,
  Pointer,
  Buffer,
  Function,
  Struct,
}

impl FromStr for NativeType {
  type Err = HostError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    return match s {
      "u8" => Ok(NativeType::U8),
      "i8" => Ok(NativeType::I8),
      "u16" => Ok(NativeType::U16),
      "i16" => Ok(NativeType::I16),
      "u32" => Ok(NativeType::U32),
      "i32" => Ok(NativeType::I32),
      "u64" => Ok(NativeType::U64),
      "i64" => Ok(NativeType::I64),
      "usize" => Ok(NativeType::USize),
      "isize" => Ok(NativeType::ISize),
      "f32" => Ok(NativeType::F32),
      "f64" => Ok(NativeType::F64),
      "bool" => Ok(NativeType::Bool),
      "void" => Ok(NativeType::Void),
      "pointer" => Ok(NativeType::Pointer),
      "buffer" => Ok(NativeType::Buffer),
      "function" => Ok(NativeType::Function),
      "struct" => Ok(NativeType::Struct),
      other => Err(HostError::invalid_input(format!("unknown native type '{other}'"))),
    };
  }
}

impl NativeType {
  fn ffi_type(&self) -> Type {
    return match self {
      NativeType::U8 | NativeType::Bool => Type::u8(),
      NativeType::I8 => Type::i8(),
      NativeType::U16 => Type::u16(),
      NativeType::I16 => Type::i16(),
      NativeType::U32 => Type::u32(),
      NativeType::I32 => Type::i32(),
      NativeType::U64 => Type::u64(),
      NativeType::I64 => Type::i64(),
      NativeType::USize => Type::usize(),
      NativeType::ISize => Type::isize(),
      NativeType::F32 => Type::f32(),
      NativeType::F64 => Type::f64(),
      NativeType::Void => Type::void(),
      // Structs and functions cross the boundary as pointers; field-level
      // struct layouts are the script's contract with the library.
      NativeType::Pointer | NativeType::Buffer | NativeType::Function | NativeType::Struct => {
        Type::pointer()
      }
    };
  }
}

#[derive(Debug, Clone)]
pub struct Signature {
  pub parameters: Vec<NativeType>,
  pub result: NativeType,
  pub nonblocking: bool,
}

impl Signature {
  fn cif(&self) -> Cif {
    return Cif::new(
      self.parameters.iter().map(NativeType::ffi_type),
      self.result.ffi_type(),
    );
  }
}

struct FfiSymbol {
  ptr: *mut c_void,
  signature: Signature,
  cif: Cif,
}

pub struct LoadedLibrary {
  // Keeps the dylib mapped for as long as any symbol pointer lives.
  _lib: libloading::Library,
  symbols: HashMap<String, FfiSymbol>,
}

// Symbol pointers are only dereferenced through libffi calls; sharing the
// addresses across threads is sound, using them is the caller's contract.
unsafe impl Send for LoadedLibrary {}
unsafe impl Sync for LoadedLibrary {}

#[derive(Clone)]
pub struct FfiLibResource {
  pub lib: Arc<LoadedLibrary>,
}

/// Storage slot for one marshalled argument; libffi borrows from here for
/// the duration of the call.
enum NativeValue {
  Scalar(u64),
  Float(f64),
  Float32(f32),
  Buffer(Vec<u8>, *mut c_void),
}

fn marshal_arg(ty: NativeType, value: &serde_json::Value) -> HostResult<NativeValue> {
  let as_u64 = |v: &serde_json::Value| -> HostResult<u64> {
    if let Some(n) = v.as_u64() {
      return Ok(n);
    }
    if let Some(n) = v.as_i64() {
      return Ok(n as u64);
    }
    if let Some(serde_json::Value::String(s)) = v.get("__bigint") {
      return s
        .parse::<i64>()
        .map(|n| n as u64)
        .map_err(|_| HostError::type_mismatch(format!("bigint out of range: {s}")));
    }
    return Err(HostError::type_mismatch(format!("expected integer, got {v}")));
  };

  return Ok(match ty {
    NativeType::Bool => NativeValue::Scalar(value.as_bool().map(u64::from).ok_or_else(|| {
      HostError::type_mismatch(format!("expected bool, got {value}"))
    })?),
    NativeType::U8
    | NativeType::I8
    | NativeType::U16
    | NativeType::I16
    | NativeType::U32
    | NativeType::I32
    | NativeType::U64
    | NativeType::I64
    | NativeType::USize
    | NativeType::ISize
    | NativeType::Pointer
    | NativeType::Function => NativeValue::Scalar(as_u64(value)?),
    NativeType::F32 => NativeValue::Float32(
      value
        .as_f64()
        .ok_or_else(|| HostError::type_mismatch("expected float"))? as f32,
    ),
    NativeType::F64 => NativeValue::Float(
      value
        .as_f64()
        .ok_or_else(|| HostError::type_mismatch("expected float"))?,
    ),
    NativeType::Buffer | NativeType::Struct => {
      NativeValue::Buffer(crate::host::decode_bytes(value)?, std::ptr::null_mut())
    }
    NativeType::Void => {
      return Err(HostError::type_mismatch("void is not a parameter type"));
    }
  });
}

/// Perform one foreign call. The caller validated arity.
fn call_symbol(symbol: &FfiSymbol, args: &[serde_json::Value]) -> HostResult<serde_json::Value> {
  let mut storage: Vec<NativeValue> = symbol
    .signature
    .parameters
    .iter()
    .zip(args.iter())
    .map(|(ty, value)| marshal_arg(*ty, value))
    .collect::<HostResult<_>>()?;

  // Buffer pointers are taken after storage stopped moving.
  for slot in storage.iter_mut() {
    if let NativeValue::Buffer(data, ptr) = slot {
      *ptr = data.as_mut_ptr() as *mut c_void;
    }
  }

  let call_args: Vec<Arg> = storage
    .iter()
    .map(|slot| match slot {
      NativeValue::Scalar(v) => Arg::new(v),
      NativeValue::Float(v) => Arg::new(v),
      NativeValue::Float32(v) => Arg::new(v),
      NativeValue::Buffer(_, ptr) => Arg::new(ptr),
    })
    .collect();

  let code = CodePtr(symbol.ptr);
  let result = unsafe {
    match symbol.signature.result {
      NativeType::Void => {
        symbol.cif.call::<()>(code, &call_args);
        serde_json::Value::Null
      }
      NativeType::Bool => serde_json::json!(symbol.cif.call::<u8>(code, &call_args) != 0),
      NativeType::U8 => serde_json::json!(symbol.cif.call::<u8>(code, &call_args)),
      NativeType::I8 => serde_json::json!(symbol.cif.call::<i8>(code, &call_args)),
      NativeType::U16 => serde_json::json!(symbol.cif.call::<u16>(code, &call_args)),
      NativeType::I16 => serde_json::json!(symbol.cif.call::<i16>(code, &call_args)),
      NativeType::U32 => serde_json::json!(symbol.cif.call::<u32>(code, &call_args)),
      NativeType::I32 => serde_json::json!(symbol.cif.call::<i32>(code, &call_args)),
      NativeType::F32 => serde_json::json!(symbol.cif.call::<f32>(code, &call_args)),
      NativeType::F64 => serde_json::json!(symbol.cif.call::<f64>(code, &call_args)),
      NativeType::U64 | NativeType::USize => {
        big_to_json(symbol.cif.call::<u64>(code, &call_args) as i64)
      }
      NativeType::I64 | NativeType::ISize => {
        big_to_json(symbol.cif.call::<i64>(code, &call_args))
      }
      NativeType::Pointer | NativeType::Function | NativeType::Buffer | NativeType::Struct => {
        big_to_json(symbol.cif.call::<*mut c_void>(code, &call_args) as usize as i64)
      }
    }
  };
  return Ok(result);
}

const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

fn big_to_json(v: i64) -> serde_json::Value {
  if v.abs() > MAX_SAFE_INTEGER {
    return serde_json::json!({ "__bigint": v.to_string() });
  }
  return serde_json::json!(v);
}

unsafe fn read_native(ty: NativeType, ptr: *const c_void) -> serde_json::Value {
  unsafe {
    return match ty {
      NativeType::Bool => serde_json::json!(*(ptr as *const u8) != 0),
      NativeType::U8 => serde_json::json!(*(ptr as *const u8)),
      NativeType::I8 => serde_json::json!(*(ptr as *const i8)),
      NativeType::U16 => serde_json::json!(*(ptr as *const u16)),
      NativeType::I16 => serde_json::json!(*(ptr as *const i16)),
      NativeType::U32 => serde_json::json!(*(ptr as *const u32)),
      NativeType::I32 => serde_json::json!(*(ptr as *const i32)),
      NativeType::F32 => serde_json::json!(*(ptr as *const f32)),
      NativeType::F64 => serde_json::json!(*(ptr as *const f64)),
      NativeType::U64 | NativeType::USize => big_to_json(*(ptr as *const u64) as i64),
      NativeType::I64 | NativeType::ISize => big_to_json(*(ptr as *const i64)),
      NativeType::Pointer | NativeType::Function | NativeType::Buffer | NativeType::Struct => {
        big_to_json(*(ptr as *const usize) as i64)
      }
      NativeType::Void => serde_json::Value::Null,
    };
  }
}

struct CallbackData {
  callback_key: u64,
  signature: Signature,
  loop_sender: kanal::AsyncSender<crate::runtime::Message>,
  io: tokio::runtime::Handle,
  script_thread: Option<std::thread::ThreadId>,
}

/// Native trampoline backing an `UnsafeCallback`. Invocations are posted
/// to the script thread; the caller blocks until the script returns.
pub struct CallbackTrampoline {
  /// Adjusted in place by ref/unref.
  pub refcount: AtomicUsize,
  pub code_addr: usize,
  // Declared before `data`: the closure borrows it and must drop first.
  _closure: Closure<'static>,
  _data: Box<CallbackData>,
}

unsafe impl Send for CallbackTrampoline {}
unsafe impl Sync for CallbackTrampoline {}

#[derive(Clone)]
pub struct FfiCallbackResource {
  pub trampoline: Arc<CallbackTrampoline>,
}

unsafe extern "C" fn callback_trampoline(
  _cif: &libffi::low::ffi_cif,
  result: &mut u64,
  args: *const *const c_void,
  data: &CallbackData,
) {
  *result = 0;

  // Re-entry from a synchronous call on the script thread would deadlock
  // the loop; cross-thread invocations (pool, foreign threads) work.
  if data.script_thread == Some(std::thread::current().id()) {
    error!("synchronous FFI callback re-entry is unsupported; returning zero");
    return;
  }

  let json_args: Vec<serde_json::Value> = data
    .signature
    .parameters
    .iter()
    .enumerate()
    .map(|(i, ty)| unsafe { read_native(*ty, *args.add(i)) })
    .collect();

  let (sender, receiver) = oneshot::channel::<Result<serde_json::Value, rustyscript::Error>>();
  let message = build_call_sync_js_function_message::<serde_json::Value>(
    None,
    "__dispatchFfiCallback",
    (data.callback_key, json_args),
    move |value_or| {
      let _ = sender.send(value_or);
    },
  );

  if data.io.block_on(data.loop_sender.send(message)).is_err() {
    error!("FFI callback dispatch failed: loop is gone");
    return;
  }

  match receiver.blocking_recv() {
    Ok(Ok(value)) => {
      let bits = match data.signature.result {
        NativeType::F64 => value.as_f64().unwrap_or_default().to_bits(),
        NativeType::F32 => u64::from((value.as_f64().unwrap_or_default() as f32).to_bits()),
        NativeType::Bool => u64::from(value.as_bool().unwrap_or_default()),
        NativeType::Void => 0,
        _ => value
          .as_i64()
          .or_else(|| value.as_u64().map(|v| v as i64))
          .unwrap_or_default() as u64,
      };
      *result = bits;
    }
    Ok(Err(err)) => error!("FFI callback failed: {err}"),
    Err(_) => error!("FFI callback reply dropped"),
  };
}

#[derive(Deserialize)]
struct SymbolDefinition {
  parameters: Vec<String>,
  result: String,
  #[serde(default)]
  nonblocking: bool,
}

fn parse_signature(def: &SymbolDefinition) -> HostResult<Signature> {
  return Ok(Signature {
    parameters: def
      .parameters
      .iter()
      .map(|p| p.parse())
      .collect::<HostResult<_>>()?,
    result: def.result.parse()?,
    nonblocking: def.nonblocking,
  });
}

fn lib_by_rid(state: &HostState, rid: u64) -> HostResult<Arc<LoadedLibrary>> {
  return state.resources.with_entry(rid, |r| match r {
    Resource::FfiLib(lib) => Ok(lib.lib.clone()),
    other => Err(wrong_kind(rid, ResourceKind::FfiLib, other.kind())),
  });
}

fn callback_by_rid(state: &HostState, rid: u64) -> HostResult<Arc<CallbackTrampoline>> {
  return state.resources.with_entry(rid, |r| match r {
    Resource::FfiCallback(cb) => Ok(cb.trampoline.clone()),
    other => Err(wrong_kind(rid, ResourceKind::FfiCallback, other.kind())),
  });
}

fn check_arity(signature: &Signature, args: &[serde_json::Value]) -> HostResult<()> {
  if signature.parameters.len() != args.len() {
    return Err(HostError::invalid_input(format!(
      "expected {} arguments, got {}",
      signature.parameters.len(),
      args.len()
    )));
  }
  return Ok(());
}

fn require_ffi(state: &HostState) -> HostResult<()> {
  if !state.options.allow_ffi {
    return Err(HostError::new(ErrorKind::PermissionDenied, "FFI is disabled"));
  }
  return Ok(());
}

pub(crate) fn register(
  runtime: &mut rustyscript::Runtime,
  state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  {
    let state = state.clone();
    runtime.register_function("ffi_dlopen", move |args: &[serde_json::Value]| {
      require_ffi(&state)?;
      let path: String = get_arg(args, 0)?;
      let definitions: HashMap<String, SymbolDefinition> = get_arg(args, 1)?;

      let lib = unsafe { libloading::Library::new(&path) }.map_err(|err| {
        HostError::new(ErrorKind::NotFound, format!("dlopen '{path}': {err}"))
      })?;

      let mut symbols = HashMap::new();
      for (name, def) in &definitions {
        let signature = parse_signature(def)?;
        let ptr = unsafe {
          lib
            .get::<*mut c_void>(name.as_bytes())
            .map(|symbol| symbol.try_as_raw_ptr().unwrap_or(std::ptr::null_mut()))
            .map_err(|err| {
              HostError::new(ErrorKind::NotFound, format!("symbol '{name}': {err}"))
            })?
        };
        let cif = signature.cif();
        symbols.insert(
          name.clone(),
          FfiSymbol {
            ptr,
            signature,
            cif,
          },
        );
      }

      let rid = state.resources.insert(Resource::FfiLib(FfiLibResource {
        lib: Arc::new(LoadedLibrary { _lib: lib, symbols }),
      }));
      return Ok(rid.into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("ffi_call", move |args: &[serde_json::Value]| {
      require_ffi(&state)?;
      let rid: u64 = get_arg(args, 0)?;
      let name: String = get_arg(args, 1)?;
      let call_args: Vec<serde_json::Value> = opt_arg(args, 2).unwrap_or_default();

      let lib = lib_by_rid(&state, rid)?;
      let symbol = lib
        .symbols
        .get(&name)
        .ok_or_else(|| HostError::new(ErrorKind::NotFound, format!("symbol '{name}'")))?;
      check_arity(&symbol.signature, &call_args)?;

      return Ok(call_symbol(symbol, &call_args)?);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("ffi_call_nonblocking", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        require_ffi(&state)?;
        let rid: u64 = get_arg(&args, 0)?;
        let name: String = get_arg(&args, 1)?;
        let call_args: Vec<serde_json::Value> = opt_arg(&args, 2).unwrap_or_default();

        let lib = lib_by_rid(&state, rid)?;
        {
          let symbol = lib
            .symbols
            .get(&name)
            .ok_or_else(|| HostError::new(ErrorKind::NotFound, format!("symbol '{name}'")))?;
          check_arity(&symbol.signature, &call_args)?;
        }

        let receiver = state.pool.submit(CancellationFlag::new(), move |_flag| {
          let symbol = lib
            .symbols
            .get(&name)
            .ok_or_else(|| HostError::new(ErrorKind::NotFound, format!("symbol '{name}'")))?;
          return call_symbol(symbol, &call_args);
        });
        return Ok(crate::bridge::await_completion(receiver).await?);
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("ffi_close", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      state.resources.remove(rid);
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("ffi_callback_create", move |args: &[serde_json::Value]| {
      require_ffi(&state)?;
      let callback_key: u64 = get_arg(args, 0)?;
      let definition: SymbolDefinition = get_arg(args, 1)?;
      let signature = parse_signature(&definition)?;

      let data = Box::new(CallbackData {
        callback_key,
        signature: signature.clone(),
        loop_sender: state.loop_sender.clone(),
        io: state.io.clone(),
        script_thread: state.script_thread.get().copied(),
      });
      // The closure borrows `data`; the box gives it a stable address and
      // the trampoline struct keeps both alive, closure first.
      let data_ref: &'static CallbackData =
        unsafe { &*(data.as_ref() as *const CallbackData) };
      let closure = Closure::new(signature.cif(), callback_trampoline, data_ref);
      let code_addr = *closure.code_ptr() as usize;

      let rid = state.resources.insert(Resource::FfiCallback(FfiCallbackResource {
        trampoline: Arc::new(CallbackTrampoline {
          refcount: AtomicUsize::new(1),
          code_addr,
          _closure: closure,
          _data: data,
        }),
      }));
      return Ok(serde_json::json!({ "rid": rid, "pointer": big_to_json(code_addr as i64) }));
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("ffi_callback_ref", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let trampoline = callback_by_rid(&state, rid)?;
      // Count adjusts in place; no new callback object is minted.
      let count = trampoline.refcount.fetch_add(1, Ordering::SeqCst) + 1;
      return Ok((count as u64).into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("ffi_callback_unref", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let trampoline = callback_by_rid(&state, rid)?;
      let previous = trampoline.refcount.load(Ordering::SeqCst);
      let count = if previous > 0 {
        trampoline.refcount.fetch_sub(1, Ordering::SeqCst) - 1
      } else {
        0
      };
      return Ok((count as u64).into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("ffi_callback_close", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      state.resources.remove(rid);
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    runtime.register_function("ffi_ptr_offset", move |args: &[serde_json::Value]| {
      let addr: u64 = get_arg(args, 0)?;
      let offset: i64 = get_arg(args, 1)?;
      return Ok(big_to_json(addr.wrapping_add_signed(offset) as i64));
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("ffi_ptr_read", move |args: &[serde_json::Value]| {
      require_ffi(&state)?;
      let addr: u64 = get_arg(args, 0)?;
      let ty: String = get_arg(args, 1)?;
      let offset: i64 = opt_arg(args, 2).unwrap_or(0);

      let ty: NativeType = ty.parse()?;
      let ptr = addr.wrapping_add_signed(offset) as *const c_void;
      if ptr.is_null() {
        return Err(HostError::invalid_input("null pointer read").into());
      }
      return Ok(unsafe { read_native(ty, ptr) });
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("ffi_ptr_read_cstring", move |args: &[serde_json::Value]| {
      require_ffi(&state)?;
      let addr: u64 = get_arg(args, 0)?;
      let offset: i64 = opt_arg(args, 1).unwrap_or(0);

      let ptr = addr.wrapping_add_signed(offset) as *const std::ffi::c_char;
      if ptr.is_null() {
        return Err(HostError::invalid_input("null pointer read").into());
      }
      let text = unsafe { std::ffi::CStr::from_ptr(ptr) }
        .to_string_lossy()
        .to_string();
      return Ok(text.into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("ffi_ptr_read_buffer", move |args: &[serde_json::Value]| {
      require_ffi(&state)?;
      let addr: u64 = get_arg(args, 0)?;
      let len: usize = get_arg(args, 1)?;
      let offset: i64 = opt_arg(args, 2).unwrap_or(0);

      let ptr = addr.wrapping_add_signed(offset) as *const u8;
      if ptr.is_null() {
        return Err(HostError::invalid_input("null pointer read").into());
      }
      let data = unsafe { std::slice::from_raw_parts(ptr, len) };
      return Ok(crate::host::encode_bytes(data).into());
    })?;
  }

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_signature_parsing() {
    let def = SymbolDefinition {
      parameters: vec!["u32".to_string(), "pointer".to_string(), "f64".to_string()],
      result: "i64".to_string(),
      nonblocking: true,
    };
    let signature = parse_signature(&def).unwrap();
    assert_eq!(
      vec![NativeType::U32, NativeType::Pointer, NativeType::F64],
      signature.parameters
    );
    assert_eq!(NativeType::I64, signature.result);
    assert!(signature.nonblocking);

    assert!("complex128".parse::<NativeType>().is_err());
  }

  #[test]
  fn test_marshal_rejects_type_mismatches() {
    assert!(marshal_arg(NativeType::U32, &serde_json::json!("text")).is_err());
    assert!(marshal_arg(NativeType::F64, &serde_json::json!(true)).is_err());
    assert!(marshal_arg(NativeType::Void, &serde_json::json!(0)).is_err());

    assert!(marshal_arg(NativeType::U32, &serde_json::json!(7)).is_ok());
    assert!(marshal_arg(NativeType::Bool, &serde_json::json!(true)).is_ok());
    assert!(
      marshal_arg(NativeType::I64, &serde_json::json!({ "__bigint": "9007199254740993" })).is_ok()
    );
  }

  #[test]
  fn test_big_to_json_tags_out_of_range() {
    assert_eq!(serde_json::json!(7), big_to_json(7));
    assert_eq!(
      serde_json::json!({ "__bigint": "9007199254740993" }),
      big_to_json(9_007_199_254_740_993)
    );
  }

  #[test]
  fn test_read_native_scalars() {
    let value: u32 = 0xdead;
    let json = unsafe { read_native(NativeType::U32, &value as *const u32 as *const c_void) };
    assert_eq!(serde_json::json!(0xdead), json);

    let value: f64 = 2.5;
    let json = unsafe { read_native(NativeType::F64, &value as *const f64 as *const c_void) };
    assert_eq!(serde_json::json!(2.5), json);
  }

  #[test]
  fn test_call_libc_symbol() {
    // abs(3) from the C runtime already linked into the test binary.
    let lib = unsafe { libloading::Library::new("libc.so.6") };
    let Ok(lib) = lib else {
      // Not a glibc platform; the call path is covered elsewhere.
      return;
    };
    let ptr = unsafe {
      lib
        .get::<*mut c_void>(b"abs")
        .unwrap()
        .try_as_raw_ptr()
        .unwrap()
    };

    let signature = Signature {
      parameters: vec![NativeType::I32],
      result: NativeType::I32,
      nonblocking: false,
    };
    let symbol = FfiSymbol {
      ptr,
      cif: signature.cif(),
      signature,
    };

    let result = call_symbol(&symbol, &[serde_json::json!(-5)]).unwrap();
    assert_eq!(serde_json::json!(5), result);
  }
}
