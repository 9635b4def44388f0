use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use crate::error::HostError;
use crate::host::{HostState, get_arg, opt_arg};

pub(crate) fn register(
  runtime: &mut rustyscript::Runtime,
  state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  {
    runtime.register_function("internal_print", move |args: &[serde_json::Value]| {
      let message: String = get_arg(args, 0)?;
      let newline: bool = opt_arg(args, 1).unwrap_or(true);

      let mut stdout = std::io::stdout().lock();
      let result = if newline {
        writeln!(stdout, "{message}")
      } else {
        write!(stdout, "{message}")
      };
      result.and_then(|()| stdout.flush()).map_err(HostError::from)?;
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    runtime.register_function("internal_print_err", move |args: &[serde_json::Value]| {
      let message: String = get_arg(args, 0)?;
      let newline: bool = opt_arg(args, 1).unwrap_or(true);

      let mut stderr = std::io::stderr().lock();
      let result = if newline {
        writeln!(stderr, "{message}")
      } else {
        write!(stderr, "{message}")
      };
      result.and_then(|()| stderr.flush()).map_err(HostError::from)?;
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    runtime.register_function("internal_read_line", move |_args: &[serde_json::Value]| {
      let mut line = String::new();
      let n = std::io::stdin()
        .read_line(&mut line)
        .map_err(HostError::from)?;
      if n == 0 {
        // EOF on stdin.
        return Ok(serde_json::Value::Null);
      }
      return Ok(line.trim_end_matches(['\r', '\n']).into());
    })?;
  }
  {
    runtime.register_function("env_get", move |args: &[serde_json::Value]| {
      let name: String = get_arg(args, 0)?;
      return Ok(match std::env::var(&name) {
        Ok(value) => value.into(),
        Err(_) => serde_json::Value::Null,
      });
    })?;
  }
  {
    runtime.register_function("env_set", move |args: &[serde_json::Value]| {
      let name: String = get_arg(args, 0)?;
      let value: String = get_arg(args, 1)?;
      if name.is_empty() || name.contains('=') || name.contains('\0') {
        return Err(HostError::invalid_input("invalid environment variable name").into());
      }
      // Single-threaded mutation contract is on the caller; script code
      // only runs on one thread.
      unsafe { std::env::set_var(&name, &value) };
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    runtime.register_function("env_delete", move |args: &[serde_json::Value]| {
      let name: String = get_arg(args, 0)?;
      unsafe { std::env::remove_var(&name) };
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    runtime.register_function("env_keys", move |_args: &[serde_json::Value]| {
      let keys: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
      return Ok(serde_json::json!(keys));
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("cli_args", move |_args: &[serde_json::Value]| {
      return Ok(serde_json::json!(state.options.cli_args));
    })?;
  }
  {
    runtime.register_function("exit", move |args: &[serde_json::Value]| {
      let code: i32 = opt_arg(args, 0).unwrap_or(0);
      std::process::exit(code);
      #[allow(unreachable_code)]
      Ok(serde_json::Value::Null)
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("sleep", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let ms: f64 = get_arg(&args, 0)?;
        if !ms.is_finite() || ms < 0.0 {
          return Err(HostError::invalid_input("negative sleep duration").into());
        }
        tokio::time::sleep(Duration::from_secs_f64(ms / 1000.0)).await;
        return Ok(serde_json::Value::Null);
      })
    })?;
  }

  return Ok(());
}
