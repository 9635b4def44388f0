use std::sync::Arc;

use crate::host::HostState;

fn platform() -> &'static str {
  return match std::env::consts::OS {
    "macos" => "MacIntel",
    "windows" => "Win32",
    _ => "Linux x86_64",
  };
}

pub(crate) fn register(
  runtime: &mut rustyscript::Runtime,
  state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  {
    let state = state.clone();
    runtime.register_function("navigator_info", move |_args: &[serde_json::Value]| {
      return Ok(serde_json::json!({
        "userAgent": state.options.user_agent,
        "platform": platform(),
        "language": "en-US",
        "languages": ["en-US", "en"],
        "hardwareConcurrency": std::thread::available_parallelism().map_or(1, |n| n.get()),
        "brands": [
          { "brand": "Andromeda", "version": env!("CARGO_PKG_VERSION") },
        ],
      }));
    })?;
  }
  {
    // Server hardware: report a full, charging battery.
    runtime.register_function("battery_info", move |_args: &[serde_json::Value]| {
      return Ok(serde_json::json!({
        "charging": true,
        "level": 1.0,
        "chargingTime": 0,
        "dischargingTime": serde_json::Value::Null,
      }));
    })?;
  }

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_platform_is_stable() {
    assert!(!platform().is_empty());
  }
}
