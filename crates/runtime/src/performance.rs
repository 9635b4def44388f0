use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{HostError, HostResult};
use crate::host::{HostState, get_arg, opt_arg};

/// Attribute names of the legacy navigation-timing interface; reserved,
/// marks may not shadow them.
const RESTRICTED_NAMES: &[&str] = &[
  "navigationStart",
  "unloadEventStart",
  "unloadEventEnd",
  "redirectStart",
  "redirectEnd",
  "fetchStart",
  "domainLookupStart",
  "domainLookupEnd",
  "connectStart",
  "connectEnd",
  "secureConnectionStart",
  "requestStart",
  "responseStart",
  "responseEnd",
  "domLoading",
  "domInteractive",
  "domContentLoadedEventStart",
  "domContentLoadedEventEnd",
  "domComplete",
  "loadEventStart",
  "loadEventEnd",
];

#[derive(Debug, Clone, PartialEq)]
pub struct PerfEntry {
  pub name: String,
  pub entry_type: &'static str,
  pub start_time: f64,
  pub duration: f64,
  pub detail: Option<serde_json::Value>,
}

impl PerfEntry {
  fn to_json(&self) -> serde_json::Value {
    return serde_json::json!({
      "name": self.name,
      "entryType": self.entry_type,
      "startTime": self.start_time,
      "duration": self.duration,
      "detail": self.detail,
    });
  }
}

/// Process-wide performance entry list with a monotonic time origin.
pub struct PerformanceState {
  origin: Instant,
  entries: Mutex<Vec<PerfEntry>>,
}

impl Default for PerformanceState {
  fn default() -> Self {
    return Self::new();
  }
}

impl PerformanceState {
  pub fn new() -> Self {
    return Self {
      origin: Instant::now(),
      entries: Mutex::new(vec![]),
    };
  }

  /// Monotonic milliseconds since `timeOrigin`.
  pub fn now(&self) -> f64 {
    return self.origin.elapsed().as_secs_f64() * 1000.0;
  }

  pub fn mark(
    &self,
    name: &str,
    start_time: Option<f64>,
    detail: Option<serde_json::Value>,
  ) -> HostResult<PerfEntry> {
    if RESTRICTED_NAMES.contains(&name) {
      return Err(HostError::invalid_input(format!(
        "'{name}' is a reserved navigation-timing name"
      )));
    }
    if start_time.is_some_and(|t| t < 0.0) {
      return Err(HostError::invalid_input("negative startTime"));
    }

    let entry = PerfEntry {
      name: name.to_string(),
      entry_type: "mark",
      start_time: start_time.unwrap_or_else(|| self.now()),
      duration: 0.0,
      detail,
    };
    self.entries.lock().push(entry.clone());
    return Ok(entry);
  }

  fn resolve_point(&self, value: &serde_json::Value) -> HostResult<f64> {
    if let Some(n) = value.as_f64() {
      return Ok(n);
    }
    if let Some(name) = value.as_str() {
      // Latest mark with that name wins.
      let entries = self.entries.lock();
      return entries
        .iter()
        .rev()
        .find(|e| e.entry_type == "mark" && e.name == name)
        .map(|e| e.start_time)
        .ok_or_else(|| HostError::invalid_input(format!("no mark named '{name}'")));
    }
    return Err(HostError::type_mismatch("expected mark name or timestamp"));
  }

  pub fn measure(
    &self,
    name: &str,
    start: Option<&serde_json::Value>,
    end: Option<&serde_json::Value>,
    detail: Option<serde_json::Value>,
  ) -> HostResult<PerfEntry> {
    let start_time = match start {
      Some(value) => self.resolve_point(value)?,
      None => 0.0,
    };
    let end_time = match end {
      Some(value) => self.resolve_point(value)?,
      None => self.now(),
    };

    let entry = PerfEntry {
      name: name.to_string(),
      entry_type: "measure",
      start_time,
      duration: end_time - start_time,
      detail,
    };
    self.entries.lock().push(entry.clone());
    return Ok(entry);
  }

  pub fn clear(&self, entry_type: &'static str, name: Option<&str>) {
    self
      .entries
      .lock()
      .retain(|e| e.entry_type != entry_type || name.is_some_and(|n| n != e.name));
  }

  pub fn entries(&self, name: Option<&str>, entry_type: Option<&str>) -> Vec<PerfEntry> {
    return self
      .entries
      .lock()
      .iter()
      .filter(|e| name.is_none_or(|n| n == e.name))
      .filter(|e| entry_type.is_none_or(|t| t == e.entry_type))
      .cloned()
      .collect();
  }
}

pub(crate) fn register(
  runtime: &mut rustyscript::Runtime,
  state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  {
    let state = state.clone();
    runtime.register_function("perf_now", move |_args: &[serde_json::Value]| {
      return Ok(state.performance.now().into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("perf_mark", move |args: &[serde_json::Value]| {
      let name: String = get_arg(args, 0)?;
      let options = args.get(1).cloned().unwrap_or(serde_json::Value::Null);

      let start_time = options.get("startTime").and_then(|v| v.as_f64());
      let detail = options.get("detail").filter(|v| !v.is_null()).cloned();
      let entry = state.performance.mark(&name, start_time, detail)?;
      return Ok(entry.to_json());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("perf_measure", move |args: &[serde_json::Value]| {
      let name: String = get_arg(args, 0)?;
      let start = args.get(1).filter(|v| !v.is_null());
      let end = args.get(2).filter(|v| !v.is_null());
      let detail = args.get(3).filter(|v| !v.is_null()).cloned();

      let entry = state.performance.measure(&name, start, end, detail)?;
      return Ok(entry.to_json());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("perf_clear_marks", move |args: &[serde_json::Value]| {
      let name: Option<String> = opt_arg(args, 0);
      state.performance.clear("mark", name.as_deref());
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("perf_clear_measures", move |args: &[serde_json::Value]| {
      let name: Option<String> = opt_arg(args, 0);
      state.performance.clear("measure", name.as_deref());
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("perf_get_entries", move |args: &[serde_json::Value]| {
      let name: Option<String> = opt_arg(args, 0);
      let entry_type: Option<String> = opt_arg(args, 1);
      let entries: Vec<serde_json::Value> = state
        .performance
        .entries(name.as_deref(), entry_type.as_deref())
        .iter()
        .map(PerfEntry::to_json)
        .collect();
      return Ok(serde_json::Value::Array(entries));
    })?;
  }

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_now_is_monotonic() {
    let perf = PerformanceState::new();
    let a = perf.now();
    let b = perf.now();
    assert!(b >= a);
    assert!(a >= 0.0);
  }

  #[test]
  fn test_restricted_names_rejected() {
    let perf = PerformanceState::new();
    assert!(perf.mark("unloadEventStart", None, None).is_err());
    assert!(perf.mark("myMark", None, None).is_ok());
  }

  #[test]
  fn test_measure_between_marks() {
    let perf = PerformanceState::new();
    perf.mark("start", Some(10.0), None).unwrap();
    perf.mark("start", Some(20.0), None).unwrap();
    perf.mark("end", Some(50.0), None).unwrap();

    // Latest mark with the name wins.
    let measure = perf
      .measure(
        "span",
        Some(&serde_json::json!("start")),
        Some(&serde_json::json!("end")),
        None,
      )
      .unwrap();
    assert_eq!(20.0, measure.start_time);
    assert_eq!(30.0, measure.duration);

    assert!(
      perf
        .measure("bad", Some(&serde_json::json!("missing")), None, None)
        .is_err()
    );
  }

  #[test]
  fn test_clear_and_filter() {
    let perf = PerformanceState::new();
    perf.mark("a", Some(1.0), None).unwrap();
    perf.mark("b", Some(2.0), None).unwrap();
    perf.measure("m", None, None, None).unwrap();

    assert_eq!(3, perf.entries(None, None).len());
    assert_eq!(2, perf.entries(None, Some("mark")).len());
    assert_eq!(1, perf.entries(Some("a"), None).len());

    perf.clear("mark", Some("a"));
    assert_eq!(1, perf.entries(None, Some("mark")).len());
    perf.clear("mark", None);
    assert_eq!(0, perf.entries(None, Some("mark")).len());
    assert_eq!(1, perf.entries(None, Some("measure")).len());
  }
}
