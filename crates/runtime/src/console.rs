use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::host::{HostState, get_arg, opt_arg};

const ANSI_RESET: &str = "\x1b[0m";

/// Host-side console bookkeeping: group depth, counters, timers.
pub struct ConsoleState {
  group_depth: usize,
  counters: HashMap<String, u64>,
  timers: HashMap<String, Instant>,
}

impl Default for ConsoleState {
  fn default() -> Self {
    return Self::new();
  }
}

impl ConsoleState {
  pub fn new() -> Self {
    return Self {
      group_depth: 0,
      counters: HashMap::new(),
      timers: HashMap::new(),
    };
  }

  pub fn indent(&self) -> usize {
    return self.group_depth;
  }

  pub fn group_start(&mut self) {
    self.group_depth += 1;
  }

  pub fn group_end(&mut self) {
    self.group_depth = self.group_depth.saturating_sub(1);
  }

  pub fn count(&mut self, label: &str) -> u64 {
    let counter = self.counters.entry(label.to_string()).or_insert(0);
    *counter += 1;
    return *counter;
  }

  /// `false` when the label never counted; caller warns, never raises.
  pub fn count_reset(&mut self, label: &str) -> bool {
    return self.counters.remove(label).is_some();
  }

  pub fn time_start(&mut self, label: &str) -> bool {
    if self.timers.contains_key(label) {
      return false;
    }
    self.timers.insert(label.to_string(), Instant::now());
    return true;
  }

  pub fn time_log(&self, label: &str) -> Option<f64> {
    return self
      .timers
      .get(label)
      .map(|start| start.elapsed().as_secs_f64() * 1000.0);
  }

  pub fn time_end(&mut self, label: &str) -> Option<f64> {
    return self
      .timers
      .remove(label)
      .map(|start| start.elapsed().as_secs_f64() * 1000.0);
  }
}

/// Render one value the way console output expects: bare strings at the
/// top level, quoted inside containers.
fn inspect(value: &serde_json::Value, nested: bool) -> String {
  return match value {
    serde_json::Value::Null => "null".to_string(),
    serde_json::Value::Bool(b) => b.to_string(),
    serde_json::Value::Number(n) => n.to_string(),
    serde_json::Value::String(s) => {
      if nested {
        format!("\"{s}\"")
      } else {
        s.clone()
      }
    }
    serde_json::Value::Array(items) => {
      let inner: Vec<String> = items.iter().map(|v| inspect(v, true)).collect();
      format!("[ {} ]", inner.join(", "))
    }
    serde_json::Value::Object(map) => {
      let inner: Vec<String> = map
        .iter()
        .map(|(k, v)| format!("{k}: {}", inspect(v, true)))
        .collect();
      format!("{{ {} }}", inner.join(", "))
    }
  };
}

fn number_of(value: &serde_json::Value) -> f64 {
  return match value {
    serde_json::Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
    serde_json::Value::String(s) => s.parse().unwrap_or(f64::NAN),
    serde_json::Value::Bool(b) => {
      if *b {
        1.0
      } else {
        0.0
      }
    }
    _ => f64::NAN,
  };
}

fn format_integer(value: &serde_json::Value) -> String {
  let n = number_of(value);
  if n.is_nan() {
    return "NaN".to_string();
  }
  return format!("{}", n.trunc() as i64);
}

/// Minimal CSS→ANSI mapping for `%c`: colors, background, bold, italic,
/// underline. Unknown declarations are ignored.
pub fn css_to_ansi(css: &str) -> String {
  let mut codes: Vec<String> = vec![];

  for declaration in css.split(';') {
    let Some((property, value)) = declaration.split_once(':') else {
      continue;
    };
    let property = property.trim().to_ascii_lowercase();
    let value = value.trim().to_ascii_lowercase();

    match property.as_str() {
      "color" => {
        if let Some(code) = color_code(&value, 30) {
          codes.push(code);
        }
      }
      "background-color" | "background" => {
        if let Some(code) = color_code(&value, 40) {
          codes.push(code);
        }
      }
      "font-weight" if value == "bold" => codes.push("1".to_string()),
      "font-style" if value == "italic" => codes.push("3".to_string()),
      "text-decoration" if value == "underline" => codes.push("4".to_string()),
      _ => {}
    }
  }

  if codes.is_empty() {
    return String::new();
  }
  return format!("\x1b[{}m", codes.join(";"));
}

fn color_code(value: &str, base: u8) -> Option<String> {
  let named = match value {
    "black" => Some(0),
    "red" => Some(1),
    "green" => Some(2),
    "yellow" => Some(3),
    "blue" => Some(4),
    "magenta" => Some(5),
    "cyan" => Some(6),
    "white" => Some(7),
    _ => None,
  };
  if let Some(offset) = named {
    return Some((base + offset).to_string());
  }

  // #rrggbb → 24-bit.
  if let Some(hex) = value.strip_prefix('#')
    && hex.len() == 6
    && let Ok(rgb) = u32::from_str_radix(hex, 16)
  {
    let target = if base == 30 { 38 } else { 48 };
    return Some(format!(
      "{target};2;{};{};{}",
      (rgb >> 16) & 0xff,
      (rgb >> 8) & 0xff,
      rgb & 0xff
    ));
  }
  return None;
}

/// Format with `%s %d %i %f %o %O %c` specifiers; leftover args append
/// space-separated. A `%c` directive pushes styling that is reset at the
/// end of the string.
pub fn format_message(args: &[serde_json::Value]) -> String {
  let Some(serde_json::Value::String(fmt)) = args.first() else {
    let parts: Vec<String> = args.iter().map(|v| inspect(v, false)).collect();
    return parts.join(" ");
  };

  let mut out = String::new();
  let mut styled = false;
  let mut next_arg = 1;
  let mut chars = fmt.chars().peekable();

  while let Some(c) = chars.next() {
    if c != '%' {
      out.push(c);
      continue;
    }
    let Some(directive) = chars.next() else {
      out.push('%');
      break;
    };

    let mut take = || {
      let arg = args.get(next_arg);
      next_arg += 1;
      return arg;
    };

    match directive {
      '%' => out.push('%'),
      's' => {
        if let Some(arg) = take() {
          out.push_str(&inspect(arg, false));
        }
      }
      'd' | 'i' => {
        if let Some(arg) = take() {
          out.push_str(&format_integer(arg));
        }
      }
      'f' => {
        if let Some(arg) = take() {
          out.push_str(&number_of(arg).to_string());
        }
      }
      'o' | 'O' => {
        if let Some(arg) = take() {
          out.push_str(&inspect(arg, true));
        }
      }
      'c' => {
        if let Some(serde_json::Value::String(css)) = take() {
          let ansi = css_to_ansi(css);
          if !ansi.is_empty() {
            out.push_str(&ansi);
            styled = true;
          }
        }
      }
      other => {
        out.push('%');
        out.push(other);
      }
    }
  }

  for arg in args.iter().skip(next_arg) {
    out.push(' ');
    out.push_str(&inspect(arg, false));
  }

  if styled {
    out.push_str(ANSI_RESET);
  }
  return out;
}

/// Monospace table in the console.table style: arrays of rows, columns
/// derived from object keys, an index column first.
pub fn render_table(data: &serde_json::Value) -> String {
  let rows: Vec<&serde_json::Value> = match data {
    serde_json::Value::Array(items) => items.iter().collect(),
    other => vec![other],
  };

  let mut columns: Vec<String> = vec![];
  for row in &rows {
    if let serde_json::Value::Object(map) = row {
      for key in map.keys() {
        if !columns.contains(key) {
          columns.push(key.clone());
        }
      }
    }
  }
  let has_values = rows.iter().any(|r| !r.is_object());

  let mut header: Vec<String> = vec!["(index)".to_string()];
  header.extend(columns.iter().cloned());
  if has_values {
    header.push("Values".to_string());
  }

  let mut body: Vec<Vec<String>> = vec![];
  for (index, row) in rows.iter().enumerate() {
    let mut cells = vec![index.to_string()];
    for column in &columns {
      cells.push(
        row
          .get(column)
          .map(|v| inspect(v, true))
          .unwrap_or_default(),
      );
    }
    if has_values {
      cells.push(if row.is_object() {
        String::new()
      } else {
        inspect(row, true)
      });
    }
    body.push(cells);
  }

  let mut widths: Vec<usize> = header.iter().map(String::len).collect();
  for row in &body {
    for (i, cell) in row.iter().enumerate() {
      widths[i] = widths[i].max(cell.len());
    }
  }

  let line = |left: &str, mid: &str, right: &str| {
    let spans: Vec<String> = widths.iter().map(|w| "─".repeat(w + 2)).collect();
    return format!("{left}{}{right}", spans.join(mid));
  };
  let render_row = |cells: &[String]| {
    let padded: Vec<String> = cells
      .iter()
      .enumerate()
      .map(|(i, c)| format!(" {c:^width$} ", width = widths[i]))
      .collect();
    return format!("│{}│", padded.join("│"));
  };

  let mut out = vec![line("┌", "┬", "┐"), render_row(&header), line("├", "┼", "┤")];
  for row in &body {
    out.push(render_row(row));
  }
  out.push(line("└", "┴", "┘"));
  return out.join("\n");
}

pub(crate) fn register(
  runtime: &mut rustyscript::Runtime,
  state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  {
    let state = state.clone();
    runtime.register_function("console_format", move |args: &[serde_json::Value]| {
      let parts: Vec<serde_json::Value> = get_arg(args, 0)?;
      let message = format_message(&parts);
      let indent = "  ".repeat(state.console.lock().indent());
      return Ok(format!("{indent}{message}").into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("console_group_start", move |_args: &[serde_json::Value]| {
      state.console.lock().group_start();
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("console_group_end", move |_args: &[serde_json::Value]| {
      state.console.lock().group_end();
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("console_indent", move |_args: &[serde_json::Value]| {
      return Ok((state.console.lock().indent() as u64).into());
    })?;
  }
  {
    runtime.register_function("console_clear", move |_args: &[serde_json::Value]| {
      // Clear screen plus cursor home.
      return Ok("\x1b[2J\x1b[H".into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("console_count", move |args: &[serde_json::Value]| {
      let label: String = opt_arg(args, 0).unwrap_or_else(|| "default".to_string());
      let count = state.console.lock().count(&label);
      return Ok(format!("{label}: {count}").into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("console_count_reset", move |args: &[serde_json::Value]| {
      let label: String = opt_arg(args, 0).unwrap_or_else(|| "default".to_string());
      // Unknown label: the caller prints a warning, nothing raises.
      return Ok(state.console.lock().count_reset(&label).into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("console_time", move |args: &[serde_json::Value]| {
      let label: String = opt_arg(args, 0).unwrap_or_else(|| "default".to_string());
      return Ok(state.console.lock().time_start(&label).into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("console_time_log", move |args: &[serde_json::Value]| {
      let label: String = opt_arg(args, 0).unwrap_or_else(|| "default".to_string());
      return Ok(match state.console.lock().time_log(&label) {
        Some(ms) => serde_json::json!(format!("{label}: {ms:.3}ms")),
        None => serde_json::Value::Null,
      });
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("console_time_end", move |args: &[serde_json::Value]| {
      let label: String = opt_arg(args, 0).unwrap_or_else(|| "default".to_string());
      return Ok(match state.console.lock().time_end(&label) {
        Some(ms) => serde_json::json!(format!("{label}: {ms:.3}ms")),
        None => serde_json::Value::Null,
      });
    })?;
  }
  {
    runtime.register_function("console_table", move |args: &[serde_json::Value]| {
      let data: serde_json::Value = get_arg(args, 0)?;
      return Ok(render_table(&data).into());
    })?;
  }
  {
    runtime.register_function("console_css_to_ansi", move |args: &[serde_json::Value]| {
      let css: String = get_arg(args, 0)?;
      return Ok(css_to_ansi(&css).into());
    })?;
  }

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_specifiers() {
    let message = format_message(&[
      serde_json::json!("%s scored %d points (%f avg)"),
      serde_json::json!("ada"),
      serde_json::json!(12.9),
      serde_json::json!(4.25),
    ]);
    assert_eq!("ada scored 12 points (4.25 avg)", message);
  }

  #[test]
  fn test_percent_escape_and_leftovers() {
    let message = format_message(&[
      serde_json::json!("100%% done"),
      serde_json::json!("extra"),
      serde_json::json!({"k": 1}),
    ]);
    assert_eq!("100% done extra { k: 1 }", message);
  }

  #[test]
  fn test_css_specifier_resets_at_end() {
    let message = format_message(&[
      serde_json::json!("%cwarning"),
      serde_json::json!("color: red; font-weight: bold"),
    ]);
    assert_eq!("\x1b[31;1mwarning\x1b[0m", message);
  }

  #[test]
  fn test_css_hex_color() {
    assert_eq!("\x1b[38;2;255;0;128m", css_to_ansi("color: #ff0080"));
    assert_eq!("", css_to_ansi("cursor: pointer"));
  }

  #[test]
  fn test_object_specifier_quotes_strings() {
    let message = format_message(&[serde_json::json!("%o"), serde_json::json!(["a", 1])]);
    assert_eq!("[ \"a\", 1 ]", message);
  }

  #[test]
  fn test_counters_and_timers() {
    let mut console = ConsoleState::new();
    assert_eq!(1, console.count("x"));
    assert_eq!(2, console.count("x"));
    assert!(console.count_reset("x"));
    assert!(!console.count_reset("x"));
    assert_eq!(1, console.count("x"));

    assert!(console.time_start("t"));
    assert!(!console.time_start("t"));
    assert!(console.time_log("t").is_some());
    assert!(console.time_end("t").is_some());
    assert!(console.time_end("t").is_none());
  }

  #[test]
  fn test_group_depth() {
    let mut console = ConsoleState::new();
    console.group_start();
    console.group_start();
    assert_eq!(2, console.indent());
    console.group_end();
    console.group_end();
    console.group_end();
    assert_eq!(0, console.indent());
  }

  #[test]
  fn test_table_layout() {
    let table = render_table(&serde_json::json!([
      { "name": "ada", "n": 1 },
      { "name": "grace", "n": 2 },
    ]));

    let lines: Vec<&str> = table.lines().collect();
    assert!(lines[0].starts_with('┌'));
    assert!(lines[1].contains("(index)"));
    assert!(lines[1].contains("name"));
    assert!(lines[3].contains("\"ada\""));
    assert!(lines.last().unwrap().starts_with('└'));
  }
}
