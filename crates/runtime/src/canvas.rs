use base64::prelude::*;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{ErrorKind, HostError, HostResult};
use crate::host::{HostState, get_arg, opt_arg};
use crate::pool::CancellationFlag;
use crate::resource::{Resource, ResourceKind, wrong_kind};

pub type CanvasHandle = Arc<Mutex<CanvasContext>>;

#[derive(Debug, Clone)]
pub struct ImageBitmapResource {
  pub width: u32,
  pub height: u32,
  pub pixels: Arc<image::RgbaImage>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgba {
  pub r: u8,
  pub g: u8,
  pub b: u8,
  pub a: u8,
}

impl Rgba {
  const BLACK: Rgba = Rgba {
    r: 0,
    g: 0,
    b: 0,
    a: 255,
  };

  fn css(&self) -> String {
    if self.a == 255 {
      return format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b);
    }
    return format!(
      "rgba({}, {}, {}, {:.3})",
      self.r,
      self.g,
      self.b,
      f64::from(self.a) / 255.0
    );
  }
}

/// Small CSS color parser: #rgb/#rrggbb/#rrggbbaa, rgb()/rgba(), and the
/// basic named palette.
pub fn parse_color(input: &str) -> HostResult<Rgba> {
  let input = input.trim().to_ascii_lowercase();

  let named = |r, g, b| Ok(Rgba { r, g, b, a: 255 });
  match input.as_str() {
    "black" => return named(0, 0, 0),
    "white" => return named(255, 255, 255),
    "red" => return named(255, 0, 0),
    "green" => return named(0, 128, 0),
    "lime" => return named(0, 255, 0),
    "blue" => return named(0, 0, 255),
    "yellow" => return named(255, 255, 0),
    "cyan" | "aqua" => return named(0, 255, 255),
    "magenta" | "fuchsia" => return named(255, 0, 255),
    "gray" | "grey" => return named(128, 128, 128),
    "orange" => return named(255, 165, 0),
    "purple" => return named(128, 0, 128),
    "transparent" => {
      return Ok(Rgba {
        r: 0,
        g: 0,
        b: 0,
        a: 0,
      });
    }
    _ => {}
  }

  if let Some(hex) = input.strip_prefix('#') {
    let component = |s: &str| u8::from_str_radix(s, 16);
    return match hex.len() {
      3 => {
        let expand = |c: &str| component(&format!("{c}{c}"));
        Ok(Rgba {
          r: expand(&hex[0..1]).map_err(|_| bad_color(&input))?,
          g: expand(&hex[1..2]).map_err(|_| bad_color(&input))?,
          b: expand(&hex[2..3]).map_err(|_| bad_color(&input))?,
          a: 255,
        })
      }
      6 | 8 => Ok(Rgba {
        r: component(&hex[0..2]).map_err(|_| bad_color(&input))?,
        g: component(&hex[2..4]).map_err(|_| bad_color(&input))?,
        b: component(&hex[4..6]).map_err(|_| bad_color(&input))?,
        a: if hex.len() == 8 {
          component(&hex[6..8]).map_err(|_| bad_color(&input))?
        } else {
          255
        },
      }),
      _ => Err(bad_color(&input)),
    };
  }

  if let Some(body) = input
    .strip_prefix("rgba(")
    .or_else(|| input.strip_prefix("rgb("))
    .and_then(|s| s.strip_suffix(')'))
  {
    let parts: Vec<&str> = body.split(',').map(str::trim).collect();
    if parts.len() < 3 {
      return Err(bad_color(&input));
    }
    let channel = |s: &str| s.parse::<f64>().map(|v| v.clamp(0.0, 255.0) as u8);
    return Ok(Rgba {
      r: channel(parts[0]).map_err(|_| bad_color(&input))?,
      g: channel(parts[1]).map_err(|_| bad_color(&input))?,
      b: channel(parts[2]).map_err(|_| bad_color(&input))?,
      a: match parts.get(3) {
        Some(a) => {
          let alpha = a.parse::<f64>().map_err(|_| bad_color(&input))?;
          (alpha.clamp(0.0, 1.0) * 255.0).round() as u8
        }
        None => 255,
      },
    });
  }

  return Err(bad_color(&input));
}

fn bad_color(input: &str) -> HostError {
  return HostError::invalid_input(format!("invalid color '{input}'"));
}

#[derive(Debug, Clone)]
pub struct LinearGradient {
  pub x0: f64,
  pub y0: f64,
  pub x1: f64,
  pub y1: f64,
  pub stops: Vec<(f64, Rgba)>,
}

impl LinearGradient {
  fn color_at(&self, x: f64, y: f64) -> Rgba {
    if self.stops.is_empty() {
      return Rgba { r: 0, g: 0, b: 0, a: 0 };
    }

    let dx = self.x1 - self.x0;
    let dy = self.y1 - self.y0;
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq == 0.0 {
      0.0
    } else {
      (((x - self.x0) * dx + (y - self.y0) * dy) / len_sq).clamp(0.0, 1.0)
    };

    let mut prev = self.stops[0];
    for stop in &self.stops {
      if t <= stop.0 {
        let span = stop.0 - prev.0;
        let f = if span == 0.0 { 0.0 } else { (t - prev.0) / span };
        let lerp = |a: u8, b: u8| (f64::from(a) + (f64::from(b) - f64::from(a)) * f) as u8;
        return Rgba {
          r: lerp(prev.1.r, stop.1.r),
          g: lerp(prev.1.g, stop.1.g),
          b: lerp(prev.1.b, stop.1.b),
          a: lerp(prev.1.a, stop.1.a),
        };
      }
      prev = *stop;
    }
    return prev.1;
  }
}

#[derive(Debug, Clone)]
pub enum Paint {
  Color(Rgba),
  Gradient(usize),
}

#[derive(Debug, Clone)]
pub struct DrawState {
  pub fill_style: Paint,
  pub stroke_style: Paint,
  pub line_width: f64,
  pub global_alpha: f64,
}

impl Default for DrawState {
  fn default() -> Self {
    return Self {
      fill_style: Paint::Color(Rgba::BLACK),
      stroke_style: Paint::Color(Rgba::BLACK),
      line_width: 1.0,
      global_alpha: 1.0,
    };
  }
}

#[derive(Debug, Clone, Copy)]
enum PathCmd {
  MoveTo(f64, f64),
  LineTo(f64, f64),
  ClosePath,
}

pub struct CanvasContext {
  width: u32,
  height: u32,
  /// RGBA, row-major.
  pixels: Vec<u8>,
  state: DrawState,
  stack: Vec<DrawState>,
  path: Vec<PathCmd>,
  gradients: Vec<LinearGradient>,
}

impl CanvasContext {
  fn new(width: u32, height: u32) -> Self {
    return Self {
      width,
      height,
      pixels: vec![0; (width * height * 4) as usize],
      state: DrawState::default(),
      stack: vec![],
      path: vec![],
      gradients: vec![],
    };
  }

  fn paint_color(&self, paint: &Paint, x: f64, y: f64) -> Rgba {
    let mut color = match paint {
      Paint::Color(color) => *color,
      Paint::Gradient(id) => self
        .gradients
        .get(*id)
        .map(|g| g.color_at(x, y))
        .unwrap_or(Rgba::BLACK),
    };
    color.a = (f64::from(color.a) * self.state.global_alpha.clamp(0.0, 1.0)) as u8;
    return color;
  }

  fn blend_pixel(&mut self, x: i64, y: i64, color: Rgba) {
    if x < 0 || y < 0 || x >= i64::from(self.width) || y >= i64::from(self.height) {
      return;
    }
    let idx = ((y as u32 * self.width + x as u32) * 4) as usize;
    let alpha = f64::from(color.a) / 255.0;
    for (offset, channel) in [color.r, color.g, color.b].into_iter().enumerate() {
      let existing = f64::from(self.pixels[idx + offset]);
      self.pixels[idx + offset] =
        (f64::from(channel) * alpha + existing * (1.0 - alpha)).round() as u8;
    }
    let existing_a = f64::from(self.pixels[idx + 3]) / 255.0;
    self.pixels[idx + 3] = ((alpha + existing_a * (1.0 - alpha)) * 255.0).round() as u8;
  }

  pub fn fill_rect(&mut self, x: f64, y: f64, w: f64, h: f64) {
    let paint = self.state.fill_style.clone();
    for py in y.floor() as i64..(y + h).ceil() as i64 {
      for px in x.floor() as i64..(x + w).ceil() as i64 {
        let color = self.paint_color(&paint, px as f64, py as f64);
        self.blend_pixel(px, py, color);
      }
    }
  }

  pub fn clear_rect(&mut self, x: f64, y: f64, w: f64, h: f64) {
    for py in y.floor() as i64..(y + h).ceil() as i64 {
      for px in x.floor() as i64..(x + w).ceil() as i64 {
        if px < 0 || py < 0 || px >= i64::from(self.width) || py >= i64::from(self.height) {
          continue;
        }
        let idx = ((py as u32 * self.width + px as u32) * 4) as usize;
        self.pixels[idx..idx + 4].fill(0);
      }
    }
  }

  pub fn stroke_rect(&mut self, x: f64, y: f64, w: f64, h: f64) {
    let lw = self.state.line_width.max(1.0);
    let swap = std::mem::replace(&mut self.state.fill_style, self.state.stroke_style.clone());
    self.fill_rect(x - lw / 2.0, y - lw / 2.0, w + lw, lw);
    self.fill_rect(x - lw / 2.0, y + h - lw / 2.0, w + lw, lw);
    self.fill_rect(x - lw / 2.0, y, lw, h);
    self.fill_rect(x + w - lw / 2.0, y, lw, h);
    self.state.fill_style = swap;
  }

  pub fn begin_path(&mut self) {
    self.path.clear();
  }

  pub fn move_to(&mut self, x: f64, y: f64) {
    self.path.push(PathCmd::MoveTo(x, y));
  }

  pub fn line_to(&mut self, x: f64, y: f64) {
    self.path.push(PathCmd::LineTo(x, y));
  }

  pub fn close_path(&mut self) {
    self.path.push(PathCmd::ClosePath);
  }

  pub fn rect(&mut self, x: f64, y: f64, w: f64, h: f64) {
    self.move_to(x, y);
    self.line_to(x + w, y);
    self.line_to(x + w, y + h);
    self.line_to(x, y + h);
    self.close_path();
  }

  /// Arcs flatten into line segments at recording time.
  pub fn arc(&mut self, cx: f64, cy: f64, radius: f64, start: f64, end: f64) {
    const SEGMENTS: usize = 64;
    let sweep = end - start;
    for i in 0..=SEGMENTS {
      let angle = start + sweep * (i as f64 / SEGMENTS as f64);
      let x = cx + radius * angle.cos();
      let y = cy + radius * angle.sin();
      if i == 0 && self.path.is_empty() {
        self.move_to(x, y);
      } else {
        self.line_to(x, y);
      }
    }
  }

  fn subpaths(&self) -> Vec<Vec<(f64, f64)>> {
    let mut paths: Vec<Vec<(f64, f64)>> = vec![];
    let mut current: Vec<(f64, f64)> = vec![];
    for cmd in &self.path {
      match cmd {
        PathCmd::MoveTo(x, y) => {
          if current.len() > 1 {
            paths.push(std::mem::take(&mut current));
          } else {
            current.clear();
          }
          current.push((*x, *y));
        }
        PathCmd::LineTo(x, y) => current.push((*x, *y)),
        PathCmd::ClosePath => {
          if let Some(first) = current.first().copied() {
            current.push(first);
          }
        }
      }
    }
    if current.len() > 1 {
      paths.push(current);
    }
    return paths;
  }

  /// Even-odd scanline fill over the flattened subpaths.
  pub fn fill(&mut self) {
    let paths = self.subpaths();
    if paths.is_empty() {
      return;
    }
    let paint = self.state.fill_style.clone();

    for y in 0..self.height {
      let scan_y = f64::from(y) + 0.5;
      let mut crossings: Vec<f64> = vec![];
      for path in &paths {
        for window in path.windows(2) {
          let (x0, y0) = window[0];
          let (x1, y1) = window[1];
          if (y0 <= scan_y && y1 > scan_y) || (y1 <= scan_y && y0 > scan_y) {
            crossings.push(x0 + (scan_y - y0) / (y1 - y0) * (x1 - x0));
          }
        }
      }
      crossings.sort_by(|a, b| a.partial_cmp(b).expect("finite crossings"));

      for span in crossings.chunks_exact(2) {
        for x in span[0].round() as i64..span[1].round() as i64 {
          let color = self.paint_color(&paint, x as f64, scan_y);
          self.blend_pixel(x, y as i64, color);
        }
      }
    }
  }

  /// Stroke the recorded path with a square brush of `line_width`.
  pub fn stroke(&mut self) {
    let paths = self.subpaths();
    let paint = self.state.stroke_style.clone();
    let half = (self.state.line_width.max(1.0) / 2.0).ceil() as i64;

    for path in &paths {
      for window in path.windows(2) {
        let (x0, y0) = window[0];
        let (x1, y1) = window[1];
        let steps = ((x1 - x0).abs().max((y1 - y0).abs()).ceil() as usize).max(1);
        for i in 0..=steps {
          let t = i as f64 / steps as f64;
          let cx = x0 + (x1 - x0) * t;
          let cy = y0 + (y1 - y0) * t;
          for dy in -half..half.max(1) {
            for dx in -half..half.max(1) {
              let color = self.paint_color(&paint, cx, cy);
              self.blend_pixel(cx.round() as i64 + dx, cy.round() as i64 + dy, color);
            }
          }
        }
      }
    }
  }

  pub fn save(&mut self) {
    self.stack.push(self.state.clone());
  }

  pub fn restore(&mut self) {
    if let Some(state) = self.stack.pop() {
      self.state = state;
    }
  }

  pub fn pixel(&self, x: u32, y: u32) -> Option<Rgba> {
    if x >= self.width || y >= self.height {
      return None;
    }
    let idx = ((y * self.width + x) * 4) as usize;
    return Some(Rgba {
      r: self.pixels[idx],
      g: self.pixels[idx + 1],
      b: self.pixels[idx + 2],
      a: self.pixels[idx + 3],
    });
  }

  pub fn encode_png(&self) -> HostResult<Vec<u8>> {
    let image =
      image::RgbaImage::from_raw(self.width, self.height, self.pixels.clone()).ok_or_else(
        || HostError::internal("canvas buffer size mismatch"),
      )?;

    let mut out = std::io::Cursor::new(Vec::new());
    image
      .write_to(&mut out, image::ImageFormat::Png)
      .map_err(|err| HostError::internal(format!("png encode: {err}")))?;
    return Ok(out.into_inner());
  }
}

fn canvas_by_rid(state: &HostState, rid: u64) -> HostResult<CanvasHandle> {
  return state.resources.with_entry(rid, |r| match r {
    Resource::CanvasCtx(canvas) => Ok(canvas.clone()),
    other => Err(wrong_kind(rid, ResourceKind::CanvasCtx, other.kind())),
  });
}

fn paint_from_json(value: &serde_json::Value) -> HostResult<Paint> {
  if let Some(color) = value.as_str() {
    return Ok(Paint::Color(parse_color(color)?));
  }
  if let Some(id) = value.get("gradient").and_then(|v| v.as_u64()) {
    return Ok(Paint::Gradient(id as usize));
  }
  return Err(HostError::type_mismatch("expected color or gradient"));
}

fn paint_to_json(paint: &Paint) -> serde_json::Value {
  return match paint {
    Paint::Color(color) => color.css().into(),
    Paint::Gradient(id) => serde_json::json!({ "gradient": id }),
  };
}

pub(crate) fn register(
  runtime: &mut rustyscript::Runtime,
  state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  {
    let state = state.clone();
    runtime.register_function("canvas_create", move |args: &[serde_json::Value]| {
      let width: u32 = get_arg(args, 0)?;
      let height: u32 = get_arg(args, 1)?;
      if width == 0 || height == 0 || width > 16_384 || height > 16_384 {
        return Err(HostError::invalid_input("invalid canvas dimensions").into());
      }
      let rid = state
        .resources
        .insert(Resource::CanvasCtx(Arc::new(Mutex::new(CanvasContext::new(
          width, height,
        )))));
      return Ok(rid.into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("canvas_dimensions", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let canvas = canvas_by_rid(&state, rid)?;
      let canvas = canvas.lock();
      return Ok(serde_json::json!({ "width": canvas.width, "height": canvas.height }));
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("canvas_set_state", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let property: String = get_arg(args, 1)?;
      let value: serde_json::Value = get_arg(args, 2)?;

      let canvas = canvas_by_rid(&state, rid)?;
      let mut canvas = canvas.lock();
      match property.as_str() {
        "fillStyle" => canvas.state.fill_style = paint_from_json(&value)?,
        "strokeStyle" => canvas.state.stroke_style = paint_from_json(&value)?,
        "lineWidth" => {
          canvas.state.line_width = value
            .as_f64()
            .filter(|v| *v > 0.0 && v.is_finite())
            .ok_or_else(|| HostError::invalid_input("invalid lineWidth"))?;
        }
        "globalAlpha" => {
          canvas.state.global_alpha = value
            .as_f64()
            .filter(|v| (0.0..=1.0).contains(v))
            .ok_or_else(|| HostError::invalid_input("invalid globalAlpha"))?;
        }
        other => {
          return Err(HostError::invalid_input(format!("unknown state '{other}'")).into());
        }
      }
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("canvas_get_state", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let property: String = get_arg(args, 1)?;

      let canvas = canvas_by_rid(&state, rid)?;
      let canvas = canvas.lock();
      return Ok(match property.as_str() {
        "fillStyle" => paint_to_json(&canvas.state.fill_style),
        "strokeStyle" => paint_to_json(&canvas.state.stroke_style),
        "lineWidth" => canvas.state.line_width.into(),
        "globalAlpha" => canvas.state.global_alpha.into(),
        other => {
          return Err(HostError::invalid_input(format!("unknown state '{other}'")).into());
        }
      });
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("canvas_path_op", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let op: String = get_arg(args, 1)?;
      let coords: Vec<f64> = opt_arg(args, 2).unwrap_or_default();

      let at = |i: usize| -> Result<f64, rustyscript::Error> {
        return coords
          .get(i)
          .copied()
          .filter(|v| v.is_finite())
          .ok_or_else(|| HostError::invalid_input(format!("missing coordinate {i}")).into());
      };

      let canvas = canvas_by_rid(&state, rid)?;
      let mut canvas = canvas.lock();
      match op.as_str() {
        "beginPath" => canvas.begin_path(),
        "moveTo" => canvas.move_to(at(0)?, at(1)?),
        "lineTo" => canvas.line_to(at(0)?, at(1)?),
        "closePath" => canvas.close_path(),
        "rect" => canvas.rect(at(0)?, at(1)?, at(2)?, at(3)?),
        "arc" => canvas.arc(at(0)?, at(1)?, at(2)?, at(3)?, at(4)?),
        "fill" => canvas.fill(),
        "stroke" => canvas.stroke(),
        other => {
          return Err(HostError::invalid_input(format!("unknown path op '{other}'")).into());
        }
      }
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("canvas_fill_rect", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let (x, y, w, h): (f64, f64, f64, f64) =
        (get_arg(args, 1)?, get_arg(args, 2)?, get_arg(args, 3)?, get_arg(args, 4)?);
      canvas_by_rid(&state, rid)?.lock().fill_rect(x, y, w, h);
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("canvas_stroke_rect", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let (x, y, w, h): (f64, f64, f64, f64) =
        (get_arg(args, 1)?, get_arg(args, 2)?, get_arg(args, 3)?, get_arg(args, 4)?);
      canvas_by_rid(&state, rid)?.lock().stroke_rect(x, y, w, h);
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("canvas_clear_rect", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let (x, y, w, h): (f64, f64, f64, f64) =
        (get_arg(args, 1)?, get_arg(args, 2)?, get_arg(args, 3)?, get_arg(args, 4)?);
      canvas_by_rid(&state, rid)?.lock().clear_rect(x, y, w, h);
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("canvas_save", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      canvas_by_rid(&state, rid)?.lock().save();
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("canvas_restore", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      canvas_by_rid(&state, rid)?.lock().restore();
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function(
      "canvas_create_linear_gradient",
      move |args: &[serde_json::Value]| {
        let rid: u64 = get_arg(args, 0)?;
        let (x0, y0, x1, y1): (f64, f64, f64, f64) =
          (get_arg(args, 1)?, get_arg(args, 2)?, get_arg(args, 3)?, get_arg(args, 4)?);

        let canvas = canvas_by_rid(&state, rid)?;
        let mut canvas = canvas.lock();
        canvas.gradients.push(LinearGradient {
          x0,
          y0,
          x1,
          y1,
          stops: vec![],
        });
        return Ok(((canvas.gradients.len() - 1) as u64).into());
      },
    )?;
  }
  {
    let state = state.clone();
    runtime.register_function(
      "canvas_gradient_add_color_stop",
      move |args: &[serde_json::Value]| {
        let rid: u64 = get_arg(args, 0)?;
        let gradient: usize = get_arg(args, 1)?;
        let offset: f64 = get_arg(args, 2)?;
        let color: String = get_arg(args, 3)?;

        if !(0.0..=1.0).contains(&offset) {
          return Err(HostError::invalid_input("stop offset outside [0, 1]").into());
        }
        let color = parse_color(&color)?;

        let canvas = canvas_by_rid(&state, rid)?;
        let mut canvas = canvas.lock();
        let gradient = canvas
          .gradients
          .get_mut(gradient)
          .ok_or_else(|| HostError::invalid_input("unknown gradient"))?;
        gradient.stops.push((offset, color));
        gradient
          .stops
          .sort_by(|a, b| a.0.partial_cmp(&b.0).expect("offsets are finite"));
        return Ok(serde_json::Value::Null);
      },
    )?;
  }
  {
    let state = state.clone();
    runtime.register_function("canvas_render", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let png = canvas_by_rid(&state, rid)?.lock().encode_png()?;
      return Ok(BASE64_STANDARD.encode(png).into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("canvas_save_as_png", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let rid: u64 = get_arg(&args, 0)?;
        let path: String = get_arg(&args, 1)?;

        let png = canvas_by_rid(&state, rid)?.lock().encode_png()?;
        let receiver = state.pool.submit(CancellationFlag::new(), move |_flag| {
          std::fs::write(&path, &png)?;
          return Ok(());
        });
        crate::bridge::await_completion(receiver).await?;
        return Ok(serde_json::Value::Null);
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("canvas_close", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      state.resources.remove(rid);
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("image_bitmap_load", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        // Either a path string or raw encoded bytes.
        let source = args.first().cloned().unwrap_or(serde_json::Value::Null);

        let receiver = state.pool.submit(CancellationFlag::new(), move |_flag| {
          let bytes = match &source {
            serde_json::Value::String(path) if !path.contains('=') && path.len() < 4096 => {
              match std::fs::read(path) {
                Ok(bytes) => bytes,
                // Fall back to treating the string as base64 image data.
                Err(_) => crate::host::decode_bytes(&source)?,
              }
            }
            other => crate::host::decode_bytes(other)?,
          };
          let image = image::load_from_memory(&bytes)
            .map_err(|err| {
              HostError::new(ErrorKind::InvalidInput, format!("image decode: {err}"))
            })?
            .to_rgba8();
          return Ok(image);
        });
        let image = crate::bridge::await_completion(receiver).await?;

        let (width, height) = image.dimensions();
        let rid = state
          .resources
          .insert(Resource::ImageBitmap(ImageBitmapResource {
            width,
            height,
            pixels: Arc::new(image),
          }));
        return Ok(serde_json::json!({ "rid": rid, "width": width, "height": height }));
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("image_bitmap_dimensions", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let (width, height) = state.resources.with_entry(rid, |r| match r {
        Resource::ImageBitmap(bitmap) => Ok((bitmap.width, bitmap.height)),
        other => Err(wrong_kind(rid, ResourceKind::ImageBitmap, other.kind())),
      })?;
      return Ok(serde_json::json!({ "width": width, "height": height }));
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("image_bitmap_close", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      state.resources.remove(rid);
      return Ok(serde_json::Value::Null);
    })?;
  }

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_colors() {
    assert_eq!(Rgba { r: 255, g: 0, b: 0, a: 255 }, parse_color("red").unwrap());
    assert_eq!(
      Rgba { r: 255, g: 0, b: 128, a: 255 },
      parse_color("#ff0080").unwrap()
    );
    assert_eq!(
      Rgba { r: 17, g: 34, b: 51, a: 255 },
      parse_color("#123").unwrap()
    );
    assert_eq!(
      Rgba { r: 1, g: 2, b: 3, a: 128 },
      parse_color("rgba(1, 2, 3, 0.5)").unwrap()
    );
    assert!(parse_color("chartreuse-ish").is_err());
  }

  #[test]
  fn test_fill_rect_paints_pixels() {
    let mut canvas = CanvasContext::new(8, 8);
    canvas.state.fill_style = Paint::Color(parse_color("#ff0000").unwrap());
    canvas.fill_rect(2.0, 2.0, 3.0, 3.0);

    assert_eq!(Some(parse_color("#ff0000").unwrap()), canvas.pixel(3, 3));
    assert_eq!(Some(Rgba { r: 0, g: 0, b: 0, a: 0 }), canvas.pixel(0, 0));
  }

  #[test]
  fn test_path_fill_triangle() {
    let mut canvas = CanvasContext::new(16, 16);
    canvas.state.fill_style = Paint::Color(parse_color("blue").unwrap());
    canvas.begin_path();
    canvas.move_to(0.0, 0.0);
    canvas.line_to(15.0, 0.0);
    canvas.line_to(0.0, 15.0);
    canvas.close_path();
    canvas.fill();

    // Inside the triangle vs. the far corner outside it.
    assert_eq!(Some(parse_color("blue").unwrap()), canvas.pixel(2, 2));
    assert_eq!(Some(Rgba { r: 0, g: 0, b: 0, a: 0 }), canvas.pixel(15, 15));
  }

  #[test]
  fn test_save_restore_state_stack() {
    let mut canvas = CanvasContext::new(4, 4);
    canvas.state.line_width = 5.0;
    canvas.save();
    canvas.state.line_width = 9.0;
    canvas.restore();
    assert_eq!(5.0, canvas.state.line_width);

    // Restore on an empty stack is a no-op.
    canvas.restore();
    assert_eq!(5.0, canvas.state.line_width);
  }

  #[test]
  fn test_gradient_interpolation() {
    let gradient = LinearGradient {
      x0: 0.0,
      y0: 0.0,
      x1: 10.0,
      y1: 0.0,
      stops: vec![
        (0.0, parse_color("black").unwrap()),
        (1.0, parse_color("white").unwrap()),
      ],
    };

    assert_eq!(parse_color("black").unwrap(), gradient.color_at(0.0, 0.0));
    assert_eq!(parse_color("white").unwrap(), gradient.color_at(10.0, 0.0));
    let mid = gradient.color_at(5.0, 0.0);
    assert!((120..=135).contains(&mid.r));
  }

  #[test]
  fn test_png_round_trip() {
    let mut canvas = CanvasContext::new(4, 4);
    canvas.state.fill_style = Paint::Color(parse_color("lime").unwrap());
    canvas.fill_rect(0.0, 0.0, 4.0, 4.0);

    let png = canvas.encode_png().unwrap();
    let decoded = image::load_from_memory(&png).unwrap().to_rgba8();
    assert_eq!((4, 4), decoded.dimensions());
    assert_eq!(image::Rgba([0, 255, 0, 255]), *decoded.get_pixel(1, 1));
  }
}
