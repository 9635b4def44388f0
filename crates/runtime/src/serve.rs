use log::*;
use serde::Deserialize;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, watch};

use crate::bridge::GaugeGuard;
use crate::error::{ErrorKind, HostError, HostResult};
use crate::host::{HostState, bytes_arg, encode_bytes, get_arg, opt_arg};
use crate::resource::{Resource, ResourceKind, wrong_kind};
use crate::runtime::build_call_async_js_function_message;

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

pub struct ListenerResource {
  pub local_addr: SocketAddr,
  /// Present for raw TCP listeners driven by `tcp_accept_async`.
  pub listener: Option<Arc<tokio::net::TcpListener>>,
  /// Present for HTTP serve listeners; dropping it stops the accept loop.
  pub shutdown: Option<watch::Sender<bool>>,
  /// A live listener keeps the event loop up.
  #[allow(unused)]
  pub keepalive: GaugeGuard,
}

pub struct TcpConnResource {
  pub stream: Arc<tokio::sync::Mutex<tokio::net::TcpStream>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequestHead {
  pub method: String,
  pub target: String,
  pub version: u8,
  /// Order- and repeat-preserving.
  pub headers: Vec<(String, String)>,
  pub head_len: usize,
  pub content_length: usize,
}

/// Try to parse a request head out of `buf`. `Ok(None)` means the head is
/// not complete yet and more bytes are needed.
pub fn try_parse_head(buf: &[u8]) -> HostResult<Option<ParsedRequestHead>> {
  let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
  let mut request = httparse::Request::new(&mut headers);

  let head_len = match request.parse(buf) {
    Ok(httparse::Status::Complete(n)) => n,
    Ok(httparse::Status::Partial) => {
      if buf.len() > MAX_HEAD_BYTES {
        return Err(HostError::new(
          ErrorKind::ProtocolError,
          "request head too large",
        ));
      }
      return Ok(None);
    }
    Err(err) => {
      return Err(HostError::new(
        ErrorKind::ProtocolError,
        format!("malformed request head: {err}"),
      ));
    }
  };

  let header_list: Vec<(String, String)> = request
    .headers
    .iter()
    .map(|h| {
      (
        h.name.to_string(),
        String::from_utf8_lossy(h.value).to_string(),
      )
    })
    .collect();

  let content_length = match header_list
    .iter()
    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
  {
    Some((_, value)) => value.trim().parse::<usize>().map_err(|_| {
      HostError::new(ErrorKind::ProtocolError, "invalid content-length")
    })?,
    None => 0,
  };

  return Ok(Some(ParsedRequestHead {
    method: request.method.unwrap_or_default().to_string(),
    target: request.path.unwrap_or_default().to_string(),
    version: request.version.unwrap_or(1),
    headers: header_list,
    head_len,
    content_length,
  }));
}

fn status_text(status: u16) -> &'static str {
  return match status {
    200 => "OK",
    201 => "Created",
    204 => "No Content",
    301 => "Moved Permanently",
    302 => "Found",
    304 => "Not Modified",
    400 => "Bad Request",
    401 => "Unauthorized",
    403 => "Forbidden",
    404 => "Not Found",
    405 => "Method Not Allowed",
    431 => "Request Header Fields Too Large",
    500 => "Internal Server Error",
    _ => "",
  };
}

/// Serialize status line, headers and body. `Content-Length` and
/// `Connection: close` are filled in when the handler left them out.
pub fn serialize_response(status: u16, headers: &[(String, String)], body: &[u8]) -> Vec<u8> {
  let mut out = format!("HTTP/1.1 {} {}\r\n", status, status_text(status)).into_bytes();

  let mut has_length = false;
  let mut has_connection = false;
  for (name, value) in headers {
    has_length |= name.eq_ignore_ascii_case("content-length");
    has_connection |= name.eq_ignore_ascii_case("connection");
    out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
  }
  if !has_length {
    out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
  }
  if !has_connection {
    out.extend_from_slice(b"connection: close\r\n");
  }
  out.extend_from_slice(b"\r\n");
  out.extend_from_slice(body);
  return out;
}

fn is_connection_error(e: &io::Error) -> bool {
  matches!(
    e.kind(),
    io::ErrorKind::ConnectionRefused
      | io::ErrorKind::ConnectionAborted
      | io::ErrorKind::ConnectionReset
  )
}

/// Accept errors like EMFILE are transient: log, back off, keep serving.
async fn handle_accept_error(e: io::Error) {
  if is_connection_error(&e) {
    return;
  }
  warn!("accept error: {e}");
  tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
}

#[derive(Deserialize, Default, Debug)]
struct ScriptResponse {
  status: Option<u16>,
  headers: Option<Vec<(String, String)>>,
  /// Base64 body, same convention as the rest of the bridge.
  body: Option<String>,
}

async fn write_simple_response(stream: &mut tokio::net::TcpStream, status: u16, message: &str) {
  let payload = serialize_response(
    status,
    &[("content-type".to_string(), "text/plain".to_string())],
    message.as_bytes(),
  );
  if let Err(err) = stream.write_all(&payload).await {
    debug!("failed to write {status} response: {err}");
  }
  let _ = stream.shutdown().await;
}

async fn handle_connection(
  state: Arc<HostState>,
  server_id: u64,
  mut stream: tokio::net::TcpStream,
  remote: SocketAddr,
) {
  // Read the request head and body.
  let mut buf: Vec<u8> = Vec::with_capacity(4096);
  let head = loop {
    match try_parse_head(&buf) {
      Ok(Some(head)) => break head,
      Ok(None) => {}
      Err(err) => {
        debug!("malformed request from {remote}: {err}");
        write_simple_response(&mut stream, 400, "bad request").await;
        return;
      }
    }
    match stream.read_buf(&mut buf).await {
      Ok(0) => {
        if !buf.is_empty() {
          write_simple_response(&mut stream, 400, "bad request").await;
        }
        return;
      }
      Ok(_) => {}
      Err(err) => {
        debug!("read error from {remote}: {err}");
        return;
      }
    }
  };

  let mut body = buf[head.head_len..].to_vec();
  while body.len() < head.content_length {
    match stream.read_buf(&mut body).await {
      Ok(0) => {
        write_simple_response(&mut stream, 400, "bad request").await;
        return;
      }
      Ok(_) => {}
      Err(err) => {
        debug!("read error from {remote}: {err}");
        return;
      }
    }
  }
  body.truncate(head.content_length);

  // Hand off to the script-side handler on the script thread.
  let (sender, receiver) =
    oneshot::channel::<Result<ScriptResponse, rustyscript::Error>>();

  debug!("dispatch {} {} from {remote}", head.method, head.target);
  let message = build_call_async_js_function_message::<ScriptResponse>(
    format!("serve-{server_id}-{remote}"),
    None,
    "__dispatchRequest",
    serde_json::json!([
      server_id,
      head.method,
      head.target,
      head.headers,
      encode_bytes(&body),
      remote.to_string(),
    ]),
    move |value_or| {
      if sender.send(value_or).is_err() {
        debug!("Failed to send reply. Channel closed");
      }
    },
  );
  if state.loop_sender.send(message).await.is_err() {
    return;
  }

  let response = match receiver.await {
    Ok(Ok(response)) => response,
    Ok(Err(err)) => {
      // Handler exceptions surface as a 500.
      warn!("request handler failed: {err}");
      write_simple_response(&mut stream, 500, "internal error").await;
      return;
    }
    Err(_) => {
      write_simple_response(&mut stream, 500, "internal error").await;
      return;
    }
  };

  let body = match &response.body {
    Some(b64) => match crate::host::decode_bytes(&serde_json::Value::String(b64.clone())) {
      Ok(body) => body,
      Err(err) => {
        warn!("handler returned an invalid body: {err}");
        write_simple_response(&mut stream, 500, "internal error").await;
        return;
      }
    },
    None => vec![],
  };

  let payload = serialize_response(
    response.status.unwrap_or(200),
    response.headers.as_deref().unwrap_or(&[]),
    &body,
  );
  if let Err(err) = stream.write_all(&payload).await {
    debug!("failed to write response to {remote}: {err}");
  }
  let _ = stream.shutdown().await;
}

async fn accept_loop(
  state: Arc<HostState>,
  server_id: u64,
  listener: std::net::TcpListener,
  mut shutdown: watch::Receiver<bool>,
) {
  let listener = match tokio::net::TcpListener::from_std(listener) {
    Ok(listener) => listener,
    Err(err) => {
      error!("failed to register listener: {err}");
      return;
    }
  };

  loop {
    tokio::select! {
      changed = shutdown.changed() => {
        if changed.is_err() || *shutdown.borrow() {
          break;
        }
      },
      accepted = listener.accept() => {
        match accepted {
          Ok((stream, remote)) => {
            let state = state.clone();
            tokio::spawn(handle_connection(state, server_id, stream, remote));
          }
          Err(err) => handle_accept_error(err).await,
        }
      },
    }
  }

  debug!("serve loop {server_id} exited");
}

fn bind(addr: &str) -> HostResult<std::net::TcpListener> {
  let listener = std::net::TcpListener::bind(addr)?;
  listener.set_nonblocking(true)?;
  return Ok(listener);
}

fn tcp_conn(state: &HostState, rid: u64) -> HostResult<Arc<tokio::sync::Mutex<tokio::net::TcpStream>>> {
  return state.resources.with_entry(rid, |r| match r {
    Resource::TcpConn(conn) => Ok(conn.stream.clone()),
    other => Err(wrong_kind(rid, ResourceKind::TcpConn, other.kind())),
  });
}

pub(crate) fn register(
  runtime: &mut rustyscript::Runtime,
  state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  {
    let state = state.clone();
    runtime.register_function("serve_start", move |args: &[serde_json::Value]| {
      let addr: String = get_arg(args, 0)?;
      let listener = bind(&addr)?;
      let local_addr = listener.local_addr().map_err(HostError::from)?;

      let (shutdown_tx, shutdown_rx) = watch::channel(false);
      let rid = state.resources.insert(Resource::TcpListener(ListenerResource {
        local_addr,
        listener: None,
        shutdown: Some(shutdown_tx),
        keepalive: state.keepalive.guard(),
      }));

      state
        .io
        .spawn(accept_loop(state.clone(), rid, listener, shutdown_rx));

      info!("serving HTTP on {local_addr}");
      return Ok(serde_json::json!({ "rid": rid, "addr": local_addr.to_string() }));
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("serve_stop", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      if let Some(Resource::TcpListener(listener)) = state.resources.remove(rid) {
        if let Some(shutdown) = &listener.shutdown {
          let _ = shutdown.send(true);
        }
      }
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("tcp_listen", move |args: &[serde_json::Value]| {
      let addr: String = get_arg(args, 0)?;
      let listener = bind(&addr)?;
      let local_addr = listener.local_addr().map_err(HostError::from)?;
      let listener =
        tokio::net::TcpListener::from_std(listener).map_err(HostError::from)?;

      let rid = state.resources.insert(Resource::TcpListener(ListenerResource {
        local_addr,
        listener: Some(Arc::new(listener)),
        shutdown: None,
        keepalive: state.keepalive.guard(),
      }));
      return Ok(serde_json::json!({ "rid": rid, "addr": local_addr.to_string() }));
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("tcp_accept_async", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let rid: u64 = get_arg(&args, 0)?;

        let listener = state.resources.with_entry(rid, |r| match r {
          Resource::TcpListener(l) => l
            .listener
            .clone()
            .ok_or_else(|| HostError::invalid_input("listener is not accept-driven")),
          other => Err(wrong_kind(rid, ResourceKind::TcpListener, other.kind())),
        })?;

        let (stream, remote) = listener.accept().await.map_err(HostError::from)?;
        let conn_rid = state.resources.insert(Resource::TcpConn(TcpConnResource {
          stream: Arc::new(tokio::sync::Mutex::new(stream)),
        }));
        return Ok(serde_json::json!({ "rid": conn_rid, "remoteAddr": remote.to_string() }));
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("tcp_read_async", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let rid: u64 = get_arg(&args, 0)?;
        let max_len: usize = opt_arg(&args, 1).unwrap_or(16 * 1024);

        let stream = tcp_conn(&state, rid)?;
        let mut buf = vec![0u8; max_len.clamp(1, 1024 * 1024)];
        let n = stream
          .lock()
          .await
          .read(&mut buf)
          .await
          .map_err(HostError::from)?;
        buf.truncate(n);
        return Ok(serde_json::json!({ "data": encode_bytes(&buf), "eof": n == 0 }));
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("tcp_write_async", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let rid: u64 = get_arg(&args, 0)?;
        let data = bytes_arg(&args, 1)?;

        let stream = tcp_conn(&state, rid)?;
        stream
          .lock()
          .await
          .write_all(&data)
          .await
          .map_err(HostError::from)?;
        return Ok((data.len() as u64).into());
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("tcp_close", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      if let Some(Resource::TcpListener(listener)) = state.resources.remove(rid) {
        if let Some(shutdown) = &listener.shutdown {
          let _ = shutdown.send(true);
        }
      }
      return Ok(serde_json::Value::Null);
    })?;
  }

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_simple_get() {
    let head = try_parse_head(b"GET /x?y=1 HTTP/1.1\r\nHost: a.test\r\n\r\n")
      .unwrap()
      .unwrap();
    assert_eq!("GET", head.method);
    assert_eq!("/x?y=1", head.target);
    assert_eq!(1, head.version);
    assert_eq!(vec![("Host".to_string(), "a.test".to_string())], head.headers);
    assert_eq!(0, head.content_length);
  }

  #[test]
  fn test_parse_preserves_order_and_repeats() {
    let head = try_parse_head(
      b"POST / HTTP/1.1\r\nX-A: 1\r\nX-B: 2\r\nX-A: 3\r\nContent-Length: 2\r\n\r\nhi",
    )
    .unwrap()
    .unwrap();

    assert_eq!(
      vec![
        ("X-A".to_string(), "1".to_string()),
        ("X-B".to_string(), "2".to_string()),
        ("X-A".to_string(), "3".to_string()),
        ("Content-Length".to_string(), "2".to_string()),
      ],
      head.headers
    );
    assert_eq!(2, head.content_length);
    // The body starts right after the head.
    let raw = b"POST / HTTP/1.1\r\nX-A: 1\r\nX-B: 2\r\nX-A: 3\r\nContent-Length: 2\r\n\r\nhi";
    assert_eq!(b"hi", &raw[head.head_len..]);
  }

  #[test]
  fn test_partial_head_needs_more_bytes() {
    assert!(try_parse_head(b"GET / HT").unwrap().is_none());
    assert!(try_parse_head(b"GET / HTTP/1.1\r\nHost: a").unwrap().is_none());
  }

  #[test]
  fn test_malformed_head_is_rejected() {
    let err = try_parse_head(b"NOT A REQUEST\r\n\r\n").unwrap_err();
    assert_eq!(ErrorKind::ProtocolError, err.kind);

    let err = try_parse_head(b"GET / HTTP/1.1\r\nContent-Length: nope\r\n\r\n").unwrap_err();
    assert_eq!(ErrorKind::ProtocolError, err.kind);
  }

  #[test]
  fn test_serialize_response_defaults() {
    let raw = serialize_response(200, &[], b"hello");
    let text = String::from_utf8(raw).unwrap();

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("content-length: 5\r\n"));
    assert!(text.contains("connection: close\r\n"));
    assert!(text.ends_with("\r\n\r\nhello"));
  }

  #[test]
  fn test_serialize_response_keeps_explicit_headers() {
    let raw = serialize_response(
      204,
      &[
        ("Content-Length".to_string(), "0".to_string()),
        ("Connection".to_string(), "keep-alive".to_string()),
      ],
      b"",
    );
    let text = String::from_utf8(raw).unwrap();

    assert_eq!(1, text.matches("ontent-").count());
    assert!(text.contains("Connection: keep-alive\r\n"));
    assert!(!text.contains("connection: close"));
  }
}
