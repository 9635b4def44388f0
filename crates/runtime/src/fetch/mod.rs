use bytes::Bytes;
use log::*;
use std::sync::Arc;
use url::Url;

use crate::error::{ErrorKind, HostError, HostResult};
use crate::host::{HostState, bytes_arg, encode_bytes, get_arg, opt_arg};
use crate::pool::CancellationFlag;
use crate::resource::{BlobResource, FormDataResource, FormDataValue, Resource, ResourceKind, wrong_kind};
use crate::streams::{self, StreamKind};

pub mod cors;
pub mod policy;
pub mod sri;

pub const MAX_REDIRECTS: u8 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  SameOrigin,
  #[default]
  Cors,
  NoCors,
  Navigate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredentialsMode {
  Omit,
  #[default]
  SameOrigin,
  Include,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectMode {
  #[default]
  Follow,
  Error,
  Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
  Basic,
  Cors,
  Opaque,
  OpaqueRedirect,
  Error,
  Default,
}

impl ResponseType {
  pub fn as_str(&self) -> &'static str {
    return match self {
      ResponseType::Basic => "basic",
      ResponseType::Cors => "cors",
      ResponseType::Opaque => "opaque",
      ResponseType::OpaqueRedirect => "opaqueredirect",
      ResponseType::Error => "error",
      ResponseType::Default => "default",
    };
  }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
  pub method: String,
  /// Ordered URL list; the last entry is the current URL.
  pub url_list: Vec<Url>,
  pub header_list: Vec<(String, String)>,
  pub body: Option<Bytes>,
  pub mode: RequestMode,
  pub credentials: CredentialsMode,
  pub redirect: RedirectMode,
  pub integrity: String,
  pub origin: Option<Url>,
  pub destination: String,
  pub redirect_count: u8,
}

impl FetchRequest {
  pub fn current_url(&self) -> &Url {
    return self.url_list.last().expect("url list is never empty");
  }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
  pub status: u16,
  pub status_text: String,
  pub header_list: Vec<(String, String)>,
  pub body: Bytes,
  pub r#type: ResponseType,
  pub url: Option<Url>,
  pub redirected: bool,
  pub request_includes_credentials: bool,
}

impl FetchResponse {
  /// First value of a header, case-insensitive.
  pub fn header(&self, name: &str) -> Option<&str> {
    return self
      .header_list
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str());
  }

  fn into_filtered(mut self, r#type: ResponseType) -> Self {
    self.r#type = r#type;
    if matches!(r#type, ResponseType::Opaque | ResponseType::OpaqueRedirect) {
      self.status = 0;
      self.status_text = String::new();
      self.header_list.clear();
      self.body = Bytes::new();
    }
    return self;
  }

  fn sri_eligible(&self) -> bool {
    return !matches!(
      self.r#type,
      ResponseType::Opaque | ResponseType::OpaqueRedirect | ResponseType::Error
    );
  }
}

fn parse_mode(s: Option<String>) -> RequestMode {
  return match s.as_deref() {
    Some("same-origin") => RequestMode::SameOrigin,
    Some("no-cors") => RequestMode::NoCors,
    Some("navigate") => RequestMode::Navigate,
    _ => RequestMode::Cors,
  };
}

fn parse_credentials(s: Option<String>) -> CredentialsMode {
  return match s.as_deref() {
    Some("omit") => CredentialsMode::Omit,
    Some("include") => CredentialsMode::Include,
    _ => CredentialsMode::SameOrigin,
  };
}

fn parse_redirect(s: Option<String>) -> RedirectMode {
  return match s.as_deref() {
    Some("error") => RedirectMode::Error,
    Some("manual") => RedirectMode::Manual,
    _ => RedirectMode::Follow,
  };
}

fn data_fetch(url: &Url) -> HostResult<FetchResponse> {
  let data_url = data_url::DataUrl::process(url.as_str())
    .map_err(|err| HostError::invalid_input(format!("invalid data url: {err:?}")))?;
  let (body, _fragment) = data_url
    .decode_to_vec()
    .map_err(|err| HostError::invalid_input(format!("invalid data url body: {err:?}")))?;

  return Ok(FetchResponse {
    status: 200,
    status_text: "OK".to_string(),
    header_list: vec![("content-type".to_string(), data_url.mime_type().to_string())],
    body: Bytes::from(body),
    r#type: ResponseType::Basic,
    url: Some(url.clone()),
    redirected: false,
    request_includes_credentials: false,
  });
}

fn blob_fetch(state: &Arc<HostState>, url: &Url) -> HostResult<FetchResponse> {
  let rid = state
    .blob_urls
    .lock()
    .get(url.as_str())
    .copied()
    .ok_or_else(|| HostError::new(ErrorKind::NotFound, format!("no blob for {url}")))?;

  let blob = state.resources.with_entry(rid, |r| match r {
    Resource::Blob(blob) => Ok(blob.clone()),
    other => Err(wrong_kind(rid, ResourceKind::Blob, other.kind())),
  })?;

  return Ok(FetchResponse {
    status: 200,
    status_text: "OK".to_string(),
    header_list: vec![
      ("content-type".to_string(), blob.mime.clone()),
      ("content-length".to_string(), blob.data.len().to_string()),
    ],
    body: blob.data,
    r#type: ResponseType::Basic,
    url: Some(url.clone()),
    redirected: false,
    request_includes_credentials: false,
  });
}

async fn file_fetch(state: &Arc<HostState>, url: &Url) -> HostResult<FetchResponse> {
  let path = url
    .to_file_path()
    .map_err(|_| HostError::invalid_input(format!("invalid file url: {url}")))?;

  let receiver = state
    .pool
    .submit(CancellationFlag::new(), move |_flag| {
      return Ok(std::fs::read(&path)?);
    });
  let body = crate::bridge::await_completion(receiver).await?;

  return Ok(FetchResponse {
    status: 200,
    status_text: "OK".to_string(),
    header_list: vec![("content-length".to_string(), body.len().to_string())],
    body: Bytes::from(body),
    r#type: ResponseType::Basic,
    url: Some(url.clone()),
    redirected: false,
    request_includes_credentials: false,
  });
}

/// One HTTP round trip, redirects surfaced to the caller.
async fn http_transport(
  state: &Arc<HostState>,
  request: &FetchRequest,
  send_origin: bool,
) -> HostResult<FetchResponse> {
  let url = request.current_url().clone();

  let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
    .map_err(|_| HostError::invalid_input(format!("invalid method '{}'", request.method)))?;

  let mut builder = state.http.request(method, url.clone());
  for (name, value) in &request.header_list {
    builder = builder.header(name, value);
  }
  if send_origin && let Some(origin) = &request.origin {
    builder = builder.header("origin", origin.origin().ascii_serialization());
  }
  if let Some(body) = &request.body {
    builder = builder.body(body.clone());
  }

  let response = builder.send().await?;

  let status = response.status();
  let header_list: Vec<(String, String)> = response
    .headers()
    .iter()
    .map(|(name, value)| {
      (
        name.as_str().to_string(),
        String::from_utf8_lossy(value.as_bytes()).to_string(),
      )
    })
    .collect();
  let body = response.bytes().await?;

  return Ok(FetchResponse {
    status: status.as_u16(),
    status_text: status.canonical_reason().unwrap_or_default().to_string(),
    header_list,
    body,
    r#type: ResponseType::Default,
    url: Some(url),
    redirected: request.redirect_count > 0,
    request_includes_credentials: request.credentials == CredentialsMode::Include,
  });
}

fn is_redirect_status(status: u16) -> bool {
  return matches!(status, 301 | 302 | 303 | 307 | 308);
}

/// The fetch pipeline: scheme dispatch, mixed-content, CORS (preflight +
/// response check), redirect handling, CORP, and SRI.
pub async fn fetch(state: &Arc<HostState>, request: FetchRequest) -> HostResult<FetchResponse> {
  return fetch_with_cancellation(state, request, &CancellationFlag::new()).await;
}

pub async fn fetch_with_cancellation(
  state: &Arc<HostState>,
  mut request: FetchRequest,
  cancel: &CancellationFlag,
) -> HostResult<FetchResponse> {
  let origin = request.origin.clone();
  let credentials_included = request.credentials == CredentialsMode::Include;

  let mut response = loop {
    if cancel.is_cancelled() {
      return Err(HostError::interrupted());
    }
    let url = request.current_url().clone();

    match url.scheme() {
      "data" => break data_fetch(&url)?,
      "blob" => break blob_fetch(state, &url)?,
      "file" => break file_fetch(state, &url).await?,
      "http" | "https" => {}
      scheme => {
        return Err(HostError::invalid_input(format!(
          "unsupported scheme '{scheme}'"
        )));
      }
    }

    if !policy::mixed_content_allowed(origin.as_ref(), &url, &request.destination) {
      return Err(HostError::new(
        ErrorKind::MixedContentBlocked,
        format!("insecure request to {url} from a secure context"),
      ));
    }

    let same_origin = origin
      .as_ref()
      .is_some_and(|origin| policy::same_origin(origin, &url));
    if request.mode == RequestMode::SameOrigin && !same_origin {
      return Err(HostError::new(
        ErrorKind::CorsFailure,
        format!("cross-origin request to {url} with same-origin mode"),
      ));
    }

    let use_cors = !same_origin && request.mode == RequestMode::Cors && origin.is_some();
    if use_cors && cors::needs_preflight(&request) {
      let preflight = cors::preflight_request(&request);
      let preflight_response = http_transport(state, &preflight, true).await?;
      cors::check_preflight_response(
        &preflight_response,
        &request,
        origin.as_ref().expect("cors implies origin"),
        credentials_included,
      )?;
    }

    let response = http_transport(state, &request, use_cors).await?;

    if is_redirect_status(response.status)
      && let Some(location) = response.header("location")
    {
      match request.redirect {
        RedirectMode::Error => {
          return Err(HostError::new(
            ErrorKind::Network,
            format!("redirect to {location} with redirect mode 'error'"),
          ));
        }
        RedirectMode::Manual => {
          break response.into_filtered(ResponseType::OpaqueRedirect);
        }
        RedirectMode::Follow => {
          request.redirect_count += 1;
          if request.redirect_count > MAX_REDIRECTS {
            return Err(HostError::new(ErrorKind::Network, "too many redirects"));
          }

          let next = url.join(location)?;
          debug!("following redirect {} -> {next}", response.status);

          // 303, and 301/302 on POST, rewrite to a bodyless GET.
          if response.status == 303
            || (matches!(response.status, 301 | 302)
              && request.method.eq_ignore_ascii_case("POST"))
          {
            request.method = "GET".to_string();
            request.body = None;
            request
              .header_list
              .retain(|(name, _)| !name.to_ascii_lowercase().starts_with("content-"));
          }
          request.url_list.push(next);
          continue;
        }
      }
    }

    let response = if use_cors {
      cors::cors_check(
        &response,
        origin.as_ref().expect("cors implies origin"),
        credentials_included,
      )?;
      response.into_filtered(ResponseType::Cors)
    } else if !same_origin && request.mode == RequestMode::NoCors {
      response.into_filtered(ResponseType::Opaque)
    } else {
      response.into_filtered(ResponseType::Basic)
    };

    policy::corp_check(
      state.options.embedder_policy,
      origin.as_ref(),
      &url,
      response.header("cross-origin-resource-policy"),
    )?;

    break response;
  };

  if cancel.is_cancelled() {
    return Err(HostError::interrupted());
  }

  if !request.integrity.is_empty() {
    // On failure the body is never surfaced to the caller.
    sri::verify(&request.integrity, response.sri_eligible(), &response.body)?;
  }

  response.redirected = request.redirect_count > 0;
  return Ok(response);
}

fn response_json(state: &Arc<HostState>, response: FetchResponse) -> serde_json::Value {
  let body_rid = match response.r#type {
    ResponseType::Opaque | ResponseType::OpaqueRedirect => None,
    _ => {
      let rid = streams::create_stream(&state.resources, StreamKind::Bytes, 0);
      if !response.body.is_empty() {
        let _ = streams::enqueue(&state.resources, rid, response.body.clone());
      }
      let _ = streams::close(&state.resources, rid);
      Some(rid)
    }
  };

  return serde_json::json!({
    "status": response.status,
    "statusText": response.status_text,
    "headers": response.header_list,
    "bodyRid": body_rid,
    "type": response.r#type.as_str(),
    "url": response.url.map(|u| u.to_string()),
    "redirected": response.redirected,
  });
}

fn blob_handle(state: &Arc<HostState>, rid: u64) -> HostResult<BlobResource> {
  return state.resources.with_entry(rid, |r| match r {
    Resource::Blob(blob) => Ok(blob.clone()),
    other => Err(wrong_kind(rid, ResourceKind::Blob, other.kind())),
  });
}

pub(crate) fn register(
  runtime: &mut rustyscript::Runtime,
  state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  {
    let state = state.clone();
    runtime.register_async_function("fetch", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let url: String = get_arg(&args, 0)?;
        let opts = args.get(1).cloned().unwrap_or(serde_json::Value::Null);

        let field = |name: &str| -> Option<String> {
          return opts.get(name).and_then(|v| v.as_str()).map(str::to_string);
        };
        let headers: Vec<(String, String)> = opts
          .get("headers")
          .cloned()
          .map(serde_json::from_value)
          .transpose()
          .map_err(|err| rustyscript::Error::Runtime(err.to_string()))?
          .unwrap_or_default();
        let body = match opts.get("body") {
          Some(v) if !v.is_null() => Some(Bytes::from(crate::host::decode_bytes(v)?)),
          _ => None,
        };

        let request = FetchRequest {
          method: field("method").unwrap_or_else(|| "GET".to_string()),
          url_list: vec![Url::parse(&url).map_err(HostError::from)?],
          header_list: headers,
          body,
          mode: parse_mode(field("mode")),
          credentials: parse_credentials(field("credentials")),
          redirect: parse_redirect(field("redirect")),
          integrity: field("integrity").unwrap_or_default(),
          origin: state.options.origin.clone(),
          destination: field("destination").unwrap_or_default(),
          redirect_count: 0,
        };

        let signal_token: Option<u64> = opts.get("signalToken").and_then(|v| v.as_u64());
        let cancel = match signal_token {
          Some(token) => state.cancellation_register(token),
          None => CancellationFlag::new(),
        };

        let result = fetch_with_cancellation(&state, request, &cancel).await;
        if let Some(token) = signal_token {
          state.cancellation_clear(token);
        }
        return Ok(response_json(&state, result?));
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("blob_create", move |args: &[serde_json::Value]| {
      let data = bytes_arg(args, 0)?;
      let mime: String = opt_arg(args, 1).unwrap_or_else(|| "application/octet-stream".to_string());
      let rid = state.resources.insert(Resource::Blob(BlobResource {
        data: Bytes::from(data),
        mime,
      }));
      return Ok(rid.into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("blob_get", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let blob = blob_handle(&state, rid)?;
      return Ok(serde_json::json!({
        "data": encode_bytes(&blob.data),
        "mime": blob.mime,
        "size": blob.data.len(),
      }));
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("blob_url_create", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      // Validate the handle before minting a URL for it.
      let _ = blob_handle(&state, rid)?;
      let url = format!("blob:andromeda/{}", uuid::Uuid::new_v4());
      state.blob_urls.lock().insert(url.clone(), rid);
      return Ok(url.into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("blob_url_revoke", move |args: &[serde_json::Value]| {
      let url: String = get_arg(args, 0)?;
      state.blob_urls.lock().remove(&url);
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("blob_close", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      state.resources.remove(rid);
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("formdata_create", move |_args: &[serde_json::Value]| {
      let rid = state
        .resources
        .insert(Resource::FormData(FormDataResource::default()));
      return Ok(rid.into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("formdata_append_text", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let name: String = get_arg(args, 1)?;
      let value: String = get_arg(args, 2)?;
      state.resources.with_entry(rid, |r| match r {
        Resource::FormData(form) => {
          form.entries.push((name, FormDataValue::Text(value)));
          return Ok(());
        }
        other => Err(wrong_kind(rid, ResourceKind::FormData, other.kind())),
      })?;
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("formdata_append_blob", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let name: String = get_arg(args, 1)?;
      let blob_rid: u64 = get_arg(args, 2)?;
      let filename: String = opt_arg(args, 3).unwrap_or_else(|| "blob".to_string());

      let blob = blob_handle(&state, blob_rid)?;
      state.resources.with_entry(rid, |r| match r {
        Resource::FormData(form) => {
          form.entries.push((
            name,
            FormDataValue::File {
              name: filename,
              mime: blob.mime.clone(),
              data: blob.data.clone(),
            },
          ));
          return Ok(());
        }
        other => Err(wrong_kind(rid, ResourceKind::FormData, other.kind())),
      })?;
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("formdata_entries", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let entries = state.resources.with_entry(rid, |r| match r {
        Resource::FormData(form) => Ok(form.entries.clone()),
        other => Err(wrong_kind(rid, ResourceKind::FormData, other.kind())),
      })?;

      let values: Vec<serde_json::Value> = entries
        .into_iter()
        .map(|(name, value)| match value {
          FormDataValue::Text(text) => serde_json::json!({ "name": name, "value": text }),
          FormDataValue::File {
            name: filename,
            mime,
            data,
          } => serde_json::json!({
            "name": name,
            "filename": filename,
            "mime": mime,
            "data": encode_bytes(&data),
          }),
        })
        .collect();
      return Ok(serde_json::Value::Array(values));
    })?;
  }

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_data_fetch() {
    let response = data_fetch(&Url::parse("data:text/plain;base64,aGk=").unwrap()).unwrap();
    assert_eq!(200, response.status);
    assert_eq!(Bytes::from_static(b"hi"), response.body);
    assert_eq!(Some("text/plain"), response.header("content-type"));
  }

  #[test]
  fn test_opaque_filtering_hides_everything() {
    let response = FetchResponse {
      status: 200,
      status_text: "OK".to_string(),
      header_list: vec![("x-secret".to_string(), "1".to_string())],
      body: Bytes::from_static(b"secret"),
      r#type: ResponseType::Default,
      url: Some(Url::parse("https://a.test").unwrap()),
      redirected: false,
      request_includes_credentials: false,
    };

    let filtered = response.into_filtered(ResponseType::Opaque);
    assert_eq!(0, filtered.status);
    assert!(filtered.header_list.is_empty());
    assert!(filtered.body.is_empty());
    assert!(!filtered.sri_eligible());
  }

  #[test]
  fn test_redirect_status_classification() {
    for status in [301, 302, 303, 307, 308] {
      assert!(is_redirect_status(status));
    }
    for status in [200, 204, 300, 304, 400] {
      assert!(!is_redirect_status(status));
    }
  }
}
