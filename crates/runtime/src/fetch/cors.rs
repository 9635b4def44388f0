use url::Url;

use crate::error::{ErrorKind, HostError, HostResult};
use crate::fetch::{FetchRequest, FetchResponse, RedirectMode, RequestMode};

pub fn is_cors_safelisted_method(method: &str) -> bool {
  return matches!(method.to_ascii_uppercase().as_str(), "GET" | "HEAD" | "POST");
}

fn is_cors_unsafe_byte(b: u8) -> bool {
  return match b {
    0x09 | 0x20..=0x7e => matches!(b, b'"' | b'(' | b')' | b':' | b'<' | b'>' | b'?' | b'@' | b'[' | b']' | b'\\' | b'{' | b'}' | 0x7f),
    _ => true,
  };
}

/// Header safelist: Accept, Accept-Language, Content-Language, and
/// Content-Type limited to the three form/text essences. Every entry is
/// bound to 128 value bytes.
pub fn is_cors_safelisted_request_header(name: &str, value: &str) -> bool {
  if value.len() > 128 {
    return false;
  }

  return match name.to_ascii_lowercase().as_str() {
    "accept" => !value.bytes().any(is_cors_unsafe_byte),
    "accept-language" | "content-language" => value
      .bytes()
      .all(|b| b.is_ascii_alphanumeric() || b" *,-.;=".contains(&b)),
    "content-type" => {
      if value.bytes().any(is_cors_unsafe_byte) {
        return false;
      }
      let essence = value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
      matches!(
        essence.as_str(),
        "application/x-www-form-urlencoded" | "multipart/form-data" | "text/plain"
      )
    }
    _ => false,
  };
}

/// Preflight-trigger condition: non-safelisted method or any
/// non-safelisted header.
pub fn needs_preflight(request: &FetchRequest) -> bool {
  if !is_cors_safelisted_method(&request.method) {
    return true;
  }
  return request
    .header_list
    .iter()
    .any(|(name, value)| !is_cors_safelisted_request_header(name, value));
}

/// Synthesize the OPTIONS preflight for `request`.
pub fn preflight_request(request: &FetchRequest) -> FetchRequest {
  let mut headers = vec![
    ("Accept".to_string(), "*/*".to_string()),
    (
      "Access-Control-Request-Method".to_string(),
      request.method.to_ascii_uppercase(),
    ),
  ];

  let mut unsafe_names: Vec<String> = request
    .header_list
    .iter()
    .filter(|(name, value)| !is_cors_safelisted_request_header(name, value))
    .map(|(name, _)| name.to_ascii_lowercase())
    .collect();
  unsafe_names.sort();
  unsafe_names.dedup();
  if !unsafe_names.is_empty() {
    headers.push((
      "Access-Control-Request-Headers".to_string(),
      unsafe_names.join(","),
    ));
  }

  return FetchRequest {
    method: "OPTIONS".to_string(),
    url_list: vec![request.current_url().clone()],
    header_list: headers,
    body: None,
    mode: RequestMode::Cors,
    credentials: request.credentials,
    redirect: RedirectMode::Error,
    integrity: String::new(),
    origin: request.origin.clone(),
    destination: String::new(),
    redirect_count: 0,
  };
}

fn header_values<'a>(response: &'a FetchResponse, name: &str) -> Vec<&'a str> {
  return response
    .header(name)
    .map(|v| v.split(',').map(str::trim).collect())
    .unwrap_or_default();
}

/// The CORS check proper: `Access-Control-Allow-Origin` must be `*` (only
/// without credentials) or the exact request origin; with credentials,
/// `Access-Control-Allow-Credentials: true` is also required.
pub fn cors_check(
  response: &FetchResponse,
  origin: &Url,
  credentials_included: bool,
) -> HostResult<()> {
  let failure = |why: String| {
    return Err(HostError::new(ErrorKind::CorsFailure, why));
  };

  let Some(allow_origin) = response.header("access-control-allow-origin") else {
    return failure("missing Access-Control-Allow-Origin".to_string());
  };

  let serialized = origin.origin().ascii_serialization();
  if allow_origin == "*" {
    if credentials_included {
      return failure("wildcard origin with credentials".to_string());
    }
  } else if allow_origin != serialized {
    return failure(format!(
      "origin '{serialized}' not allowed by '{allow_origin}'"
    ));
  }

  if credentials_included
    && response.header("access-control-allow-credentials") != Some("true")
  {
    return failure("credentialed request without Access-Control-Allow-Credentials".to_string());
  }

  return Ok(());
}

/// Validate a preflight response against the real request.
pub fn check_preflight_response(
  response: &FetchResponse,
  request: &FetchRequest,
  origin: &Url,
  credentials_included: bool,
) -> HostResult<()> {
  let failure = |why: String| {
    return Err(HostError::new(ErrorKind::CorsFailure, why));
  };

  if !(200..300).contains(&response.status) {
    return failure(format!("preflight status {}", response.status));
  }
  cors_check(response, origin, credentials_included)?;

  let method = request.method.to_ascii_uppercase();
  let allowed_methods = header_values(response, "access-control-allow-methods");
  let method_ok = allowed_methods.is_empty() && is_cors_safelisted_method(&method)
    || allowed_methods.iter().any(|m| m.eq_ignore_ascii_case(&method))
    || (allowed_methods.contains(&"*") && !credentials_included);
  if !method_ok {
    return failure(format!("method {method} not allowed by preflight"));
  }

  let allowed_headers: Vec<String> = header_values(response, "access-control-allow-headers")
    .iter()
    .map(|h| h.to_ascii_lowercase())
    .collect();
  let wildcard_headers = allowed_headers.iter().any(|h| h == "*") && !credentials_included;

  for (name, value) in &request.header_list {
    if is_cors_safelisted_request_header(name, value) {
      continue;
    }
    let lower = name.to_ascii_lowercase();
    // `Authorization` is never covered by a wildcard.
    let covered = allowed_headers.contains(&lower) || (wildcard_headers && lower != "authorization");
    if !covered {
      return failure(format!("header '{lower}' not allowed by preflight"));
    }
  }

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fetch::ResponseType;

  fn request(method: &str, headers: &[(&str, &str)]) -> FetchRequest {
    return FetchRequest {
      method: method.to_string(),
      url_list: vec![Url::parse("https://api.test/data").unwrap()],
      header_list: headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect(),
      body: None,
      mode: RequestMode::Cors,
      credentials: crate::fetch::CredentialsMode::SameOrigin,
      redirect: RedirectMode::Follow,
      integrity: String::new(),
      origin: Some(Url::parse("https://app.test").unwrap()),
      destination: "script".to_string(),
      redirect_count: 0,
    };
  }

  fn response(headers: &[(&str, &str)]) -> FetchResponse {
    return FetchResponse {
      status: 200,
      status_text: "OK".to_string(),
      header_list: headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect(),
      body: bytes::Bytes::new(),
      r#type: ResponseType::Default,
      url: None,
      redirected: false,
      request_includes_credentials: false,
    };
  }

  #[test]
  fn test_preflight_trigger_conditions() {
    assert!(!needs_preflight(&request("GET", &[])));
    assert!(!needs_preflight(&request(
      "POST",
      &[("Content-Type", "text/plain")]
    )));

    assert!(needs_preflight(&request("DELETE", &[])));
    assert!(needs_preflight(&request(
      "POST",
      &[("Content-Type", "application/json")]
    )));
    assert!(needs_preflight(&request("GET", &[("X-Custom", "1")])));
    assert!(needs_preflight(&request("GET", &[("Authorization", "Bearer t")])));

    // 128-byte bound on safelisted values.
    let long = "a".repeat(129);
    assert!(needs_preflight(&request("GET", &[("Accept", long.as_str())])));
  }

  #[test]
  fn test_preflight_request_shape() {
    let preflight = preflight_request(&request(
      "delete",
      &[("X-Custom", "1"), ("Content-Type", "application/json")],
    ));

    assert_eq!("OPTIONS", preflight.method);
    let find = |name: &str| {
      preflight
        .header_list
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
    };
    assert_eq!(Some("DELETE"), find("Access-Control-Request-Method"));
    assert_eq!(
      Some("content-type,x-custom"),
      find("Access-Control-Request-Headers")
    );
  }

  #[test]
  fn test_cors_check_wildcard_and_exact() {
    let origin = Url::parse("https://app.test").unwrap();

    cors_check(&response(&[("Access-Control-Allow-Origin", "*")]), &origin, false).unwrap();
    assert!(
      cors_check(&response(&[("Access-Control-Allow-Origin", "*")]), &origin, true).is_err()
    );

    cors_check(
      &response(&[
        ("Access-Control-Allow-Origin", "https://app.test"),
        ("Access-Control-Allow-Credentials", "true"),
      ]),
      &origin,
      true,
    )
    .unwrap();

    assert!(
      cors_check(
        &response(&[("Access-Control-Allow-Origin", "https://other.test")]),
        &origin,
        false,
      )
      .is_err()
    );
    assert!(cors_check(&response(&[]), &origin, false).is_err());
  }

  #[test]
  fn test_preflight_response_check() {
    let origin = Url::parse("https://app.test").unwrap();
    let req = request("DELETE", &[("X-Custom", "1")]);

    check_preflight_response(
      &response(&[
        ("Access-Control-Allow-Origin", "*"),
        ("Access-Control-Allow-Methods", "DELETE, PATCH"),
        ("Access-Control-Allow-Headers", "x-custom"),
      ]),
      &req,
      &origin,
      false,
    )
    .unwrap();

    // Wildcard headers never cover Authorization.
    let req_auth = request("GET", &[("Authorization", "Bearer t")]);
    assert!(
      check_preflight_response(
        &response(&[
          ("Access-Control-Allow-Origin", "*"),
          ("Access-Control-Allow-Headers", "*"),
        ]),
        &req_auth,
        &origin,
        false,
      )
      .is_err()
    );

    assert!(
      check_preflight_response(
        &response(&[("Access-Control-Allow-Origin", "*")]),
        &req,
        &origin,
        false,
      )
      .is_err()
    );
  }
}
