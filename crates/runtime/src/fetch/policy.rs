use std::str::FromStr;
use url::Url;

use crate::error::{ErrorKind, HostError, HostResult};

/// Cross-origin embedder policy of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbedderPolicy {
  #[default]
  UnsafeNone,
  Credentialless,
  RequireCorp,
}

impl FromStr for EmbedderPolicy {
  type Err = HostError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    return match s {
      "unsafe-none" => Ok(EmbedderPolicy::UnsafeNone),
      "credentialless" => Ok(EmbedderPolicy::Credentialless),
      "require-corp" => Ok(EmbedderPolicy::RequireCorp),
      other => Err(HostError::invalid_input(format!(
        "unknown embedder policy '{other}'"
      ))),
    };
  }
}

/// Origins that prohibit mixed security contexts: https/wss. Opaque
/// callers (file, about, no origin at all) do not.
pub fn prohibits_mixed_security_contexts(origin: Option<&Url>) -> bool {
  return match origin {
    Some(origin) => matches!(origin.scheme(), "https" | "wss"),
    None => false,
  };
}

pub fn a_priori_authenticated(url: &Url) -> bool {
  return matches!(
    url.scheme(),
    "https" | "wss" | "file" | "data" | "blob" | "about"
  );
}

/// Mixed-content gate: a secure caller may only reach a-priori
/// authenticated URLs, except for top-level document navigations.
pub fn mixed_content_allowed(origin: Option<&Url>, url: &Url, destination: &str) -> bool {
  if !prohibits_mixed_security_contexts(origin) {
    return true;
  }
  if a_priori_authenticated(url) {
    return true;
  }
  return destination == "document";
}

pub fn same_origin(a: &Url, b: &Url) -> bool {
  return a.origin() == b.origin();
}

/// Same-site under the simplified registrable-domain rule (last two labels
/// of a dotted host), with the HTTPS-guard: an HTTP response may be
/// accepted by any origin, an HTTPS response requires an HTTPS origin.
pub fn same_site_with_https_guard(origin: &Url, response_url: &Url) -> bool {
  if response_url.scheme() == "https" && origin.scheme() != "https" {
    return false;
  }

  let (Some(a), Some(b)) = (origin.host_str(), response_url.host_str()) else {
    return false;
  };

  // IP addresses and single-label hosts compare exactly.
  let dotted = |h: &str| h.contains('.') && h.parse::<std::net::IpAddr>().is_err();
  if !dotted(a) || !dotted(b) {
    return a == b;
  }

  let last_two = |h: &str| {
    let labels: Vec<&str> = h.rsplitn(3, '.').collect();
    return match labels.as_slice() {
      [tld, sld, ..] => format!("{sld}.{tld}"),
      _ => h.to_string(),
    };
  };
  return last_two(a) == last_two(b);
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CorpValue {
  SameOrigin,
  SameSite,
  CrossOrigin,
}

fn parse_corp(header: Option<&str>) -> Option<CorpValue> {
  // Invalid values are treated as an absent header.
  return match header?.trim().to_ascii_lowercase().as_str() {
    "same-origin" => Some(CorpValue::SameOrigin),
    "same-site" => Some(CorpValue::SameSite),
    "cross-origin" => Some(CorpValue::CrossOrigin),
    _ => None,
  };
}

/// Cross-Origin-Resource-Policy check, evaluated once the response headers
/// are in.
pub fn corp_check(
  policy: EmbedderPolicy,
  origin: Option<&Url>,
  response_url: &Url,
  corp_header: Option<&str>,
) -> HostResult<()> {
  let Some(origin) = origin else {
    return Ok(());
  };
  if same_origin(origin, response_url) {
    return Ok(());
  }

  let blocked = |why: &str| {
    return Err(HostError::new(
      ErrorKind::CorsFailure,
      format!("blocked by cross-origin-resource-policy: {why}"),
    ));
  };

  return match parse_corp(corp_header) {
    None => match policy {
      EmbedderPolicy::RequireCorp => blocked("require-corp embedder policy"),
      EmbedderPolicy::UnsafeNone | EmbedderPolicy::Credentialless => Ok(()),
    },
    Some(CorpValue::CrossOrigin) => Ok(()),
    Some(CorpValue::SameOrigin) => blocked("same-origin"),
    Some(CorpValue::SameSite) => {
      if same_site_with_https_guard(origin, response_url) {
        Ok(())
      } else {
        blocked("same-site")
      }
    }
  };
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    return Url::parse(s).unwrap();
  }

  #[test]
  fn test_mixed_content_secure_origin_blocks_http() {
    let origin = url("https://app.test");
    assert!(!mixed_content_allowed(
      Some(&origin),
      &url("http://api.test/data"),
      "script"
    ));
    assert!(mixed_content_allowed(
      Some(&origin),
      &url("https://api.test/data"),
      "script"
    ));
    // Top-level navigation is exempt.
    assert!(mixed_content_allowed(
      Some(&origin),
      &url("http://api.test/data"),
      "document"
    ));
  }

  #[test]
  fn test_mixed_content_file_origin_allows_anything() {
    let origin = url("file:///x");
    assert!(mixed_content_allowed(
      Some(&origin),
      &url("http://api.test/data"),
      "script"
    ));
    assert!(mixed_content_allowed(None, &url("http://api.test/"), "script"));
  }

  #[test]
  fn test_corp_same_site_https_guard() {
    let origin = url("https://a.example.com");

    // https response, https origin, same registrable domain.
    corp_check(
      EmbedderPolicy::UnsafeNone,
      Some(&origin),
      &url("https://b.example.com/x"),
      Some("same-site"),
    )
    .unwrap();

    // http response is acceptable to any origin.
    corp_check(
      EmbedderPolicy::UnsafeNone,
      Some(&origin),
      &url("http://b.example.com/x"),
      Some("same-site"),
    )
    .unwrap();

    // https response requires an https origin.
    let http_origin = url("http://a.example.com");
    assert!(
      corp_check(
        EmbedderPolicy::UnsafeNone,
        Some(&http_origin),
        &url("https://b.example.com/x"),
        Some("same-site"),
      )
      .is_err()
    );
  }

  #[test]
  fn test_corp_same_origin_blocks_cross_origin() {
    let origin = url("https://app.test");
    assert!(
      corp_check(
        EmbedderPolicy::UnsafeNone,
        Some(&origin),
        &url("https://other.test/x"),
        Some("same-origin"),
      )
      .is_err()
    );

    // Same-origin responses always pass.
    corp_check(
      EmbedderPolicy::UnsafeNone,
      Some(&origin),
      &url("https://app.test/x"),
      Some("same-origin"),
    )
    .unwrap();
  }

  #[test]
  fn test_corp_require_corp_needs_header() {
    let origin = url("https://app.test");
    assert!(
      corp_check(
        EmbedderPolicy::RequireCorp,
        Some(&origin),
        &url("https://other.test/x"),
        None,
      )
      .is_err()
    );
    corp_check(
      EmbedderPolicy::UnsafeNone,
      Some(&origin),
      &url("https://other.test/x"),
      None,
    )
    .unwrap();
    // Invalid header value behaves like an absent header.
    corp_check(
      EmbedderPolicy::UnsafeNone,
      Some(&origin),
      &url("https://other.test/x"),
      Some("bogus"),
    )
    .unwrap();
  }
}
