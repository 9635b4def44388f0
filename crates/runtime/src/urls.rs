use std::sync::Arc;
use url::Url;

use crate::error::{HostError, HostResult};
use crate::host::{HostState, get_arg, opt_arg};

fn components(url: &Url) -> serde_json::Value {
  return serde_json::json!({
    "href": url.to_string(),
    "protocol": format!("{}:", url.scheme()),
    "origin": url.origin().ascii_serialization(),
    "host": url.host_str().map(|h| match url.port() {
      Some(port) => format!("{h}:{port}"),
      None => h.to_string(),
    }).unwrap_or_default(),
    "hostname": url.host_str().unwrap_or_default(),
    "port": url.port().map(|p| p.to_string()).unwrap_or_default(),
    "pathname": url.path(),
    "search": url.query().map(|q| format!("?{q}")).unwrap_or_default(),
    "hash": url.fragment().map(|f| format!("#{f}")).unwrap_or_default(),
    "username": url.username(),
    "password": url.password().unwrap_or_default(),
  });
}

pub fn parse(input: &str, base: Option<&str>) -> HostResult<Url> {
  return match base {
    Some(base) => {
      let base = Url::parse(base)?;
      Ok(base.join(input)?)
    }
    None => Ok(Url::parse(input)?),
  };
}

fn apply_setter(url: &mut Url, component: &str, value: &str) -> HostResult<()> {
  let invalid = |what: &str| {
    return HostError::invalid_input(format!("cannot set {what} on this URL"));
  };

  match component {
    "protocol" => {
      let scheme = value.strip_suffix(':').unwrap_or(value);
      url.set_scheme(scheme).map_err(|_| invalid("protocol"))?;
    }
    "host" => {
      let (host, port) = match value.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
          (host, Some(port.parse::<u16>().map_err(|_| invalid("port"))?))
        }
        _ => (value, None),
      };
      url.set_host(Some(host))?;
      if let Some(port) = port {
        url.set_port(Some(port)).map_err(|_| invalid("port"))?;
      }
    }
    "hostname" => url.set_host(Some(value))?,
    "port" => {
      let port = if value.is_empty() {
        None
      } else {
        Some(value.parse::<u16>().map_err(|_| invalid("port"))?)
      };
      url.set_port(port).map_err(|_| invalid("port"))?;
    }
    "pathname" => url.set_path(value),
    "search" => url.set_query(match value.strip_prefix('?').unwrap_or(value) {
      "" => None,
      q => Some(q),
    }),
    "hash" => url.set_fragment(match value.strip_prefix('#').unwrap_or(value) {
      "" => None,
      f => Some(f),
    }),
    "username" => url.set_username(value).map_err(|_| invalid("username"))?,
    "password" => url
      .set_password(if value.is_empty() { None } else { Some(value) })
      .map_err(|_| invalid("password"))?,
    other => {
      return Err(HostError::invalid_input(format!("unknown component '{other}'")));
    }
  }
  return Ok(());
}

pub(crate) fn register(
  runtime: &mut rustyscript::Runtime,
  _state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  {
    runtime.register_function("url_parse", move |args: &[serde_json::Value]| {
      let input: String = get_arg(args, 0)?;
      let base: Option<String> = opt_arg(args, 1);
      let url = parse(&input, base.as_deref())?;
      return Ok(components(&url));
    })?;
  }
  {
    runtime.register_function("url_can_parse", move |args: &[serde_json::Value]| {
      let input: String = get_arg(args, 0)?;
      let base: Option<String> = opt_arg(args, 1);
      return Ok(parse(&input, base.as_deref()).is_ok().into());
    })?;
  }
  {
    runtime.register_function("url_set_component", move |args: &[serde_json::Value]| {
      let href: String = get_arg(args, 0)?;
      let component: String = get_arg(args, 1)?;
      let value: String = get_arg(args, 2)?;

      let mut url = Url::parse(&href).map_err(HostError::from)?;
      apply_setter(&mut url, &component, &value)?;
      return Ok(components(&url));
    })?;
  }

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_components() {
    let url = parse("https://user:pw@example.test:8443/a/b?x=1#frag", None).unwrap();
    let json = components(&url);

    assert_eq!("https:", json["protocol"]);
    assert_eq!("example.test:8443", json["host"]);
    assert_eq!("example.test", json["hostname"]);
    assert_eq!("8443", json["port"]);
    assert_eq!("/a/b", json["pathname"]);
    assert_eq!("?x=1", json["search"]);
    assert_eq!("#frag", json["hash"]);
    assert_eq!("user", json["username"]);
    assert_eq!("pw", json["password"]);
  }

  #[test]
  fn test_relative_parse() {
    let url = parse("../c", Some("https://example.test/a/b/")).unwrap();
    assert_eq!("https://example.test/a/c", url.to_string());

    assert!(parse("not a url", None).is_err());
  }

  #[test]
  fn test_setters() {
    let mut url = parse("https://example.test/a", None).unwrap();

    apply_setter(&mut url, "pathname", "/x/y").unwrap();
    apply_setter(&mut url, "search", "?q=1").unwrap();
    apply_setter(&mut url, "hash", "top").unwrap();
    apply_setter(&mut url, "port", "444").unwrap();
    assert_eq!("https://example.test:444/x/y?q=1#top", url.to_string());

    apply_setter(&mut url, "host", "other.test:555").unwrap();
    assert_eq!("other.test", url.host_str().unwrap());
    assert_eq!(Some(555), url.port());

    assert!(apply_setter(&mut url, "teapot", "short and stout").is_err());
  }
}
