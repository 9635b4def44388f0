use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;
use url::Url;

use crate::error::{HostError, HostResult};
use crate::fetch::{self, FetchRequest, RedirectMode, RequestMode};
use crate::host::{HostState, encode_bytes, get_arg};
use crate::resource::Resource;

#[derive(Debug, Clone)]
pub struct CacheNameResource {
  pub name: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MatchOptions {
  pub ignore_search: bool,
  pub ignore_method: bool,
  pub ignore_vary: bool,
}

impl MatchOptions {
  fn from_json(value: Option<&serde_json::Value>) -> Self {
    let get = |name: &str| {
      return value
        .and_then(|v| v.get(name))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    };
    return Self {
      ignore_search: get("ignoreSearch"),
      ignore_method: get("ignoreMethod"),
      ignore_vary: get("ignoreVary"),
    };
  }
}

#[derive(Debug, Clone)]
pub struct StoredResponse {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

#[derive(Debug, Clone)]
struct CacheEntry {
  method: String,
  /// Request URL, fragment stripped.
  url: Url,
  /// Vary discriminator captured from the request at store time.
  vary: Vec<(String, String)>,
  response: StoredResponse,
}

#[derive(Debug, Clone)]
pub struct RequestKey {
  pub method: String,
  pub url: Url,
  pub headers: Vec<(String, String)>,
}

impl RequestKey {
  pub fn parse(method: &str, url: &str, headers: Vec<(String, String)>) -> HostResult<Self> {
    let mut url = Url::parse(url)?;
    url.set_fragment(None);
    return Ok(Self {
      method: method.to_ascii_uppercase(),
      url,
      headers,
    });
  }

  fn header(&self, name: &str) -> Option<&str> {
    return self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str());
  }
}

fn urls_match(a: &Url, b: &Url, ignore_search: bool) -> bool {
  if !ignore_search {
    return a == b;
  }
  let mut a = a.clone();
  let mut b = b.clone();
  a.set_query(None);
  b.set_query(None);
  return a == b;
}

#[derive(Default)]
pub struct CacheStore {
  entries: Mutex<Vec<CacheEntry>>,
}

impl CacheStore {
  fn entry_matches(entry: &CacheEntry, key: &RequestKey, options: MatchOptions) -> bool {
    if !options.ignore_method && key.method != entry.method {
      return false;
    }
    if !urls_match(&entry.url, &key.url, options.ignore_search) {
      return false;
    }
    if !options.ignore_vary {
      for (name, stored_value) in &entry.vary {
        if key.header(name) != Some(stored_value.as_str()) {
          return false;
        }
      }
    }
    return true;
  }

  pub fn match_all(&self, key: &RequestKey, options: MatchOptions) -> Vec<StoredResponse> {
    return self
      .entries
      .lock()
      .iter()
      .filter(|entry| Self::entry_matches(entry, key, options))
      .map(|entry| entry.response.clone())
      .collect();
  }

  pub fn match_one(&self, key: &RequestKey, options: MatchOptions) -> Option<StoredResponse> {
    return self.match_all(key, options).into_iter().next();
  }

  /// `put` consumed the response body into a buffer before we get here.
  pub fn put(&self, key: &RequestKey, response: StoredResponse) -> HostResult<()> {
    let vary_header = response
      .headers
      .iter()
      .find(|(name, _)| name.eq_ignore_ascii_case("vary"))
      .map(|(_, value)| value.clone());

    let mut vary = vec![];
    if let Some(vary_header) = vary_header {
      for name in vary_header.split(',').map(str::trim) {
        if name == "*" {
          return Err(HostError::invalid_input("cannot cache a Vary: * response"));
        }
        vary.push((
          name.to_string(),
          key.header(name).unwrap_or_default().to_string(),
        ));
      }
    }

    let entry = CacheEntry {
      method: key.method.clone(),
      url: key.url.clone(),
      vary,
      response,
    };

    let mut entries = self.entries.lock();
    // Replace any entry the new one would shadow.
    entries.retain(|existing| {
      !Self::entry_matches(
        existing,
        key,
        MatchOptions {
          ignore_search: false,
          ignore_method: false,
          ignore_vary: true,
        },
      )
    });
    entries.push(entry);
    return Ok(());
  }

  pub fn delete(&self, key: &RequestKey, options: MatchOptions) -> bool {
    let mut entries = self.entries.lock();
    let before = entries.len();
    entries.retain(|entry| !Self::entry_matches(entry, key, options));
    return entries.len() != before;
  }

  pub fn keys(&self) -> Vec<(String, String)> {
    return self
      .entries
      .lock()
      .iter()
      .map(|entry| (entry.method.clone(), entry.url.to_string()))
      .collect();
  }
}

/// Named registry of caches; creation on demand, name order preserved.
pub struct CacheRegistry {
  caches: Mutex<IndexMap<String, Arc<CacheStore>>>,
}

impl Default for CacheRegistry {
  fn default() -> Self {
    return Self::new();
  }
}

impl CacheRegistry {
  pub fn new() -> Self {
    return Self {
      caches: Mutex::new(IndexMap::new()),
    };
  }

  pub fn open(&self, name: &str) -> Arc<CacheStore> {
    return self
      .caches
      .lock()
      .entry(name.to_string())
      .or_default()
      .clone();
  }

  pub fn get(&self, name: &str) -> Option<Arc<CacheStore>> {
    return self.caches.lock().get(name).cloned();
  }

  pub fn has(&self, name: &str) -> bool {
    return self.caches.lock().contains_key(name);
  }

  pub fn delete(&self, name: &str) -> bool {
    return self.caches.lock().shift_remove(name).is_some();
  }

  pub fn names(&self) -> Vec<String> {
    return self.caches.lock().keys().cloned().collect();
  }
}

fn response_json(response: &StoredResponse) -> serde_json::Value {
  return serde_json::json!({
    "status": response.status,
    "statusText": response.status_text,
    "headers": response.headers,
    "body": encode_bytes(&response.body),
  });
}

fn key_from_args(args: &[serde_json::Value], i: usize) -> Result<RequestKey, rustyscript::Error> {
  let request: serde_json::Value = get_arg(args, i)?;
  let method = request
    .get("method")
    .and_then(|v| v.as_str())
    .unwrap_or("GET");
  let url = request
    .get("url")
    .and_then(|v| v.as_str())
    .ok_or_else(|| rustyscript::Error::Runtime("request url missing".to_string()))?;
  let headers: Vec<(String, String)> = request
    .get("headers")
    .cloned()
    .map(serde_json::from_value)
    .transpose()
    .map_err(|err| rustyscript::Error::Runtime(err.to_string()))?
    .unwrap_or_default();
  return Ok(RequestKey::parse(method, url, headers)?);
}

fn cache_by_rid(state: &HostState, rid: u64) -> HostResult<Arc<CacheStore>> {
  let name = state.resources.with_entry(rid, |r| match r {
    Resource::CacheName(cache) => Ok(cache.name.clone()),
    other => Err(crate::resource::wrong_kind(
      rid,
      crate::resource::ResourceKind::CacheName,
      other.kind(),
    )),
  })?;
  return state
    .caches
    .get(&name)
    .ok_or_else(|| HostError::new(crate::error::ErrorKind::NotFound, format!("cache '{name}'")));
}

async fn add_one(state: &Arc<HostState>, cache: &CacheStore, url: String) -> HostResult<()> {
  let key = RequestKey::parse("GET", &url, vec![])?;
  let request = FetchRequest {
    method: "GET".to_string(),
    url_list: vec![key.url.clone()],
    header_list: vec![],
    body: None,
    mode: RequestMode::Cors,
    credentials: crate::fetch::CredentialsMode::SameOrigin,
    redirect: RedirectMode::Follow,
    integrity: String::new(),
    origin: state.options.origin.clone(),
    destination: String::new(),
    redirect_count: 0,
  };

  let response = fetch::fetch(state, request).await?;
  if !(200..300).contains(&response.status) {
    return Err(HostError::new(
      crate::error::ErrorKind::Network,
      format!("cache add: status {} for {url}", response.status),
    ));
  }

  return cache.put(
    &key,
    StoredResponse {
      status: response.status,
      status_text: response.status_text,
      headers: response.header_list,
      body: response.body,
    },
  );
}

pub(crate) fn register(
  runtime: &mut rustyscript::Runtime,
  state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  {
    let state = state.clone();
    runtime.register_function("cacheStorage_open", move |args: &[serde_json::Value]| {
      let name: String = get_arg(args, 0)?;
      state.caches.open(&name);
      let rid = state
        .resources
        .insert(Resource::CacheName(CacheNameResource { name }));
      return Ok(rid.into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("cacheStorage_has", move |args: &[serde_json::Value]| {
      let name: String = get_arg(args, 0)?;
      return Ok(state.caches.has(&name).into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("cacheStorage_delete", move |args: &[serde_json::Value]| {
      let name: String = get_arg(args, 0)?;
      return Ok(state.caches.delete(&name).into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("cacheStorage_keys", move |_args: &[serde_json::Value]| {
      return Ok(serde_json::json!(state.caches.names()));
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("cacheStorage_match", move |args: &[serde_json::Value]| {
      let key = key_from_args(args, 0)?;
      let options = MatchOptions::from_json(args.get(1));
      for name in state.caches.names() {
        if let Some(cache) = state.caches.get(&name)
          && let Some(response) = cache.match_one(&key, options)
        {
          return Ok(response_json(&response));
        }
      }
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("cache_match", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let key = key_from_args(args, 1)?;
      let options = MatchOptions::from_json(args.get(2));
      return Ok(match cache_by_rid(&state, rid)?.match_one(&key, options) {
        Some(response) => response_json(&response),
        None => serde_json::Value::Null,
      });
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("cache_matchAll", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let key = key_from_args(args, 1)?;
      let options = MatchOptions::from_json(args.get(2));
      let responses: Vec<serde_json::Value> = cache_by_rid(&state, rid)?
        .match_all(&key, options)
        .iter()
        .map(response_json)
        .collect();
      return Ok(serde_json::Value::Array(responses));
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("cache_put", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let key = key_from_args(args, 1)?;
      let response: serde_json::Value = get_arg(args, 2)?;

      let body = match response.get("body") {
        Some(v) if !v.is_null() => Bytes::from(crate::host::decode_bytes(v)?),
        _ => Bytes::new(),
      };
      let headers: Vec<(String, String)> = response
        .get("headers")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|err| rustyscript::Error::Runtime(err.to_string()))?
        .unwrap_or_default();

      cache_by_rid(&state, rid)?.put(
        &key,
        StoredResponse {
          status: response.get("status").and_then(|v| v.as_u64()).unwrap_or(200) as u16,
          status_text: response
            .get("statusText")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
          headers,
          body,
        },
      )?;
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("cache_delete", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let key = key_from_args(args, 1)?;
      let options = MatchOptions::from_json(args.get(2));
      return Ok(cache_by_rid(&state, rid)?.delete(&key, options).into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("cache_keys", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let keys: Vec<serde_json::Value> = cache_by_rid(&state, rid)?
        .keys()
        .into_iter()
        .map(|(method, url)| serde_json::json!({ "method": method, "url": url }))
        .collect();
      return Ok(serde_json::Value::Array(keys));
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("cache_add", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let rid: u64 = get_arg(&args, 0)?;
        let url: String = get_arg(&args, 1)?;
        let cache = cache_by_rid(&state, rid)?;
        add_one(&state, &cache, url).await?;
        return Ok(serde_json::Value::Null);
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("cache_addAll", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let rid: u64 = get_arg(&args, 0)?;
        let urls: Vec<String> = get_arg(&args, 1)?;
        let cache = cache_by_rid(&state, rid)?;
        for url in urls {
          add_one(&state, &cache, url).await?;
        }
        return Ok(serde_json::Value::Null);
      })
    })?;
  }

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  fn stored(status: u16, headers: &[(&str, &str)]) -> StoredResponse {
    return StoredResponse {
      status,
      status_text: "OK".to_string(),
      headers: headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect(),
      body: Bytes::from_static(b"body"),
    };
  }

  #[test]
  fn test_match_ignores_fragment_always() {
    let cache = CacheStore::default();
    let key = RequestKey::parse("GET", "https://a.test/x#frag", vec![]).unwrap();
    cache.put(&key, stored(200, &[])).unwrap();

    let lookup = RequestKey::parse("GET", "https://a.test/x#other", vec![]).unwrap();
    assert!(cache.match_one(&lookup, MatchOptions::default()).is_some());
  }

  #[test]
  fn test_ignore_search() {
    let cache = CacheStore::default();
    let key = RequestKey::parse("GET", "https://a.test/x?v=1", vec![]).unwrap();
    cache.put(&key, stored(200, &[])).unwrap();

    let lookup = RequestKey::parse("GET", "https://a.test/x?v=2", vec![]).unwrap();
    assert!(cache.match_one(&lookup, MatchOptions::default()).is_none());
    assert!(
      cache
        .match_one(
          &lookup,
          MatchOptions {
            ignore_search: true,
            ..Default::default()
          }
        )
        .is_some()
    );
  }

  #[test]
  fn test_ignore_method() {
    let cache = CacheStore::default();
    let key = RequestKey::parse("GET", "https://a.test/x", vec![]).unwrap();
    cache.put(&key, stored(200, &[])).unwrap();

    let lookup = RequestKey::parse("HEAD", "https://a.test/x", vec![]).unwrap();
    assert!(cache.match_one(&lookup, MatchOptions::default()).is_none());
    assert!(
      cache
        .match_one(
          &lookup,
          MatchOptions {
            ignore_method: true,
            ..Default::default()
          }
        )
        .is_some()
    );
  }

  #[test]
  fn test_vary_discriminates() {
    let cache = CacheStore::default();
    let key = RequestKey::parse(
      "GET",
      "https://a.test/x",
      vec![("Accept-Language".to_string(), "de".to_string())],
    )
    .unwrap();
    cache
      .put(&key, stored(200, &[("Vary", "accept-language")]))
      .unwrap();

    let same = RequestKey::parse(
      "GET",
      "https://a.test/x",
      vec![("accept-language".to_string(), "de".to_string())],
    )
    .unwrap();
    assert!(cache.match_one(&same, MatchOptions::default()).is_some());

    let other = RequestKey::parse(
      "GET",
      "https://a.test/x",
      vec![("accept-language".to_string(), "en".to_string())],
    )
    .unwrap();
    assert!(cache.match_one(&other, MatchOptions::default()).is_none());
    assert!(
      cache
        .match_one(
          &other,
          MatchOptions {
            ignore_vary: true,
            ..Default::default()
          }
        )
        .is_some()
    );
  }

  #[test]
  fn test_vary_star_rejected() {
    let cache = CacheStore::default();
    let key = RequestKey::parse("GET", "https://a.test/x", vec![]).unwrap();
    assert!(cache.put(&key, stored(200, &[("Vary", "*")])).is_err());
  }

  #[test]
  fn test_put_replaces_and_delete_removes() {
    let cache = CacheStore::default();
    let key = RequestKey::parse("GET", "https://a.test/x", vec![]).unwrap();
    cache.put(&key, stored(200, &[])).unwrap();
    cache.put(&key, stored(204, &[])).unwrap();

    assert_eq!(1, cache.keys().len());
    assert_eq!(
      204,
      cache.match_one(&key, MatchOptions::default()).unwrap().status
    );

    assert!(cache.delete(&key, MatchOptions::default()));
    assert!(!cache.delete(&key, MatchOptions::default()));
  }

  #[test]
  fn test_registry_named_caches() {
    let registry = CacheRegistry::new();
    assert!(!registry.has("v1"));

    registry.open("v1");
    registry.open("v2");
    assert!(registry.has("v1"));
    assert_eq!(vec!["v1", "v2"], registry.names());

    assert!(registry.delete("v1"));
    assert!(!registry.has("v1"));
  }
}
