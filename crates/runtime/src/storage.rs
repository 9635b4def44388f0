use andromeda_sqlite::{Connection, ParamValues, Value};
use indexmap::IndexMap;
use log::*;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::data_dir::DataDir;
use crate::error::HostResult;
use crate::host::{HostState, get_arg};

/// One keyed store. Reads are served from the in-memory map; the
/// persistent flavor writes through to SQLite behind the caller's back.
/// Key iteration order is insertion order.
pub struct StorageArea {
  map: Mutex<IndexMap<String, String>>,
  conn: Option<Connection>,
}

impl StorageArea {
  fn ephemeral() -> Self {
    return Self {
      map: Mutex::new(IndexMap::new()),
      conn: None,
    };
  }

  pub fn length(&self) -> usize {
    return self.map.lock().len();
  }

  pub fn key(&self, index: usize) -> Option<String> {
    return self.map.lock().get_index(index).map(|(k, _)| k.clone());
  }

  pub fn get_item(&self, key: &str) -> Option<String> {
    return self.map.lock().get(key).cloned();
  }

  pub fn set_item(&self, key: String, value: String) {
    self.map.lock().insert(key.clone(), value.clone());

    if let Some(conn) = &self.conn {
      conn.call_and_forget(move |state| {
        let result = state.with_connection(|conn| {
          let mut stmt = conn.prepare_cached(
            "INSERT INTO kv (key, value) VALUES ($1, $2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
          )?;
          ParamValues::Positional(vec![Value::Text(key), Value::Text(value)]).bind(&mut stmt, false)?;
          stmt.raw_execute()?;
          return Ok(());
        });
        if let Err(err) = result {
          warn!("storage write-behind failed: {err}");
        }
      });
    }
  }

  pub fn remove_item(&self, key: &str) {
    self.map.lock().shift_remove(key);

    if let Some(conn) = &self.conn {
      let key = key.to_string();
      conn.call_and_forget(move |state| {
        let result = state.with_connection(|conn| {
          let mut stmt = conn.prepare_cached("DELETE FROM kv WHERE key = $1")?;
          ParamValues::Positional(vec![Value::Text(key)]).bind(&mut stmt, false)?;
          stmt.raw_execute()?;
          return Ok(());
        });
        if let Err(err) = result {
          warn!("storage write-behind failed: {err}");
        }
      });
    }
  }

  pub fn clear(&self) {
    self.map.lock().clear();

    if let Some(conn) = &self.conn {
      conn.call_and_forget(|state| {
        let result = state.with_connection(|conn| {
          conn.execute("DELETE FROM kv", ())?;
          return Ok(());
        });
        if let Err(err) = result {
          warn!("storage write-behind failed: {err}");
        }
      });
    }
  }

  pub fn keys(&self) -> Vec<String> {
    return self.map.lock().keys().cloned().collect();
  }

  /// Wait until every queued write-behind landed.
  pub async fn flush(&self) -> HostResult<()> {
    if let Some(conn) = &self.conn {
      conn.call(|_state| Ok(())).await.map_err(crate::error::HostError::from)?;
    }
    return Ok(());
  }
}

/// Local/session storage per §storage: `persistent` survives runs under
/// the profile path, `ephemeral` lives for the process.
pub struct StorageEngine {
  persistent: StorageArea,
  ephemeral: StorageArea,
}

impl StorageEngine {
  pub async fn open(data_dir: &DataDir) -> HostResult<Self> {
    let conn = Connection::open_path(data_dir.storage_db_path(), None)
      .map_err(crate::error::HostError::from)?;
    conn
      .execute_batch(
        "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL) STRICT",
      )
      .await
      .map_err(crate::error::HostError::from)?;

    // Rowid order reproduces insertion order across runs.
    let rows = conn
      .query_rows("SELECT key, value FROM kv ORDER BY rowid", ParamValues::Positional(vec![]))
      .await
      .map_err(crate::error::HostError::from)?;

    let mut map = IndexMap::new();
    for row in rows.iter() {
      if let (Some(Value::Text(key)), Some(Value::Text(value))) = (row.value(0), row.value(1)) {
        map.insert(key.clone(), value.clone());
      }
    }

    return Ok(Self {
      persistent: StorageArea {
        map: Mutex::new(map),
        conn: Some(conn),
      },
      ephemeral: StorageArea::ephemeral(),
    });
  }

  pub fn area(&self, persistent: bool) -> &StorageArea {
    return if persistent {
      &self.persistent
    } else {
      &self.ephemeral
    };
  }
}

pub(crate) fn register(
  runtime: &mut rustyscript::Runtime,
  state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  // Store handles are stable: 1 = persistent (local), 0 = ephemeral
  // (session).
  {
    runtime.register_function("storage_new", move |args: &[serde_json::Value]| {
      let persistent: bool = get_arg(args, 0)?;
      return Ok(u64::from(persistent).into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("storage_length", move |args: &[serde_json::Value]| {
      let persistent: u64 = get_arg(args, 0)?;
      return Ok((state.storage.area(persistent == 1).length() as u64).into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("storage_key", move |args: &[serde_json::Value]| {
      let persistent: u64 = get_arg(args, 0)?;
      let index: usize = get_arg(args, 1)?;
      return Ok(match state.storage.area(persistent == 1).key(index) {
        Some(key) => key.into(),
        None => serde_json::Value::Null,
      });
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("storage_getItem", move |args: &[serde_json::Value]| {
      let persistent: u64 = get_arg(args, 0)?;
      let key: String = get_arg(args, 1)?;
      return Ok(match state.storage.area(persistent == 1).get_item(&key) {
        Some(value) => value.into(),
        None => serde_json::Value::Null,
      });
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("storage_setItem", move |args: &[serde_json::Value]| {
      let persistent: u64 = get_arg(args, 0)?;
      let key: String = get_arg(args, 1)?;
      let value: String = get_arg(args, 2)?;
      state.storage.area(persistent == 1).set_item(key, value);
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("storage_removeItem", move |args: &[serde_json::Value]| {
      let persistent: u64 = get_arg(args, 0)?;
      let key: String = get_arg(args, 1)?;
      state.storage.area(persistent == 1).remove_item(&key);
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("storage_clear", move |args: &[serde_json::Value]| {
      let persistent: u64 = get_arg(args, 0)?;
      state.storage.area(persistent == 1).clear();
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("storage_iterate_keys", move |args: &[serde_json::Value]| {
      let persistent: u64 = get_arg(args, 0)?;
      let keys = state.storage.area(persistent == 1).keys();
      return Ok(serde_json::json!(keys));
    })?;
  }

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;
  use temp_dir::TempDir;

  #[test]
  fn test_insertion_order_iteration() {
    let area = StorageArea::ephemeral();
    area.set_item("b".to_string(), "1".to_string());
    area.set_item("a".to_string(), "2".to_string());
    area.set_item("c".to_string(), "3".to_string());

    assert_eq!(vec!["b", "a", "c"], area.keys());
    assert_eq!(Some("a".to_string()), area.key(1));

    // Overwriting keeps the original position.
    area.set_item("a".to_string(), "9".to_string());
    assert_eq!(vec!["b", "a", "c"], area.keys());
    assert_eq!(Some("9".to_string()), area.get_item("a"));

    // Remove and re-add moves the key to the end.
    area.remove_item("b");
    area.set_item("b".to_string(), "1".to_string());
    assert_eq!(vec!["a", "c", "b"], area.keys());

    area.clear();
    assert_eq!(0, area.length());
  }

  #[tokio::test]
  async fn test_persistent_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let data_dir = DataDir(tmp.path().to_path_buf());
    data_dir.ensure_directory_structure().unwrap();

    {
      let engine = StorageEngine::open(&data_dir).await.unwrap();
      let area = engine.area(true);
      area.set_item("greeting".to_string(), "hello".to_string());
      area.set_item("x".to_string(), "y".to_string());
      area.remove_item("x");
      area.flush().await.unwrap();
    }

    let engine = StorageEngine::open(&data_dir).await.unwrap();
    let area = engine.area(true);
    assert_eq!(Some("hello".to_string()), area.get_item("greeting"));
    assert_eq!(None, area.get_item("x"));
    assert_eq!(1, area.length());

    // The ephemeral area starts empty regardless.
    assert_eq!(0, engine.area(false).length());
  }
}
