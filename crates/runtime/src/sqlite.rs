use andromeda_sqlite::{Connection, ParamValues, Row, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;

use crate::error::{ErrorKind, HostError, HostResult};
use crate::host::{HostState, get_arg, opt_arg};
use crate::pool::CancellationFlag;
use crate::resource::{Resource, ResourceKind, SqliteConnResource, SqliteStmtResource, wrong_kind};
use crate::runtime::build_call_sync_js_function_message;

/// JSON ↔ SQLite value mapping. Integers outside the float-safe range and
/// all integers under `readBigInts` travel as `{"__bigint": "<decimal>"}`
/// so the preamble can produce real BigInts; blobs travel as
/// `{"__blob": "<base64>"}`.
fn json_to_sql(value: &serde_json::Value) -> HostResult<Value> {
  return Ok(match value {
    serde_json::Value::Null => Value::Null,
    serde_json::Value::Bool(b) => Value::Integer(*b as i64),
    serde_json::Value::String(s) => Value::Text(s.clone()),
    serde_json::Value::Number(n) => {
      if let Some(i) = n.as_i64() {
        Value::Integer(i)
      } else if let Some(f) = n.as_f64() {
        Value::Real(f)
      } else {
        return Err(HostError::type_mismatch(format!("invalid number: {n}")));
      }
    }
    serde_json::Value::Object(map) => {
      if let Some(serde_json::Value::String(s)) = map.get("__bigint") {
        Value::Integer(s.parse::<i64>().map_err(|_| {
          HostError::type_mismatch(format!("bigint out of sqlite range: {s}"))
        })?)
      } else if let Some(blob) = map.get("__blob") {
        Value::Blob(crate::host::decode_bytes(blob)?)
      } else {
        return Err(HostError::type_mismatch("object parameters unsupported"));
      }
    }
    serde_json::Value::Array(_) => {
      return Err(HostError::type_mismatch("array parameters unsupported"));
    }
  });
}

const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

fn sql_to_json(value: &Value, read_bigints: bool) -> serde_json::Value {
  return match value {
    Value::Null => serde_json::Value::Null,
    Value::Integer(i) => {
      if read_bigints || i.abs() > MAX_SAFE_INTEGER {
        serde_json::json!({ "__bigint": i.to_string() })
      } else {
        serde_json::json!(i)
      }
    }
    Value::Real(f) => serde_json::json!(f),
    Value::Text(s) => serde_json::json!(s),
    Value::Blob(b) => serde_json::json!({ "__blob": crate::host::encode_bytes(b) }),
  };
}

fn row_to_json(row: &Row, read_bigints: bool) -> serde_json::Value {
  let mut object = serde_json::Map::new();
  for idx in 0..row.len() {
    let name = row.column_name(idx).unwrap_or_default().to_string();
    let value = row
      .value(idx)
      .map(|v| sql_to_json(v, read_bigints))
      .unwrap_or(serde_json::Value::Null);
    object.insert(name, value);
  }
  return serde_json::Value::Object(object);
}

fn params_from_arg(args: &[serde_json::Value], i: usize) -> Result<ParamValues, rustyscript::Error> {
  return Ok(match args.get(i) {
    None | Some(serde_json::Value::Null) => ParamValues::Positional(vec![]),
    Some(serde_json::Value::Array(items)) => ParamValues::Positional(
      items
        .iter()
        .map(json_to_sql)
        .collect::<HostResult<Vec<_>>>()?,
    ),
    Some(serde_json::Value::Object(map)) => ParamValues::Named(
      map
        .iter()
        .map(|(name, v)| Ok((name.clone(), json_to_sql(v)?)))
        .collect::<HostResult<Vec<_>>>()?,
    ),
    Some(other) => {
      return Err(
        HostError::type_mismatch(format!("invalid parameter set: {other}")).into(),
      );
    }
  });
}

fn conn_by_rid(state: &HostState, rid: u64) -> HostResult<(Connection, Arc<AtomicBool>)> {
  return state.resources.with_entry(rid, |r| match r {
    Resource::SqliteConn(conn) => Ok((conn.conn.clone(), conn.load_extension_enabled.clone())),
    other => Err(wrong_kind(rid, ResourceKind::SqliteConn, other.kind())),
  });
}

fn stmt_by_rid(state: &HostState, rid: u64) -> HostResult<(Connection, u64, bool)> {
  return state.resources.with_entry(rid, |r| match r {
    Resource::SqliteStmt(stmt) => Ok((stmt.conn.clone(), stmt.stmt_id, stmt.read_bigints)),
    other => Err(wrong_kind(rid, ResourceKind::SqliteStmt, other.kind())),
  });
}

fn sql_ref_to_json(value: rusqlite::types::ValueRef<'_>) -> serde_json::Value {
  return sql_to_json(&value.into(), false);
}

/// Register a script-backed scalar function. The connection worker blocks
/// on the script thread's reply; the worker is never the script thread,
/// so the loop stays free to service the call.
async fn register_function(
  state: Arc<HostState>,
  conn: Connection,
  name: String,
  function_id: u64,
  arg_count: i32,
  deterministic: bool,
) -> HostResult<()> {
  let dispatcher = AssertUnwindSafe((state.loop_sender.clone(), state.io.clone()));

  conn
    .call(move |db| {
      return db.with_connection(move |conn| {
        let mut flags = rusqlite::functions::FunctionFlags::SQLITE_UTF8;
        if deterministic {
          flags |= rusqlite::functions::FunctionFlags::SQLITE_DETERMINISTIC;
        }

        conn.create_scalar_function(
          &name,
          arg_count,
          flags,
          move |ctx: &rusqlite::functions::Context<'_>| -> rusqlite::Result<Value> {
            let args: Vec<serde_json::Value> = (0..ctx.len())
              .map(|i| Ok(sql_ref_to_json(ctx.get_raw(i))))
              .collect::<rusqlite::Result<_>>()?;

            let (sender, receiver) = oneshot::channel::<Result<serde_json::Value, rustyscript::Error>>();
            let message = build_call_sync_js_function_message::<serde_json::Value>(
              None,
              "__dispatchSqliteFunction",
              (function_id, args),
              move |result| {
                let _ = sender.send(result);
              },
            );

            let (loop_sender, io) = &*dispatcher;
            io.block_on(loop_sender.send(message)).map_err(|err| {
              rusqlite::Error::UserFunctionError(format!("dispatch failed: {err}").into())
            })?;

            let value = receiver
              .blocking_recv()
              .map_err(|_| {
                rusqlite::Error::UserFunctionError("function reply dropped".into())
              })?
              .map_err(|err| rusqlite::Error::UserFunctionError(err.to_string().into()))?;

            return json_to_sql(&value)
              .map_err(|err| rusqlite::Error::UserFunctionError(err.to_string().into()));
          },
        )?;
        return Ok(());
      });
    })
    .await
    .map_err(HostError::from)
}

pub(crate) fn register(
  runtime: &mut rustyscript::Runtime,
  state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  {
    let state = state.clone();
    runtime.register_async_function("sqlite_open", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let path: String = get_arg(&args, 0)?;

        let receiver = state.pool.submit(CancellationFlag::new(), move |_flag| {
          let conn = if path == ":memory:" {
            Connection::open_in_memory()
          } else {
            Connection::open_path(&path, None)
          };
          return conn.map_err(HostError::from);
        });
        let conn = crate::bridge::await_completion(receiver).await?;

        let rid = state.resources.insert(Resource::SqliteConn(SqliteConnResource {
          conn,
          load_extension_enabled: Arc::new(AtomicBool::new(false)),
        }));
        return Ok(rid.into());
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("sqlite_close", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let rid: u64 = get_arg(&args, 0)?;

        // Dropping the entry invalidates the connection's statements too;
        // their next operation fails with BadResource/BadHandle.
        let Some(Resource::SqliteConn(conn)) = state.resources.remove(rid) else {
          return Err(HostError::bad_resource(rid).into());
        };
        conn.conn.close().await.map_err(HostError::from)?;
        return Ok(serde_json::Value::Null);
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("sqlite_exec", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let rid: u64 = get_arg(&args, 0)?;
        let sql: String = get_arg(&args, 1)?;

        let (conn, _) = conn_by_rid(&state, rid)?;
        conn.execute_batch(sql).await.map_err(HostError::from)?;
        return Ok(serde_json::Value::Null);
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("sqlite_prepare", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let rid: u64 = get_arg(&args, 0)?;
        let sql: String = get_arg(&args, 1)?;

        let (conn, _) = conn_by_rid(&state, rid)?;
        let stmt_id = conn
          .call(move |db| db.prepare(&sql))
          .await
          .map_err(HostError::from)?;

        let stmt_rid = state.resources.insert(Resource::SqliteStmt(SqliteStmtResource {
          conn,
          stmt_id,
          read_bigints: false,
        }));
        return Ok(stmt_rid.into());
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("sqlite_stmt_run", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let rid: u64 = get_arg(&args, 0)?;
        let params = params_from_arg(&args, 1)?;

        let (conn, stmt_id, read_bigints) = stmt_by_rid(&state, rid)?;
        let result = conn
          .call(move |db| db.statement_run(stmt_id, params))
          .await
          .map_err(HostError::from)?;

        return Ok(serde_json::json!({
          "changes": result.changes,
          "lastInsertRowid": sql_to_json(&Value::Integer(result.last_insert_rowid), read_bigints),
        }));
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("sqlite_stmt_get", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let rid: u64 = get_arg(&args, 0)?;
        let params = params_from_arg(&args, 1)?;

        let (conn, stmt_id, read_bigints) = stmt_by_rid(&state, rid)?;
        let row = conn
          .call(move |db| db.statement_get(stmt_id, params))
          .await
          .map_err(HostError::from)?;

        return Ok(match row {
          Some(row) => row_to_json(&row, read_bigints),
          None => serde_json::Value::Null,
        });
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("sqlite_stmt_all", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let rid: u64 = get_arg(&args, 0)?;
        let params = params_from_arg(&args, 1)?;

        let (conn, stmt_id, read_bigints) = stmt_by_rid(&state, rid)?;
        let rows = conn
          .call(move |db| db.statement_all(stmt_id, params))
          .await
          .map_err(HostError::from)?;

        let values: Vec<serde_json::Value> =
          rows.iter().map(|row| row_to_json(row, read_bigints)).collect();
        return Ok(serde_json::Value::Array(values));
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("sqlite_stmt_iterate", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let rid: u64 = get_arg(&args, 0)?;
        let params = params_from_arg(&args, 1)?;

        let (conn, stmt_id, _) = stmt_by_rid(&state, rid)?;
        conn
          .call(move |db| db.statement_iterate(stmt_id, params))
          .await
          .map_err(HostError::from)?;
        return Ok(serde_json::Value::Null);
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("sqlite_stmt_next", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let rid: u64 = get_arg(&args, 0)?;

        let (conn, stmt_id, read_bigints) = stmt_by_rid(&state, rid)?;
        let row = conn
          .call(move |db| db.statement_next(stmt_id))
          .await
          .map_err(HostError::from)?;

        return Ok(match row {
          Some(row) => serde_json::json!({ "done": false, "value": row_to_json(&row, read_bigints) }),
          None => serde_json::json!({ "done": true, "value": serde_json::Value::Null }),
        });
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("sqlite_stmt_source_sql", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let rid: u64 = get_arg(&args, 0)?;
        let (conn, stmt_id, _) = stmt_by_rid(&state, rid)?;
        let sql = conn
          .call(move |db| db.statement_source_sql(stmt_id))
          .await
          .map_err(HostError::from)?;
        return Ok(sql.into());
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function(
      "sqlite_stmt_expanded_sql",
      move |args: Vec<serde_json::Value>| {
        let state = state.clone();
        Box::pin(async move {
          let _guard = state.pending_ops.guard();
          let rid: u64 = get_arg(&args, 0)?;
          let (conn, stmt_id, _) = stmt_by_rid(&state, rid)?;
          let sql = conn
            .call(move |db| db.statement_expanded_sql(stmt_id))
            .await
            .map_err(HostError::from)?;
          return Ok(match sql {
            Some(sql) => sql.into(),
            None => serde_json::Value::Null,
          });
        })
      },
    )?;
  }
  {
    let state = state.clone();
    runtime.register_function("sqlite_stmt_set_read_bigints", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let enabled: bool = get_arg(args, 1)?;
      state.resources.with_entry(rid, |r| match r {
        Resource::SqliteStmt(stmt) => {
          stmt.read_bigints = enabled;
          return Ok(());
        }
        other => Err(wrong_kind(rid, ResourceKind::SqliteStmt, other.kind())),
      })?;
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function(
      "sqlite_stmt_set_allow_bare_named",
      move |args: Vec<serde_json::Value>| {
        let state = state.clone();
        Box::pin(async move {
          let _guard = state.pending_ops.guard();
          let rid: u64 = get_arg(&args, 0)?;
          let allow: bool = get_arg(&args, 1)?;
          let (conn, stmt_id, _) = stmt_by_rid(&state, rid)?;
          conn
            .call(move |db| db.statement_set_allow_bare_named(stmt_id, allow))
            .await
            .map_err(HostError::from)?;
          return Ok(serde_json::Value::Null);
        })
      },
    )?;
  }
  {
    let state = state.clone();
    runtime.register_function("sqlite_stmt_finalize", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      if let Some(Resource::SqliteStmt(stmt)) = state.resources.remove(rid) {
        let stmt_id = stmt.stmt_id;
        stmt.conn.call_and_forget(move |db| db.statement_finalize(stmt_id));
      }
      return Ok(serde_json::Value::Null);
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function(
      "sqlite_enable_load_extension",
      move |args: &[serde_json::Value]| {
        let rid: u64 = get_arg(args, 0)?;
        let enabled: bool = get_arg(args, 1)?;
        let (_, flag) = conn_by_rid(&state, rid)?;
        flag.store(enabled, Ordering::SeqCst);
        return Ok(serde_json::Value::Null);
      },
    )?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("sqlite_load_extension", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let rid: u64 = get_arg(&args, 0)?;
        let path: String = get_arg(&args, 1)?;
        let entry: Option<String> = opt_arg(&args, 2);

        let (conn, flag) = conn_by_rid(&state, rid)?;
        if !flag.load(Ordering::SeqCst) {
          return Err(
            HostError::new(ErrorKind::PermissionDenied, "extension loading is disabled").into(),
          );
        }

        conn
          .call(move |db| db.load_extension(&path, entry.as_deref()))
          .await
          .map_err(HostError::from)?;
        return Ok(serde_json::Value::Null);
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("sqlite_function", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let rid: u64 = get_arg(&args, 0)?;
        let name: String = get_arg(&args, 1)?;
        let function_id: u64 = get_arg(&args, 2)?;
        let options = args.get(3).cloned().unwrap_or(serde_json::Value::Null);

        let arg_count = options
          .get("varargs")
          .and_then(|v| v.as_bool())
          .unwrap_or(false)
          .then_some(-1)
          .or_else(|| options.get("length").and_then(|v| v.as_i64()).map(|n| n as i32))
          .unwrap_or(-1);
        let deterministic = options
          .get("deterministic")
          .and_then(|v| v.as_bool())
          .unwrap_or(false);

        let (conn, _) = conn_by_rid(&state, rid)?;
        register_function(state.clone(), conn, name, function_id, arg_count, deterministic)
          .await?;
        return Ok(serde_json::Value::Null);
      })
    })?;
  }

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_value_round_trip() {
    let cases = [
      (serde_json::json!(null), Value::Null),
      (serde_json::json!(true), Value::Integer(1)),
      (serde_json::json!(42), Value::Integer(42)),
      (serde_json::json!(1.5), Value::Real(1.5)),
      (serde_json::json!("txt"), Value::Text("txt".to_string())),
      (
        serde_json::json!({ "__bigint": "9007199254740993" }),
        Value::Integer(9_007_199_254_740_993),
      ),
    ];

    for (json, sql) in cases {
      assert_eq!(sql, json_to_sql(&json).unwrap());
    }
  }

  #[test]
  fn test_large_integers_surface_as_bigints() {
    let value = Value::Integer(MAX_SAFE_INTEGER + 2);
    assert_eq!(
      serde_json::json!({ "__bigint": "9007199254740993" }),
      sql_to_json(&value, false)
    );

    // With readBigInts every integer is tagged.
    assert_eq!(
      serde_json::json!({ "__bigint": "7" }),
      sql_to_json(&Value::Integer(7), true)
    );
    assert_eq!(serde_json::json!(7), sql_to_json(&Value::Integer(7), false));
  }

  #[test]
  fn test_blob_encoding() {
    let sql = json_to_sql(&serde_json::json!({ "__blob": "aGk=" })).unwrap();
    assert_eq!(Value::Blob(b"hi".to_vec()), sql);
    assert_eq!(
      serde_json::json!({ "__blob": "aGk=" }),
      sql_to_json(&sql, false)
    );
  }

  #[tokio::test]
  async fn test_transactional_count() {
    let conn = Connection::open_in_memory().unwrap();
    conn
      .execute_batch("CREATE TABLE t (n INTEGER)")
      .await
      .unwrap();

    conn.execute_batch("BEGIN").await.unwrap();
    let id = conn.call(|db| db.prepare("INSERT INTO t (n) VALUES (99)")).await.unwrap();
    conn
      .call(move |db| db.statement_run(id, ParamValues::Positional(vec![])))
      .await
      .unwrap();

    let count = conn
      .query_row("SELECT COUNT(*) FROM t WHERE n = 99", ParamValues::Positional(vec![]))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(Some(&Value::Integer(1)), count.value(0));

    conn.execute_batch("COMMIT").await.unwrap();
    let count = conn
      .query_row("SELECT COUNT(*) FROM t WHERE n = 99", ParamValues::Positional(vec![]))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(Some(&Value::Integer(1)), count.value(0));
  }
}
