use kanal::{Receiver, Sender};
use log::*;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::params::ParamValues;
use crate::rows::{Column, Row, Rows, columns};

/// The result returned on method calls in this crate.
pub type Result<T> = std::result::Result<T, Error>;

pub struct PreparedStatement<'conn> {
  stmt: rusqlite::Statement<'conn>,
  sql: String,
  allow_bare_named: bool,
  /// Cursor state for `iterate`. Rows are materialized on this thread and
  /// handed out one at a time; re-binding replaces the cursor.
  pending: Option<VecDeque<Row>>,
}

struct StatementMap<'conn> {
  stmts: HashMap<u64, PreparedStatement<'conn>>,
}

self_cell::self_cell!(
  struct DbCell {
    owner: rusqlite::Connection,

    #[not_covariant]
    dependent: StatementMap,
  }
);

/// Connection plus the registry of live prepared statements. Lives on the
/// connection thread; callers reach it through boxed closures.
pub struct DbState {
  cell: DbCell,
  next_statement_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
  pub changes: usize,
  pub last_insert_rowid: i64,
}

impl DbState {
  fn new(conn: rusqlite::Connection) -> Self {
    return DbState {
      cell: DbCell::new(conn, |_conn| StatementMap {
        stmts: HashMap::new(),
      }),
      next_statement_id: 0,
    };
  }

  pub fn with_connection<R>(
    &mut self,
    f: impl FnOnce(&rusqlite::Connection) -> Result<R>,
  ) -> Result<R> {
    return self.cell.with_dependent_mut(|conn, _stmts| f(conn));
  }

  pub fn prepare(&mut self, sql: &str) -> Result<u64> {
    let id = self.next_statement_id;
    self.cell.with_dependent_mut(|conn, map| -> Result<()> {
      let stmt = conn.prepare(sql)?;
      map.stmts.insert(
        id,
        PreparedStatement {
          stmt,
          sql: sql.to_string(),
          allow_bare_named: false,
          pending: None,
        },
      );
      return Ok(());
    })?;

    self.next_statement_id += 1;
    return Ok(id);
  }

  fn with_statement<R>(
    &mut self,
    id: u64,
    f: impl FnOnce(&rusqlite::Connection, &mut PreparedStatement<'_>) -> Result<R>,
  ) -> Result<R> {
    return self.cell.with_dependent_mut(|conn, map| {
      let stmt = map.stmts.get_mut(&id).ok_or(Error::BadHandle(id))?;
      return f(conn, stmt);
    });
  }

  pub fn statement_run(&mut self, id: u64, params: ParamValues) -> Result<RunResult> {
    return self.with_statement(id, |conn, st| {
      st.bind(params)?;
      let changes = st.stmt.raw_execute()?;
      return Ok(RunResult {
        changes,
        last_insert_rowid: conn.last_insert_rowid(),
      });
    });
  }

  pub fn statement_get(&mut self, id: u64, params: ParamValues) -> Result<Option<Row>> {
    return self.with_statement(id, |_conn, st| {
      st.bind(params)?;
      let cols: Arc<Vec<Column>> = Arc::new(columns(&st.stmt));
      let mut rows = st.stmt.raw_query();
      return match rows.next()? {
        Some(row) => Ok(Some(Row::from_row(row, cols)?)),
        None => Ok(None),
      };
    });
  }

  pub fn statement_all(&mut self, id: u64, params: ParamValues) -> Result<Rows> {
    return self.with_statement(id, |_conn, st| {
      st.bind(params)?;
      return Ok(Rows::from_rows(st.stmt.raw_query())?);
    });
  }

  /// (Re)start the statement's cursor. Binding new parameters rewinds.
  pub fn statement_iterate(&mut self, id: u64, params: ParamValues) -> Result<()> {
    return self.with_statement(id, |_conn, st| {
      st.bind(params)?;
      let rows = Rows::from_rows(st.stmt.raw_query())?;
      st.pending = Some(rows.into_iter().collect());
      return Ok(());
    });
  }

  pub fn statement_next(&mut self, id: u64) -> Result<Option<Row>> {
    return self.with_statement(id, |_conn, st| {
      let Some(pending) = &mut st.pending else {
        return Ok(None);
      };
      let row = pending.pop_front();
      if row.is_none() {
        st.pending = None;
      }
      return Ok(row);
    });
  }

  pub fn statement_source_sql(&mut self, id: u64) -> Result<String> {
    return self.with_statement(id, |_conn, st| Ok(st.sql.clone()));
  }

  pub fn statement_expanded_sql(&mut self, id: u64) -> Result<Option<String>> {
    return self.with_statement(id, |_conn, st| Ok(st.stmt.expanded_sql()));
  }

  pub fn statement_set_allow_bare_named(&mut self, id: u64, allow: bool) -> Result<()> {
    return self.with_statement(id, |_conn, st| {
      st.allow_bare_named = allow;
      return Ok(());
    });
  }

  /// Idempotent. Later operations on the handle fail with `BadHandle`.
  pub fn statement_finalize(&mut self, id: u64) {
    self.cell.with_dependent_mut(|_conn, map| {
      map.stmts.remove(&id);
    });
  }

  pub fn load_extension(&mut self, path: &str, entry: Option<&str>) -> Result<()> {
    return self.with_connection(|conn| {
      unsafe {
        let _guard = rusqlite::LoadExtensionGuard::new(conn)?;
        conn.load_extension(path, entry)?;
      }
      return Ok(());
    });
  }

  fn close(self) -> Result<()> {
    return self
      .cell
      .into_owner()
      .close()
      .map_err(|(_conn, err)| Error::Close(err));
  }
}

impl PreparedStatement<'_> {
  /// An empty parameter set keeps the previous bindings, which is how a
  /// cursor is rewound without re-binding.
  fn bind(&mut self, params: ParamValues) -> Result<()> {
    if params.is_empty() {
      return Ok(());
    }
    self.stmt.clear_bindings();
    return params.bind(&mut self.stmt, self.allow_bare_named);
  }
}

enum Message {
  Run(Box<dyn FnOnce(&mut DbState) + Send + 'static>),
  Terminate(oneshot::Sender<Result<()>>),
}

#[derive(Clone)]
pub struct Options {
  pub busy_timeout: std::time::Duration,
}

impl Default for Options {
  fn default() -> Self {
    return Self {
      busy_timeout: std::time::Duration::from_secs(5),
    };
  }
}

/// A handle to call functions on the connection thread.
#[derive(Clone)]
pub struct Connection {
  sender: Sender<Message>,
}

impl Connection {
  pub fn new<E>(
    builder: impl FnOnce() -> std::result::Result<rusqlite::Connection, E>,
    opt: Option<Options>,
  ) -> std::result::Result<Self, E>
  where
    E: From<rusqlite::Error>,
  {
    let conn = builder()?;
    if let Some(timeout) = opt.as_ref().map(|o| o.busy_timeout) {
      conn.busy_timeout(timeout)?;
    }

    debug!(
      "Opened SQLite DB '{}'",
      conn.path().filter(|p| !p.is_empty()).unwrap_or("<in-memory>")
    );

    let (sender, receiver) = kanal::unbounded::<Message>();
    std::thread::Builder::new()
      .name("andromeda-sqlite".to_string())
      .spawn(move || event_loop(DbState::new(conn), receiver))
      .expect("startup");

    return Ok(Self { sender });
  }

  /// Open a new connection to an in-memory SQLite database.
  ///
  /// # Failure
  ///
  /// Will return `Err` if the underlying SQLite open call fails.
  pub fn open_in_memory() -> Result<Self> {
    return Self::new(|| Ok(rusqlite::Connection::open_in_memory()?), None);
  }

  pub fn open_path(path: impl AsRef<std::path::Path>, opt: Option<Options>) -> Result<Self> {
    let path = path.as_ref().to_path_buf();
    return Self::new(move || Ok(rusqlite::Connection::open(path)?), opt);
  }

  /// Call a function on the connection thread and get the result
  /// asynchronously.
  ///
  /// # Failure
  ///
  /// Will return `Err` if the database connection has been closed.
  #[inline]
  pub async fn call<F, R>(&self, function: F) -> Result<R>
  where
    F: FnOnce(&mut DbState) -> Result<R> + Send + 'static,
    R: Send + 'static,
  {
    let (sender, receiver) = oneshot::channel::<Result<R>>();

    self
      .sender
      .send(Message::Run(Box::new(move |state| {
        if !sender.is_closed() {
          let _ = sender.send(function(state));
        }
      })))
      .map_err(|_| Error::ConnectionClosed)?;

    receiver.await.map_err(|_| Error::ConnectionClosed)?
  }

  #[inline]
  pub fn call_and_forget(&self, function: impl FnOnce(&mut DbState) + Send + 'static) {
    let _ = self.sender.send(Message::Run(Box::new(function)));
  }

  /// Execute SQL statement.
  pub async fn execute(
    &self,
    sql: impl AsRef<str> + Send + 'static,
    params: ParamValues,
  ) -> Result<usize> {
    return self
      .call(move |state: &mut DbState| {
        return state.with_connection(|conn| {
          let mut stmt = conn.prepare_cached(sql.as_ref())?;
          params.bind(&mut stmt, false)?;
          return Ok(stmt.raw_execute()?);
        });
      })
      .await;
  }

  /// Query SQL statement.
  pub async fn query_rows(
    &self,
    sql: impl AsRef<str> + Send + 'static,
    params: ParamValues,
  ) -> Result<Rows> {
    return self
      .call(move |state: &mut DbState| {
        return state.with_connection(|conn| {
          let mut stmt = conn.prepare_cached(sql.as_ref())?;
          params.bind(&mut stmt, false)?;
          return Ok(Rows::from_rows(stmt.raw_query())?);
        });
      })
      .await;
  }

  pub async fn query_row(
    &self,
    sql: impl AsRef<str> + Send + 'static,
    params: ParamValues,
  ) -> Result<Option<Row>> {
    let rows = self.query_rows(sql, params).await?;
    return Ok(rows.into_iter().next());
  }

  /// Batch execute SQL statements.
  pub async fn execute_batch(&self, sql: impl AsRef<str> + Send + 'static) -> Result<()> {
    return self
      .call(move |state: &mut DbState| {
        return state.with_connection(|conn| Ok(conn.execute_batch(sql.as_ref())?));
      })
      .await;
  }

  /// Close the database connection.
  ///
  /// Finalizes every registered statement first; following operations on
  /// this connection or its statements fail with `ConnectionClosed` or
  /// `BadHandle`.
  ///
  /// # Failure
  ///
  /// Will return `Err` if the underlying SQLite close call fails.
  pub async fn close(self) -> Result<()> {
    let (ack, done) = oneshot::channel::<Result<()>>();
    self
      .sender
      .send(Message::Terminate(ack))
      .map_err(|_| Error::ConnectionClosed)?;
    return done.await.map_err(|_| Error::ConnectionClosed)?;
  }
}

impl std::fmt::Debug for Connection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connection").finish()
  }
}

fn event_loop(mut state: DbState, receiver: Receiver<Message>) {
  while let Ok(message) = receiver.recv() {
    match message {
      Message::Run(f) => f(&mut state),
      Message::Terminate(ack) => {
        let _ = ack.send(state.close());
        return;
      }
    };
  }

  // All handles dropped without an explicit close.
  if let Err(err) = state.close() {
    debug!("Closing connection: {err}");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rusqlite::types::Value;

  #[tokio::test]
  async fn test_execute_and_query() {
    let conn = Connection::open_in_memory().unwrap();
    conn
      .execute_batch("CREATE TABLE t (a TEXT, b INTEGER);")
      .await
      .unwrap();

    let n = conn
      .execute(
        "INSERT INTO t (a, b) VALUES ($1, $2), ($3, $4)",
        crate::params!("x", 1i64, "y", 2i64),
      )
      .await
      .unwrap();
    assert_eq!(2, n);

    let rows = conn
      .query_rows("SELECT * FROM t ORDER BY b", crate::params!())
      .await
      .unwrap();
    assert_eq!(2, rows.len());
    assert_eq!(Some(&Value::Text("x".to_string())), rows.get(0).unwrap().value(0));
  }

  #[tokio::test]
  async fn test_prepared_statement_lifecycle() {
    let conn = Connection::open_in_memory().unwrap();
    conn
      .execute_batch("CREATE TABLE t (n INTEGER);")
      .await
      .unwrap();

    let insert = conn
      .call(|state| state.prepare("INSERT INTO t (n) VALUES ($1)"))
      .await
      .unwrap();

    let result = conn
      .call(move |state| state.statement_run(insert, crate::params!(42i64)))
      .await
      .unwrap();
    assert_eq!(1, result.changes);
    assert_eq!(1, result.last_insert_rowid);

    let select = conn
      .call(|state| state.prepare("SELECT n FROM t"))
      .await
      .unwrap();
    let row = conn
      .call(move |state| state.statement_get(select, crate::params!()))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(Some(&Value::Integer(42)), row.value(0));

    conn
      .call(move |state| {
        state.statement_finalize(select);
        return Ok(());
      })
      .await
      .unwrap();
    assert!(matches!(
      conn
        .call(move |state| state.statement_get(select, crate::params!()))
        .await,
      Err(Error::BadHandle(_))
    ));
  }

  #[tokio::test]
  async fn test_iterate_rewind_by_rebinding() {
    let conn = Connection::open_in_memory().unwrap();
    conn
      .execute_batch("CREATE TABLE t (n INTEGER); INSERT INTO t VALUES (1), (2), (3);")
      .await
      .unwrap();

    let id = conn
      .call(|state| state.prepare("SELECT n FROM t WHERE n >= $1 ORDER BY n"))
      .await
      .unwrap();

    conn
      .call(move |state| state.statement_iterate(id, crate::params!(2i64)))
      .await
      .unwrap();
    let first = conn
      .call(move |state| state.statement_next(id))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(Some(&Value::Integer(2)), first.value(0));

    // Re-binding rewinds the cursor.
    conn
      .call(move |state| state.statement_iterate(id, crate::params!(1i64)))
      .await
      .unwrap();
    let first = conn
      .call(move |state| state.statement_next(id))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(Some(&Value::Integer(1)), first.value(0));

    let mut seen = vec![];
    while let Some(row) = conn.call(move |state| state.statement_next(id)).await.unwrap() {
      seen.push(row.value(0).cloned().unwrap());
    }
    assert_eq!(vec![Value::Integer(2), Value::Integer(3)], seen);
  }

  #[tokio::test]
  async fn test_transaction_boundaries() {
    let conn = Connection::open_in_memory().unwrap();
    conn
      .execute_batch("CREATE TABLE t (n INTEGER);")
      .await
      .unwrap();

    conn.execute_batch("BEGIN").await.unwrap();
    conn
      .execute("INSERT INTO t (n) VALUES (99)", crate::params!())
      .await
      .unwrap();
    let rows = conn
      .query_rows("SELECT COUNT(*) FROM t WHERE n = 99", crate::params!())
      .await
      .unwrap();
    assert_eq!(Some(&Value::Integer(1)), rows.get(0).unwrap().value(0));
    conn.execute_batch("COMMIT").await.unwrap();

    let rows = conn
      .query_rows("SELECT COUNT(*) FROM t WHERE n = 99", crate::params!())
      .await
      .unwrap();
    assert_eq!(Some(&Value::Integer(1)), rows.get(0).unwrap().value(0));
  }

  #[tokio::test]
  async fn test_close_rejects_later_calls() {
    let conn = Connection::open_in_memory().unwrap();
    let clone = conn.clone();
    conn.close().await.unwrap();

    assert!(matches!(
      clone.execute_batch("SELECT 1").await,
      Err(Error::ConnectionClosed)
    ));
  }
}
