use rusqlite::types::Value;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ValueType {
  Integer = 1,
  Real,
  Text,
  Blob,
  Null,
}

impl FromStr for ValueType {
  type Err = ();

  fn from_str(s: &str) -> std::result::Result<ValueType, Self::Err> {
    match s {
      "TEXT" => Ok(ValueType::Text),
      "INTEGER" => Ok(ValueType::Integer),
      "BLOB" => Ok(ValueType::Blob),
      "NULL" => Ok(ValueType::Null),
      "REAL" => Ok(ValueType::Real),
      _ => Err(()),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
  pub name: String,
  pub decl_type: Option<ValueType>,
}

/// Detached snapshot of a result set. Rows are materialized on the
/// connection thread; everything here is plain owned data.
#[derive(Debug, Clone)]
pub struct Rows(pub(crate) Vec<Row>, pub(crate) Arc<Vec<Column>>);

impl Rows {
  pub fn from_rows(mut rows: rusqlite::Rows<'_>) -> rusqlite::Result<Self> {
    let columns: Arc<Vec<Column>> = Arc::new(rows.as_ref().map_or_else(Vec::new, columns));

    let mut result = vec![];
    while let Some(row) = rows.next()? {
      result.push(Row::from_row(row, columns.clone())?);
    }

    return Ok(Self(result, columns));
  }

  pub fn len(&self) -> usize {
    return self.0.len();
  }

  pub fn is_empty(&self) -> bool {
    return self.0.is_empty();
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Row> {
    return self.0.iter();
  }

  pub fn into_iter(self) -> std::vec::IntoIter<Row> {
    return self.0.into_iter();
  }

  pub fn get(&self, idx: usize) -> Option<&Row> {
    return self.0.get(idx);
  }

  pub fn column_count(&self) -> usize {
    return self.1.len();
  }

  pub fn column_name(&self, idx: usize) -> Option<&str> {
    return self.1.get(idx).map(|c| c.name.as_str());
  }

  pub fn columns(&self) -> &[Column] {
    return &self.1;
  }
}

#[derive(Debug, Clone)]
pub struct Row {
  values: Vec<Value>,
  columns: Arc<Vec<Column>>,
}

impl Row {
  pub(crate) fn from_row(
    row: &rusqlite::Row<'_>,
    columns: Arc<Vec<Column>>,
  ) -> rusqlite::Result<Self> {
    let values = (0..columns.len())
      .map(|idx| row.get::<_, Value>(idx))
      .collect::<rusqlite::Result<Vec<_>>>()?;

    return Ok(Self { values, columns });
  }

  pub fn len(&self) -> usize {
    return self.values.len();
  }

  pub fn is_empty(&self) -> bool {
    return self.values.is_empty();
  }

  pub fn value(&self, idx: usize) -> Option<&Value> {
    return self.values.get(idx);
  }

  pub fn into_values(self) -> Vec<Value> {
    return self.values;
  }

  pub fn column_name(&self, idx: usize) -> Option<&str> {
    return self.columns.get(idx).map(|c| c.name.as_str());
  }
}

pub(crate) fn columns(stmt: &rusqlite::Statement<'_>) -> Vec<Column> {
  return stmt
    .columns()
    .iter()
    .map(|c| Column {
      name: c.name().to_string(),
      decl_type: c.decl_type().and_then(|s| ValueType::from_str(s).ok()),
    })
    .collect();
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_rows_snapshot() {
    let conn = rusqlite::Connection::open_in_memory().unwrap();
    conn
      .execute_batch("CREATE TABLE t (a TEXT, b INTEGER); INSERT INTO t VALUES ('x', 7);")
      .unwrap();

    let mut stmt = conn.prepare("SELECT * FROM t").unwrap();
    let rows = Rows::from_rows(stmt.raw_query()).unwrap();

    assert_eq!(1, rows.len());
    assert_eq!(2, rows.column_count());
    assert_eq!(Some("a"), rows.column_name(0));
    assert_eq!(
      Some(&Value::Integer(7)),
      rows.get(0).and_then(|r| r.value(1))
    );
  }
}
