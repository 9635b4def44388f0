use rusqlite::Statement;
use rusqlite::types::Value;

use crate::error::Error;

#[macro_export]
macro_rules! params {
    () => {
        $crate::ParamValues::Positional(vec![])
    };
    ($($param:expr),+ $(,)?) => {
        $crate::ParamValues::Positional(vec![$(Into::<$crate::Value>::into($param)),+])
    };
}

/// Parameter sets bound to a prepared statement before each execution.
///
/// Named parameters may carry their SQLite prefix (`:`, `@`, `$`) or be
/// bare; bare names only resolve when the statement opted into bare
/// binding, mirroring the script-visible toggle.
#[derive(Debug, Clone)]
pub enum ParamValues {
  Positional(Vec<Value>),
  Named(Vec<(String, Value)>),
}

impl ParamValues {
  pub fn is_empty(&self) -> bool {
    return match self {
      ParamValues::Positional(values) => values.is_empty(),
      ParamValues::Named(values) => values.is_empty(),
    };
  }

  pub fn bind(self, stmt: &mut Statement<'_>, allow_bare_named: bool) -> Result<(), Error> {
    match self {
      ParamValues::Positional(values) => {
        for (idx, value) in values.into_iter().enumerate() {
          stmt.raw_bind_parameter(idx + 1, value)?;
        }
      }
      ParamValues::Named(values) => {
        for (name, value) in values {
          let idx = resolve_parameter(stmt, &name, allow_bare_named)?;
          stmt.raw_bind_parameter(idx, value)?;
        }
      }
    }
    return Ok(());
  }
}

fn resolve_parameter(
  stmt: &Statement<'_>,
  name: &str,
  allow_bare_named: bool,
) -> Result<usize, Error> {
  if name.starts_with([':', '@', '$']) {
    return stmt
      .parameter_index(name)?
      .ok_or_else(|| Error::UnknownParameter(name.to_string()));
  }

  if !allow_bare_named {
    return Err(Error::BareParameter(name.to_string()));
  }

  for prefix in [':', '@', '$'] {
    if let Some(idx) = stmt.parameter_index(&format!("{prefix}{name}"))? {
      return Ok(idx);
    }
  }
  return Err(Error::UnknownParameter(name.to_string()));
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_bare_named_binding() {
    let conn = rusqlite::Connection::open_in_memory().unwrap();
    let mut stmt = conn.prepare("SELECT :a + $b").unwrap();

    let params = ParamValues::Named(vec![
      ("a".to_string(), Value::Integer(1)),
      ("b".to_string(), Value::Integer(2)),
    ]);
    assert!(matches!(
      params.clone().bind(&mut stmt, false),
      Err(Error::BareParameter(_))
    ));
    params.bind(&mut stmt, true).unwrap();

    let mut rows = stmt.raw_query();
    let row = rows.next().unwrap().unwrap();
    assert_eq!(3, row.get::<_, i64>(0).unwrap());
  }

  #[test]
  fn test_unknown_parameter() {
    let conn = rusqlite::Connection::open_in_memory().unwrap();
    let mut stmt = conn.prepare("SELECT :a").unwrap();

    let params = ParamValues::Named(vec![(":nope".to_string(), Value::Integer(1))]);
    assert!(matches!(
      params.bind(&mut stmt, true),
      Err(Error::UnknownParameter(_))
    ));
  }
}
