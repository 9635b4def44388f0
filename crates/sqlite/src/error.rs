#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("Connection closed")]
  ConnectionClosed,

  /// An error occured while closing the SQLite connection. Carries the
  /// underlying [`rusqlite::Error`] that made the close fail.
  #[error("Close error: {0}")]
  Close(rusqlite::Error),

  /// The statement handle is unknown, was finalized, or belongs to a
  /// connection that has been closed.
  #[error("Unknown statement handle: {0}")]
  BadHandle(u64),

  #[error("Unknown parameter: {0}")]
  UnknownParameter(String),

  #[error("Bare named parameter without enabling bare binding: {0}")]
  BareParameter(String),

  #[error("Rusqlite error: {0}")]
  Rusqlite(#[from] rusqlite::Error),

  #[error("Other error: {0}")]
  Other(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}
