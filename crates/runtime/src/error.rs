use std::fmt;

/// Error taxonomy surfaced to scripts. The preamble re-raises these as the
/// matching platform error classes, keyed off the stable `as_str` name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  BadResource,
  InvalidInput,
  PermissionDenied,
  NotFound,
  AlreadyExists,
  Interrupted,
  TimedOut,
  Network,
  ProtocolError,
  IntegrityFailure,
  CorsFailure,
  MixedContentBlocked,
  DataCloneError,
  TypeMismatch,
  Internal,
}

impl ErrorKind {
  pub fn as_str(&self) -> &'static str {
    return match self {
      ErrorKind::BadResource => "BadResource",
      ErrorKind::InvalidInput => "InvalidInput",
      ErrorKind::PermissionDenied => "PermissionDenied",
      ErrorKind::NotFound => "NotFound",
      ErrorKind::AlreadyExists => "AlreadyExists",
      ErrorKind::Interrupted => "Interrupted",
      ErrorKind::TimedOut => "TimedOut",
      ErrorKind::Network => "Network",
      ErrorKind::ProtocolError => "ProtocolError",
      ErrorKind::IntegrityFailure => "IntegrityFailure",
      ErrorKind::CorsFailure => "CorsFailure",
      ErrorKind::MixedContentBlocked => "MixedContentBlocked",
      ErrorKind::DataCloneError => "DataCloneError",
      ErrorKind::TypeMismatch => "TypeMismatch",
      ErrorKind::Internal => "Internal",
    };
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    return f.write_str(self.as_str());
  }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HostError {
  pub kind: ErrorKind,
  pub message: String,
}

pub type HostResult<T> = std::result::Result<T, HostError>;

impl HostError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    return Self {
      kind,
      message: message.into(),
    };
  }

  pub fn bad_resource(id: u64) -> Self {
    return Self::new(ErrorKind::BadResource, format!("no live resource {id}"));
  }

  pub fn invalid_input(message: impl Into<String>) -> Self {
    return Self::new(ErrorKind::InvalidInput, message);
  }

  pub fn type_mismatch(message: impl Into<String>) -> Self {
    return Self::new(ErrorKind::TypeMismatch, message);
  }

  pub fn internal(message: impl Into<String>) -> Self {
    return Self::new(ErrorKind::Internal, message);
  }

  pub fn interrupted() -> Self {
    return Self::new(ErrorKind::Interrupted, "operation aborted");
  }
}

impl From<std::io::Error> for HostError {
  fn from(err: std::io::Error) -> Self {
    use std::io::ErrorKind as IoKind;
    let kind = match err.kind() {
      IoKind::NotFound => ErrorKind::NotFound,
      IoKind::PermissionDenied => ErrorKind::PermissionDenied,
      IoKind::AlreadyExists => ErrorKind::AlreadyExists,
      IoKind::Interrupted => ErrorKind::Interrupted,
      IoKind::TimedOut => ErrorKind::TimedOut,
      IoKind::ConnectionRefused
      | IoKind::ConnectionReset
      | IoKind::ConnectionAborted
      | IoKind::NotConnected
      | IoKind::BrokenPipe => ErrorKind::Network,
      IoKind::InvalidInput | IoKind::InvalidData => ErrorKind::InvalidInput,
      _ => ErrorKind::Internal,
    };
    return Self::new(kind, err.to_string());
  }
}

impl From<url::ParseError> for HostError {
  fn from(err: url::ParseError) -> Self {
    return Self::new(ErrorKind::InvalidInput, err.to_string());
  }
}

impl From<reqwest::Error> for HostError {
  fn from(err: reqwest::Error) -> Self {
    let kind = if err.is_timeout() {
      ErrorKind::TimedOut
    } else {
      ErrorKind::Network
    };
    return Self::new(kind, err.to_string());
  }
}

impl From<andromeda_sqlite::Error> for HostError {
  fn from(err: andromeda_sqlite::Error) -> Self {
    let kind = match err {
      andromeda_sqlite::Error::ConnectionClosed | andromeda_sqlite::Error::BadHandle(_) => {
        ErrorKind::BadResource
      }
      andromeda_sqlite::Error::UnknownParameter(_) | andromeda_sqlite::Error::BareParameter(_) => {
        ErrorKind::InvalidInput
      }
      _ => ErrorKind::Internal,
    };
    return Self::new(kind, err.to_string());
  }
}

impl From<HostError> for rustyscript::Error {
  fn from(err: HostError) -> Self {
    return rustyscript::Error::Runtime(err.to_string());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_stable_shape() {
    let err = HostError::new(ErrorKind::IntegrityFailure, "digest mismatch");
    assert_eq!("IntegrityFailure: digest mismatch", err.to_string());
  }

  #[test]
  fn test_io_mapping() {
    let err: HostError = std::io::Error::new(std::io::ErrorKind::NotFound, "nope").into();
    assert_eq!(ErrorKind::NotFound, err.kind);

    let err: HostError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
    assert_eq!(ErrorKind::Network, err.kind);
  }
}
