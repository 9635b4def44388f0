use std::path::PathBuf;

/// The base profile directory where persistent storage lives.
#[derive(Debug, Clone)]
pub struct DataDir(pub PathBuf);

impl Default for DataDir {
  fn default() -> Self {
    Self(format!("./{}/", Self::DEFAULT).into())
  }
}

impl DataDir {
  pub const DEFAULT: &str = ".andromeda";

  pub fn root(&self) -> &PathBuf {
    return &self.0;
  }

  pub fn data_path(&self) -> PathBuf {
    return self.0.join("data/");
  }

  pub fn storage_db_path(&self) -> PathBuf {
    return self.data_path().join("storage.db");
  }

  pub fn ensure_directory_structure(&self) -> std::io::Result<()> {
    return std::fs::create_dir_all(self.data_path());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_layout() {
    let dir = DataDir(PathBuf::from("/tmp/profile"));
    assert_eq!(PathBuf::from("/tmp/profile/data/storage.db"), dir.storage_db_path());
  }
}
