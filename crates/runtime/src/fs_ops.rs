use parking_lot::Mutex;
use std::io::{Read, Seek, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{HostError, HostResult};
use crate::host::{HostState, arg, bytes_arg, bytes_at, encode_bytes, get_arg, opt_arg};
use crate::pool::CancellationFlag;
use crate::resource::{Resource, ResourceKind, wrong_kind};

pub struct FileResource {
  pub file: Arc<Mutex<std::fs::File>>,
}

fn stat_json(metadata: &std::fs::Metadata) -> serde_json::Value {
  let timestamp = |time: std::io::Result<std::time::SystemTime>| -> Option<f64> {
    return time.ok().and_then(|t| {
      t.duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs_f64() * 1000.0)
    });
  };

  #[cfg(unix)]
  let mode = {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode())
  };
  #[cfg(not(unix))]
  let mode: Option<u32> = None;

  return serde_json::json!({
    "isFile": metadata.is_file(),
    "isDirectory": metadata.is_dir(),
    "isSymlink": metadata.file_type().is_symlink(),
    "size": metadata.len(),
    "mtime": timestamp(metadata.modified()),
    "atime": timestamp(metadata.accessed()),
    "birthtime": timestamp(metadata.created()),
    "mode": mode,
  });
}

fn read_dir_json(path: &str) -> HostResult<serde_json::Value> {
  let mut entries = vec![];
  for entry in std::fs::read_dir(path)? {
    let entry = entry?;
    let file_type = entry.file_type()?;
    entries.push(serde_json::json!({
      "name": entry.file_name().to_string_lossy(),
      "isFile": file_type.is_file(),
      "isDirectory": file_type.is_dir(),
      "isSymlink": file_type.is_symlink(),
    }));
  }
  return Ok(serde_json::Value::Array(entries));
}

fn file_by_rid(state: &HostState, rid: u64) -> HostResult<Arc<Mutex<std::fs::File>>> {
  return state.resources.with_entry(rid, |r| match r {
    Resource::File(file) => Ok(file.file.clone()),
    other => Err(wrong_kind(rid, ResourceKind::File, other.kind())),
  });
}

/// Registers a filesystem op twice: the sync flavor runs inline, the
/// `_async` flavor submits the same body to the pool.
macro_rules! fs_op {
  ($runtime:expr, $state:expr, $name:literal, |$args:ident| $body:block) => {{
    $runtime.register_function($name, move |$args: &[serde_json::Value]| {
      let result = (|| -> HostResult<serde_json::Value> { $body })();
      return result.map_err(Into::into);
    })?;

    let state = $state.clone();
    $runtime.register_async_function(
      concat!($name, "_async"),
      move |args_vec: Vec<serde_json::Value>| {
        let state = state.clone();
        Box::pin(async move {
          let _guard = state.pending_ops.guard();
          let receiver = state.pool.submit(CancellationFlag::new(), move |_flag| {
            let $args: &[serde_json::Value] = &args_vec;
            return (|| -> HostResult<serde_json::Value> { $body })();
          });
          return Ok(crate::bridge::await_completion(receiver).await?);
        })
      },
    )?;
  }};
}

pub(crate) fn register(
  runtime: &mut rustyscript::Runtime,
  state: &Arc<HostState>,
) -> Result<(), rustyscript::Error> {
  fs_op!(runtime, state, "readTextFile", |args| {
    let path: String = arg(args, 0)?;
    return Ok(std::fs::read_to_string(&path)?.into());
  });

  fs_op!(runtime, state, "writeTextFile", |args| {
    let path: String = arg(args, 0)?;
    let contents: String = arg(args, 1)?;
    std::fs::write(&path, contents)?;
    return Ok(serde_json::Value::Null);
  });

  fs_op!(runtime, state, "readFile", |args| {
    let path: String = arg(args, 0)?;
    let bytes = std::fs::read(&path)?;
    return Ok(encode_bytes(&bytes).into());
  });

  fs_op!(runtime, state, "writeFile", |args| {
    let path: String = arg(args, 0)?;
    let data = bytes_at(args, 1)?;
    std::fs::write(&path, data)?;
    return Ok(serde_json::Value::Null);
  });

  fs_op!(runtime, state, "copyFile", |args| {
    let from: String = arg(args, 0)?;
    let to: String = arg(args, 1)?;
    std::fs::copy(&from, &to)?;
    return Ok(serde_json::Value::Null);
  });

  fs_op!(runtime, state, "remove", |args| {
    let path: String = arg(args, 0)?;
    if std::fs::symlink_metadata(&path)?.is_dir() {
      std::fs::remove_dir(&path)?;
    } else {
      std::fs::remove_file(&path)?;
    }
    return Ok(serde_json::Value::Null);
  });

  fs_op!(runtime, state, "removeAll", |args| {
    let path: String = arg(args, 0)?;
    if std::fs::symlink_metadata(&path)?.is_dir() {
      std::fs::remove_dir_all(&path)?;
    } else {
      std::fs::remove_file(&path)?;
    }
    return Ok(serde_json::Value::Null);
  });

  fs_op!(runtime, state, "rename", |args| {
    let from: String = arg(args, 0)?;
    let to: String = arg(args, 1)?;
    std::fs::rename(&from, &to)?;
    return Ok(serde_json::Value::Null);
  });

  fs_op!(runtime, state, "exists", |args| {
    let path: String = arg(args, 0)?;
    return Ok(std::fs::metadata(&path).is_ok().into());
  });

  fs_op!(runtime, state, "truncate", |args| {
    let path: String = arg(args, 0)?;
    let length: u64 = opt_arg(args, 1).unwrap_or(0);
    let file = std::fs::OpenOptions::new().write(true).open(&path)?;
    file.set_len(length)?;
    return Ok(serde_json::Value::Null);
  });

  fs_op!(runtime, state, "chmod", |args| {
    let path: String = arg(args, 0)?;
    let mode: u32 = arg(args, 1)?;
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
      let _ = (path, mode);
    }
    return Ok(serde_json::Value::Null);
  });

  fs_op!(runtime, state, "mkdir", |args| {
    let path: String = arg(args, 0)?;
    std::fs::create_dir(&path)?;
    return Ok(serde_json::Value::Null);
  });

  fs_op!(runtime, state, "mkdirAll", |args| {
    let path: String = arg(args, 0)?;
    std::fs::create_dir_all(&path)?;
    return Ok(serde_json::Value::Null);
  });

  fs_op!(runtime, state, "readDir", |args| {
    let path: String = arg(args, 0)?;
    return read_dir_json(&path);
  });

  fs_op!(runtime, state, "stat", |args| {
    let path: String = arg(args, 0)?;
    return Ok(stat_json(&std::fs::metadata(&path)?));
  });

  fs_op!(runtime, state, "lstat", |args| {
    let path: String = arg(args, 0)?;
    return Ok(stat_json(&std::fs::symlink_metadata(&path)?));
  });

  {
    let state = state.clone();
    runtime.register_function("open", move |args: &[serde_json::Value]| {
      let path: String = get_arg(args, 0)?;
      let options = args.get(1).cloned().unwrap_or(serde_json::Value::Null);
      let flag = |name: &str, default: bool| {
        return options
          .get(name)
          .and_then(|v| v.as_bool())
          .unwrap_or(default);
      };

      let file = std::fs::OpenOptions::new()
        .read(flag("read", true))
        .write(flag("write", false))
        .append(flag("append", false))
        .truncate(flag("truncate", false))
        .create(flag("create", false))
        .create_new(flag("createNew", false))
        .open(PathBuf::from(&path))
        .map_err(HostError::from)?;

      let rid = state.resources.insert(Resource::File(FileResource {
        file: Arc::new(Mutex::new(file)),
      }));
      return Ok(rid.into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("create", move |args: &[serde_json::Value]| {
      let path: String = get_arg(args, 0)?;
      let file = std::fs::File::create(&path).map_err(HostError::from)?;
      let rid = state.resources.insert(Resource::File(FileResource {
        file: Arc::new(Mutex::new(file)),
      }));
      return Ok(rid.into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("file_read", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let rid: u64 = get_arg(&args, 0)?;
        let max_len: usize = opt_arg(&args, 1).unwrap_or(16 * 1024);

        let file = file_by_rid(&state, rid)?;
        let receiver = state.pool.submit(CancellationFlag::new(), move |_flag| {
          let mut buf = vec![0u8; max_len.clamp(1, 1024 * 1024)];
          let n = file.lock().read(&mut buf)?;
          buf.truncate(n);
          return Ok(buf);
        });
        let buf = crate::bridge::await_completion(receiver).await?;
        return Ok(serde_json::json!({ "data": encode_bytes(&buf), "eof": buf.is_empty() }));
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_async_function("file_write", move |args: Vec<serde_json::Value>| {
      let state = state.clone();
      Box::pin(async move {
        let _guard = state.pending_ops.guard();
        let rid: u64 = get_arg(&args, 0)?;
        let data = bytes_arg(&args, 1)?;

        let file = file_by_rid(&state, rid)?;
        let receiver = state.pool.submit(CancellationFlag::new(), move |_flag| {
          file.lock().write_all(&data)?;
          return Ok(data.len());
        });
        let written = crate::bridge::await_completion(receiver).await?;
        return Ok((written as u64).into());
      })
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("file_seek", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      let offset: i64 = get_arg(args, 1)?;
      let whence: String = opt_arg(args, 2).unwrap_or_else(|| "start".to_string());

      let seek = match whence.as_str() {
        "start" => std::io::SeekFrom::Start(offset.max(0) as u64),
        "current" => std::io::SeekFrom::Current(offset),
        "end" => std::io::SeekFrom::End(offset),
        other => {
          return Err(HostError::invalid_input(format!("unknown whence '{other}'")).into());
        }
      };
      let position = file_by_rid(&state, rid)?
        .lock()
        .seek(seek)
        .map_err(HostError::from)?;
      return Ok(position.into());
    })?;
  }
  {
    let state = state.clone();
    runtime.register_function("file_close", move |args: &[serde_json::Value]| {
      let rid: u64 = get_arg(args, 0)?;
      // Dropping the record closes the OS handle.
      state.resources.remove(rid);
      return Ok(serde_json::Value::Null);
    })?;
  }

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;
  use temp_dir::TempDir;

  #[test]
  fn test_stat_json_shape() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("f.txt");
    std::fs::write(&path, b"12345").unwrap();

    let json = stat_json(&std::fs::metadata(&path).unwrap());
    assert_eq!(true, json["isFile"]);
    assert_eq!(false, json["isDirectory"]);
    assert_eq!(5, json["size"]);
    assert!(json["mtime"].as_f64().unwrap() > 0.0);
  }

  #[test]
  fn test_read_dir_lists_entries() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("a.txt"), b"a").unwrap();
    std::fs::create_dir(tmp.path().join("sub")).unwrap();

    let json = read_dir_json(tmp.path().to_str().unwrap()).unwrap();
    let entries = json.as_array().unwrap();
    assert_eq!(2, entries.len());

    let sub = entries
      .iter()
      .find(|e| e["name"] == "sub")
      .expect("directory listed");
    assert_eq!(true, sub["isDirectory"]);
  }

  #[test]
  fn test_missing_file_maps_to_not_found() {
    let err: HostError = std::fs::read("/definitely/not/here")
      .map(|_| ())
      .unwrap_err()
      .into();
    assert_eq!(crate::error::ErrorKind::NotFound, err.kind);
  }
}
