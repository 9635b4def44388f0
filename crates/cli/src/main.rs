use clap::{Parser, Subcommand};
use log::*;
use std::path::PathBuf;
use std::process::ExitCode;

use andromeda_runtime::host::HostOptions;
use andromeda_runtime::runtime::{Module, RuntimeHandle};
use andromeda_runtime::DataDir;

#[derive(Parser, Debug)]
#[command(name = "andromeda", version, about = "Andromeda script runtime")]
struct Args {
  /// Profile directory holding persistent storage.
  #[arg(long, env = "ANDROMEDA_DATA_DIR")]
  data_dir: Option<PathBuf>,

  /// Blocking-work pool size.
  #[arg(long, env = "ANDROMEDA_POOL_THREADS", default_value_t = 4)]
  pool_threads: usize,

  /// Client origin used by the fetch security checks.
  #[arg(long, env = "ANDROMEDA_ORIGIN")]
  origin: Option<String>,

  /// Cross-origin embedder policy: unsafe-none, credentialless,
  /// require-corp.
  #[arg(long, env = "ANDROMEDA_EMBEDDER_POLICY", default_value = "unsafe-none")]
  embedder_policy: String,

  /// Disable the FFI surface.
  #[arg(long, env = "ANDROMEDA_DISABLE_FFI")]
  disable_ffi: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Load and evaluate a script, then run until no work remains.
  Run {
    path: PathBuf,

    /// Arguments surfaced to the script via the host.
    #[arg(trailing_var_arg = true)]
    script_args: Vec<String>,
  },
}

fn build_options(args: &Args, script_args: Vec<String>) -> Result<HostOptions, String> {
  let origin = match &args.origin {
    Some(origin) => Some(
      url::Url::parse(origin).map_err(|err| format!("invalid --origin '{origin}': {err}"))?,
    ),
    None => None,
  };
  let embedder_policy = args
    .embedder_policy
    .parse()
    .map_err(|err| format!("invalid --embedder-policy: {err}"))?;

  let mut options = HostOptions {
    pool_threads: args.pool_threads.max(1),
    origin,
    embedder_policy,
    cli_args: script_args,
    allow_ffi: !args.disable_ffi,
    ..Default::default()
  };
  if let Some(data_dir) = &args.data_dir {
    options.data_dir = DataDir(data_dir.clone());
  }
  return Ok(options);
}

#[tokio::main]
async fn main() -> ExitCode {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

  let args = Args::parse();
  let Command::Run { path, script_args } = &args.command;

  let options = match build_options(&args, script_args.clone()) {
    Ok(options) => options,
    Err(message) => {
      eprintln!("{message}");
      return ExitCode::FAILURE;
    }
  };

  let module = match Module::load(path) {
    Ok(module) => module,
    Err(err) => {
      eprintln!("failed to load '{}': {err}", path.display());
      return ExitCode::FAILURE;
    }
  };

  let handle = RuntimeHandle::new_with_options(options);

  if let Err(err) = handle.load_module(module).await {
    // Uncaught exceptions and rejections from evaluation land here.
    eprintln!("{err}");
    return ExitCode::FAILURE;
  }

  // Run until no scheduled work remains. A live listener keeps the loop
  // up, so also honor Ctrl-C.
  tokio::select! {
    result = handle.wait_until_idle() => {
      if let Err(err) = result {
        error!("runtime shut down uncleanly: {err}");
        return ExitCode::FAILURE;
      }
    },
    _ = tokio::signal::ctrl_c() => {
      info!("interrupted");
    },
  }

  return ExitCode::SUCCESS;
}
