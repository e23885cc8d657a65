//! Code for gsid that goes into the first-stage ramdisk: decide whether
//! to boot the installed image, and mark it as running once it has.

use anyhow::Result;
use camino::Utf8Path;
use gsid_lib::boot_status::{BootDecision, BootStatusStore};
use gsid_lib::config::Config;

/// Prints the partition table path if the installed image should be
/// booted; returns false otherwise.
fn can_boot(config: &Config, metadata_dir: Option<&Utf8Path>) -> Result<bool> {
    let dir = metadata_dir.unwrap_or(config.metadata_dir.as_path());
    let store = BootStatusStore::open(dir)?;
    match store.boot_decision(config.max_boot_attempts)? {
        BootDecision::Boot(path) => {
            println!("{path}");
            Ok(true)
        }
        BootDecision::DoNotBoot(reason) => {
            tracing::debug!("{reason:?}");
            println!("not booting: {reason}");
            Ok(false)
        }
    }
}

fn mark_running(config: &Config) -> Result<bool> {
    BootStatusStore::open(&config.metadata_dir)?.mark_running()?;
    Ok(true)
}

fn run() -> Result<bool> {
    gsid_utils::initialize_tracing();
    let config = Config::load(None)?;
    let v = std::env::args().collect::<Vec<_>>();
    let args = match v.as_slice() {
        [] => anyhow::bail!("Missing argument"),
        [_, rest @ ..] => rest,
    };
    match args {
        [] => anyhow::bail!("Missing argument"),
        [s] if s == "can-boot" => can_boot(&config, None),
        [s, o, dir] if s == "can-boot" && o == "--metadata-dir" => {
            can_boot(&config, Some(Utf8Path::new(dir)))
        }
        [s] if s == "mark-running" => mark_running(&config),
        [o, ..] => anyhow::bail!("Unknown command {o}"),
    }
}

fn main() {
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
    }
}
