//! # gsid command line
//!
//! Command line tool to install, enable and remove a temporary system
//! image.

use std::ffi::OsString;
use std::io::{BufReader, Read};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use fn_error_context::context;

use crate::config::Config;
use crate::install::InstallParams;
use crate::progress::ProgressStatus;
use crate::service::{Caller, GsiService, ServiceStatus};

const READ_BUFFER_SIZE: usize = 1 << 20;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

fn parse_size(s: &str) -> Result<u64> {
    gsid_blockdev::parse_size(s)
}

/// Options for installing an image.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct InstallOpts {
    /// The system image to install, or `-` for standard input.
    pub(crate) image: Utf8PathBuf,

    /// Size of the system image; required when reading standard input.
    #[clap(long, value_parser = parse_size)]
    pub(crate) size: Option<u64>,

    /// Size of the userdata image. If unset, an existing userdata
    /// image is reused, or one of the default size is created.
    #[clap(long, value_parser = parse_size)]
    pub(crate) userdata_size: Option<u64>,

    /// Discard any existing userdata image.
    #[clap(long)]
    pub(crate) wipe: bool,

    /// Install into this directory instead of the default.
    #[clap(long)]
    pub(crate) install_dir: Option<Utf8PathBuf>,

    /// Boot the image only once.
    #[clap(long)]
    pub(crate) one_shot: bool,
}

/// Manage a temporary system image.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "gsid", version)]
pub(crate) struct Cli {
    /// Path to the configuration file.
    #[clap(long, global = true)]
    pub(crate) config: Option<Utf8PathBuf>,

    #[clap(subcommand)]
    pub(crate) opt: Opt,
}

/// The available commands.
#[derive(Debug, Subcommand, PartialEq, Eq)]
pub(crate) enum Opt {
    /// Install a system image.
    Install(InstallOpts),
    /// Show the state of the install.
    Status {
        /// Output JSON.
        #[clap(long)]
        json: bool,
    },
    /// Make the installed image bootable again.
    Enable {
        /// Boot the image only once.
        #[clap(long)]
        one_shot: bool,
    },
    /// Stop booting the installed image.
    Disable,
    /// Erase the installed userdata image.
    WipeUserdata,
    /// Remove the installed image.
    Remove {
        /// Keep the userdata image for a later install.
        #[clap(long)]
        keep_userdata: bool,
    },
    /// Run boot-time maintenance.
    #[clap(hide = true)]
    Startup,
}

type Source = Box<dyn Read + Send>;

/// Open the payload, returning it with its length.
#[context("Opening {}", opts.image)]
fn open_source(opts: &InstallOpts) -> Result<(Source, u64)> {
    if opts.image == "-" {
        let size = opts
            .size
            .context("--size is required when reading standard input")?;
        let src = BufReader::with_capacity(READ_BUFFER_SIZE, std::io::stdin());
        return Ok((Box::new(src), size));
    }
    let f = std::fs::File::open(&opts.image)?;
    let len = f.metadata()?.len();
    let size = opts.size.unwrap_or(len);
    if size > len {
        anyhow::bail!("{} is only {len} bytes, not {size}", opts.image);
    }
    let src = BufReader::with_capacity(READ_BUFFER_SIZE, f);
    Ok((Box::new(src), size))
}

fn install_params(opts: &InstallOpts, size: u64) -> Result<InstallParams> {
    Ok(InstallParams {
        gsi_size: size.try_into().context("Image size")?,
        userdata_size: opts
            .userdata_size
            .unwrap_or_default()
            .try_into()
            .context("Userdata size")?,
        wipe_userdata: opts.wipe,
        install_dir: opts.install_dir.clone(),
    })
}

/// Mirror service progress into `bar` until aborted.
async fn show_progress(svc: Arc<GsiService>, caller: Caller, bar: indicatif::ProgressBar) {
    let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
    loop {
        interval.tick().await;
        let p = match svc.progress(caller) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("Querying progress: {e}");
                return;
            }
        };
        if p.status == ProgressStatus::NoOperation {
            continue;
        }
        bar.set_message(p.step);
        bar.set_length(p.total_bytes);
        bar.set_position(p.bytes_processed);
    }
}

/// Cancel the install on Control-C.
async fn cancel_on_interrupt(svc: Arc<GsiService>, caller: Caller) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to wait for interrupt: {e}");
        return;
    }
    eprintln!("Cancelling...");
    let r = tokio::task::spawn_blocking(move || svc.cancel(caller)).await;
    match r {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Cancelling: {e}"),
        Err(e) => tracing::warn!("Cancelling: {e}"),
    }
}

/// Implementation of `gsid install`.
async fn install(svc: Arc<GsiService>, opts: InstallOpts) -> Result<()> {
    let caller = Caller::current();
    let (src, size) = open_source(&opts)?;
    let params = install_params(&opts, size)?;
    install_from(svc, caller, src, size, params, opts.one_shot).await
}

/// Stream `size` bytes of `src` into a new install. On failure the
/// partial install is cancelled.
async fn install_from(
    svc: Arc<GsiService>,
    caller: Caller,
    mut src: Source,
    size: u64,
    params: InstallParams,
    one_shot: bool,
) -> Result<()> {
    let bar = indicatif::ProgressBar::new(size);
    bar.set_style(indicatif::ProgressStyle::default_bar().template(
        "{wide_msg} {bar} {binary_bytes}/{binary_total_bytes} ({binary_bytes_per_sec})",
    )?);
    let progress = tokio::spawn(show_progress(svc.clone(), caller, bar.clone()));
    let interrupt = tokio::spawn(cancel_on_interrupt(svc.clone(), caller));

    let worker = {
        let svc = svc.clone();
        tokio::task::spawn_blocking(move || {
            let r = (|| {
                svc.begin_install(caller, &params)?;
                svc.commit_stream(caller, &mut src, size)?;
                svc.finalize(caller, one_shot)
            })();
            if r.is_err() {
                if let Err(e) = svc.cancel(caller) {
                    tracing::warn!("Cancelling failed install: {e}");
                }
            }
            r
        })
    };
    let r = worker.await.context("Install task");
    interrupt.abort();
    progress.abort();
    bar.finish_and_clear();
    r??;
    println!("Installed {size} bytes into {}", svc.installed_image_dir(caller)?);
    Ok(())
}

fn print_status(status: &ServiceStatus) {
    let state = if status.in_progress {
        "in progress"
    } else if !status.installed {
        "not installed"
    } else if status.running {
        "installed, running"
    } else {
        "installed"
    };
    println!("Install: {state}");
    if let Some(dir) = status.install_dir.as_ref() {
        println!("Directory: {dir}");
    }
    if status.installed {
        let boot = serde_json::to_value(status.boot_status)
            .ok()
            .and_then(|v| v.as_str().map(ToOwned::to_owned))
            .unwrap_or_default();
        println!("Boot status: {boot}");
    }
    if status.in_progress {
        let p = &status.progress;
        println!(
            "Progress: {} {}/{} bytes",
            p.step, p.bytes_processed, p.total_bytes
        );
    }
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<T>(args: impl IntoIterator<Item = T>) -> Result<()>
where
    T: Into<OsString> + Clone,
{
    run_from_opt(Cli::parse_from(args)).await
}

/// Internal (non-generic/monomorphized) primary CLI entrypoint
async fn run_from_opt(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    let svc = Arc::new(GsiService::new(config)?);
    let caller = Caller::current();
    tracing::debug!("Running as uid {}", caller.uid);
    match cli.opt {
        Opt::Install(opts) => install(svc, opts).await,
        Opt::Status { json } => {
            let status = svc.status(caller)?;
            if json {
                let mut stdout = std::io::stdout().lock();
                serde_json::to_writer_pretty(&mut stdout, &status)?;
                println!();
            } else {
                print_status(&status);
            }
            Ok(())
        }
        Opt::Enable { one_shot } => Ok(svc.enable(caller, one_shot)?),
        Opt::Disable => Ok(svc.disable(caller)?),
        Opt::WipeUserdata => Ok(svc.wipe_userdata(caller)?),
        Opt::Remove { keep_userdata } => Ok(svc.uninstall(caller, !keep_userdata)?),
        Opt::Startup => svc.run_startup_tasks(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InstallError;
    use crate::testutil::FakePlatform;

    fn parse(args: &[&str]) -> Result<Cli> {
        Ok(Cli::try_parse_from(std::iter::once("gsid").chain(args.iter().copied()))?)
    }

    #[test]
    fn test_parse_install() -> Result<()> {
        let cli = parse(&[
            "install",
            "system.img",
            "--userdata-size=2G",
            "--one-shot",
            "--config",
            "/tmp/gsid.toml",
        ])?;
        assert_eq!(cli.config.as_deref().map(|p| p.as_str()), Some("/tmp/gsid.toml"));
        let Opt::Install(opts) = cli.opt else {
            panic!("expected install");
        };
        assert_eq!(opts.image.as_str(), "system.img");
        assert_eq!(opts.userdata_size, Some(2 << 30));
        assert_eq!(opts.size, None);
        assert!(opts.one_shot);
        assert!(!opts.wipe);
        assert!(parse(&["install", "-", "--size", "12X"]).is_err());
        Ok(())
    }

    #[test]
    fn test_parse_commands() -> Result<()> {
        assert_eq!(parse(&["status", "--json"])?.opt, Opt::Status { json: true });
        assert_eq!(
            parse(&["remove", "--keep-userdata"])?.opt,
            Opt::Remove {
                keep_userdata: true
            }
        );
        assert_eq!(parse(&["wipe-userdata"])?.opt, Opt::WipeUserdata);
        assert_eq!(
            parse(&["enable"])?.opt,
            Opt::Enable { one_shot: false }
        );
        assert!(parse(&["frobnicate"]).is_err());
        Ok(())
    }

    #[test]
    fn test_open_source() -> Result<()> {
        let td = tempfile::tempdir()?;
        let image = Utf8PathBuf::try_from(td.path().join("system.img"))?;
        std::fs::write(&image, vec![1u8; 8192])?;
        let opts = |image: &str, size: Option<u64>| InstallOpts {
            image: image.into(),
            size,
            userdata_size: None,
            wipe: false,
            install_dir: None,
            one_shot: false,
        };

        let (mut src, size) = open_source(&opts(image.as_str(), None))?;
        assert_eq!(size, 8192);
        let mut buf = Vec::new();
        src.read_to_end(&mut buf)?;
        assert_eq!(buf.len(), 8192);
        assert_eq!(open_source(&opts(image.as_str(), Some(4096)))?.1, 4096);
        assert!(open_source(&opts(image.as_str(), Some(16384))).is_err());
        assert!(open_source(&opts("-", None)).is_err());
        assert_eq!(open_source(&opts("-", Some(512)))?.1, 512);

        let params = install_params(&opts("-", None), 4096)?;
        assert_eq!(params.gsi_size, 4096);
        assert_eq!(params.userdata_size, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_install_short_source() -> Result<()> {
        let p = Arc::new(FakePlatform::new()?);
        let svc = Arc::new(GsiService::with_platform(p.config(), p.clone())?);
        let caller = Caller { uid: 0 };
        let params = InstallParams {
            gsi_size: 1 << 20,
            userdata_size: 1 << 20,
            ..Default::default()
        };
        let src: Source = Box::new(std::io::Cursor::new(vec![0u8; 4096]));
        let r = install_from(svc.clone(), caller, src, 1 << 20, params, false).await;
        let e = r.unwrap_err();
        assert!(
            matches!(
                e.downcast_ref::<InstallError>(),
                Some(InstallError::InvalidParameter(_))
            ),
            "{e:#}"
        );
        assert!(!svc.is_in_progress(caller)?);
        assert!(!svc.is_installed(caller)?);
        assert_eq!(std::fs::read_dir(p.dir())?.count(), 0);
        Ok(())
    }
}
