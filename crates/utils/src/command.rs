//! Helpers intended for [`std::process::Command`] and related structures.

use std::io::{Read, Seek};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, capturing its stderr; on failure the
    /// captured output is included in the returned error.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child process and capture its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Render the command in a form that could be pasted into a shell.
    fn to_string_pretty(&self) -> String;
}

/// Render the last few lines of stderr into an error.
fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    // u16 since we truncate to just the trailing bytes here
    // to avoid pathological error messages
    const MAX_STDERR_BYTES: u16 = 1024;
    let size = f
        .metadata()
        .map_err(|e| {
            tracing::warn!("failed to fstat: {e}");
        })
        .map(|m| m.len().try_into().unwrap_or(u16::MAX))
        .unwrap_or(0);
    let size = size.min(MAX_STDERR_BYTES);
    let seek_offset = -(size as i32);
    let mut stderr_buf = Vec::with_capacity(size.into());
    // We should never fail to seek()+read() really, but let's be conservative
    let r = match f
        .seek(std::io::SeekFrom::End(seek_offset.into()))
        .and_then(|_| f.read_to_end(&mut stderr_buf))
    {
        Ok(_) => String::from_utf8_lossy(&stderr_buf),
        Err(e) => {
            tracing::warn!("failed seek+read: {e}");
            "<failed to read stderr>".into()
        }
    };
    r.trim().to_string()
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let stderr = tempfile_for_stderr()?;
        let status = self
            .stdout(Stdio::null())
            .stderr(stderr.try_clone()?)
            .status()
            .with_context(|| format!("Spawning {}", self.to_string_pretty()))?;
        if !status.success() {
            let msg = last_utf8_content_from_file(stderr);
            anyhow::bail!("{}: {status}: {msg}", self.to_string_pretty());
        }
        Ok(())
    }

    fn run_get_string(&mut self) -> Result<String> {
        let stderr = tempfile_for_stderr()?;
        let output = self
            .stdin(Stdio::null())
            .stderr(stderr.try_clone()?)
            .output()
            .with_context(|| format!("Spawning {}", self.to_string_pretty()))?;
        if !output.status.success() {
            let msg = last_utf8_content_from_file(stderr);
            anyhow::bail!("{}: {}: {msg}", self.to_string_pretty(), output.status);
        }
        String::from_utf8(output.stdout)
            .with_context(|| format!("Parsing output of {}", self.to_string_pretty()))
    }

    fn to_string_pretty(&self) -> String {
        let argv = std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>();
        shlex::try_join(argv.iter().map(|s| s.as_ref()))
            .unwrap_or_else(|_| argv.join(" "))
    }
}

/// An anonymous file used to capture the stderr of a child.
fn tempfile_for_stderr() -> Result<std::fs::File> {
    tempfile::tempfile().context("Allocating stderr buffer")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_run_ext() {
        Command::new("true").run_capture_stderr().unwrap();
        assert!(Command::new("false").run_capture_stderr().is_err());
    }

    #[test]
    fn command_run_get_string() {
        let s = Command::new("echo").arg("hello").run_get_string().unwrap();
        similar_asserts::assert_eq!(s, "hello\n");
    }

    #[test]
    fn command_failure_includes_stderr() {
        let e = Command::new("sh")
            .args(["-c", "echo oops 1>&2; exit 1"])
            .run_capture_stderr()
            .unwrap_err();
        assert!(e.to_string().contains("oops"), "{e}");
    }

    #[test]
    fn command_pretty() {
        let mut c = Command::new("dmsetup");
        c.args(["create", "system_gsi", "/tmp/some table"]);
        similar_asserts::assert_eq!(
            c.to_string_pretty(),
            "dmsetup create system_gsi '/tmp/some table'"
        );
    }
}
