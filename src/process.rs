//! Subprocess plumbing.
//!
//! Thin builder over `std::process::Command` used everywhere the composer
//! shells out (mount, losetup, partprobe, mkfs.*). Keeps call sites short
//! and guarantees that a failing tool surfaces the caller's error message
//! plus whatever the tool printed on stderr.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};

/// Output of a finished command.
#[derive(Debug)]
pub struct CmdOutput {
    success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.success
    }
}

/// Builder for one external command invocation.
pub struct Cmd {
    command: Command,
    display: String,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Cmd {
            command: Command::new(program),
            display: program.to_string(),
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.display.push(' ');
        self.display.push_str(&arg.as_ref().to_string_lossy());
        self.command.arg(arg.as_ref());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Message prepended to the error when the command fails.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Treat a non-zero exit as a normal outcome instead of an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Run to completion, capturing output.
    pub fn run(mut self) -> Result<CmdOutput> {
        log::debug!("running: {}", self.display);

        let output = self.command.output().map_err(|e| {
            Error::Filesystem(format!("failed to spawn '{}': {e}", self.display))
        })?;

        let result = CmdOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success && !self.allow_fail {
            let detail = result.stderr.trim();
            let prefix = self
                .error_msg
                .unwrap_or_else(|| format!("'{}' failed", self.display));
            return Err(Error::Filesystem(if detail.is_empty() {
                prefix
            } else {
                format!("{prefix}: {detail}")
            }));
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() {
        let out = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn failure_carries_error_msg() {
        let err = Cmd::new("false").error_msg("tool went away").run().unwrap_err();
        assert!(err.to_string().contains("tool went away"));
    }

    #[test]
    fn allow_fail_suppresses_error() {
        let out = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!out.success());
    }

    #[test]
    fn missing_binary_is_an_error() {
        assert!(Cmd::new("definitely_not_a_real_command_12345").run().is_err());
    }
}
