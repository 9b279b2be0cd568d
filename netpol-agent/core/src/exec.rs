//! Invocation of the packet-filter command-line backends.
//!
//! Both backends share an exit-status contract: `0` is success, `1` is a
//! benign condition (already exists, not present, still referenced), and
//! anything greater is a real failure. Callers translate benign codes into
//! logged successes so that retried or replayed cluster events converge
//! instead of erroring.

use std::{io, path::Path, process::Stdio};

/// How a backend invocation resolved, once spawn errors and fatal exit
/// codes have been taken off the table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The command ran and changed (or verified) kernel state.
    Applied,
    /// The command exited with the benign status.
    Benign,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{program} {} exited with code {code}", .args.join(" "))]
    Fatal {
        program: &'static str,
        args: Vec<String>,
        code: i32,
    },
}

/// Runs a backend binary and reports its exit code.
///
/// The seam exists so the managers can be driven against an emulated kernel
/// in tests; production uses [`SystemRunner`].
pub trait CommandRunner: std::fmt::Debug + Send + Sync {
    fn run(&self, program: &'static str, args: &[String]) -> io::Result<i32>;

    /// Runs with stdout redirected to `path` (`iptables-save`).
    fn run_stdout_to(&self, program: &'static str, args: &[String], path: &Path)
        -> io::Result<i32>;

    /// Runs with stdin fed from `path` (`iptables-restore`).
    fn run_stdin_from(
        &self,
        program: &'static str,
        args: &[String],
        path: &Path,
    ) -> io::Result<i32>;
}

/// Applies the exit-status contract to a plain invocation.
pub fn execute(
    runner: &dyn CommandRunner,
    program: &'static str,
    args: &[String],
) -> Result<Disposition, Error> {
    match runner.run(program, args) {
        Ok(0) => Ok(Disposition::Applied),
        Ok(1) => Ok(Disposition::Benign),
        Ok(code) => {
            tracing::error!(%program, args = %args.join(" "), code, "backend command failed");
            Err(Error::Fatal {
                program,
                args: args.to_vec(),
                code,
            })
        }
        Err(source) => Err(Error::Spawn { program, source }),
    }
}

/// Invokes the real binaries via `std::process`.
#[derive(Debug, Default)]
pub struct SystemRunner(());

impl SystemRunner {
    pub fn new() -> Self {
        Self(())
    }
}

fn code_of(status: std::process::ExitStatus) -> i32 {
    // A signal termination has no code; surface it as fatal.
    status.code().unwrap_or(255)
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &'static str, args: &[String]) -> io::Result<i32> {
        let out = std::process::Command::new(program).args(args).output()?;
        if !out.status.success() {
            tracing::debug!(
                %program,
                args = %args.join(" "),
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "backend exited non-zero"
            );
        }
        Ok(code_of(out.status))
    }

    fn run_stdout_to(
        &self,
        program: &'static str,
        args: &[String],
        path: &Path,
    ) -> io::Result<i32> {
        let file = std::fs::File::create(path)?;
        let status = std::process::Command::new(program)
            .args(args)
            .stdout(Stdio::from(file))
            .status()?;
        Ok(code_of(status))
    }

    fn run_stdin_from(
        &self,
        program: &'static str,
        args: &[String],
        path: &Path,
    ) -> io::Result<i32> {
        let file = std::fs::File::open(path)?;
        let status = std::process::Command::new(program)
            .args(args)
            .stdin(Stdio::from(file))
            .status()?;
        Ok(code_of(status))
    }
}
