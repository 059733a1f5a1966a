//! Discovery of optional dependencies via the distro-side helper.
//!
//! The helper runs interactively inside the container and mixes free-form
//! progress output (including in-place redraws using carriage returns) with a
//! trailing machine-readable block. Two cooperating stages handle that stream:
//! a byte forwarder that never delays visible output, and a line accumulator
//! that only watches for the sentinel. After the sentinel everything is
//! line-oriented records.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::ui::prelude::*;

/// Line that separates progress output from the record block.
pub const SENTINEL: &str = "Found optional dependencies";

const PKG_PREFIX: &str = "PKG: ";
const FIELD_DELIM: &str = "::::";

/// How long to wait for the helper to exit after its output ends.
const EXIT_TIMEOUT: Duration = Duration::from_secs(60);

/// An optional dependency reported by the helper. `level` 1 is a direct
/// dependency of the package being installed, higher levels were found through
/// a dependency that would itself be newly installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionalDep {
    pub name: String,
    pub description: String,
    pub level: u32,
}

/// Run the helper command and collect the reported dependencies.
///
/// A non-zero exit (or exceeding the exit timeout) is a soft failure: a warning
/// is emitted and the list is discarded so the install proceeds without
/// optional dependencies.
pub fn discover(command: &mut Command, package: &str) -> Result<Vec<OptionalDep>> {
    let mut child = command
        .stdout(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to run optional dependency search for '{package}'"))?;
    let stdout = child
        .stdout
        .take()
        .context("No stdout pipe from dependency search")?;
    let mut reader = BufReader::new(stdout);
    let mut deps = {
        let out = std::io::stdout();
        let mut sink = out.lock();
        let found = forward_until_sentinel(&mut reader, &mut sink)?;
        sink.flush()?;
        if found { parse_records(reader) } else { Vec::new() }
    };

    let status = wait_with_timeout(&mut child, EXIT_TIMEOUT)?;
    if !status.map(|s| s.success()).unwrap_or(false) {
        emit(
            Level::Warn,
            "install.opt_deps",
            &format!(
                "FAILED to determine optional dependencies of {package} -- see above \
                 output for details. Skipping optional dependencies."
            ),
            None,
        );
        deps.clear();
    }
    Ok(deps)
}

/// Forward every byte from `reader` to `sink` until a whole line equals the
/// sentinel (a trailing carriage return is ignored). Returns whether the
/// sentinel was seen before EOF.
///
/// Flushing happens at every newline and at least every few bytes in between,
/// so in-place progress updates (which may never emit a newline) stay visible.
fn forward_until_sentinel(reader: &mut impl Read, sink: &mut impl Write) -> Result<bool> {
    let mut line: Vec<u8> = Vec::new();
    let mut buffered = 0usize;
    for byte in reader.bytes() {
        let byte = byte.context("Failed reading dependency search output")?;
        sink.write_all(&[byte])?;
        buffered += 1;
        if byte == b'\n' {
            sink.flush()?;
            buffered = 0;
            let text = String::from_utf8_lossy(&line);
            let done = text.trim_end_matches('\r') == SENTINEL;
            line.clear();
            if done {
                return Ok(true);
            }
        } else {
            line.push(byte);
            if buffered >= 4 {
                sink.flush()?;
                buffered = 0;
            }
        }
    }
    sink.flush()?;
    Ok(false)
}

/// Parse `PKG: <name>::::<description>::::<level>` records in arrival order.
/// Lines not matching the pattern are ignored.
fn parse_records(reader: impl BufRead) -> Vec<OptionalDep> {
    let mut deps = Vec::new();
    for line in reader.lines() {
        let Ok(line) = line else { break };
        let Some(record) = line.strip_prefix(PKG_PREFIX) else {
            continue;
        };
        let mut fields = record.splitn(3, FIELD_DELIM);
        let (Some(name), Some(description), Some(level)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let Ok(level) = level.trim().parse::<u32>() else {
            continue;
        };
        deps.push(OptionalDep {
            name: name.to_string(),
            description: description.to_string(),
            level,
        });
    }
    deps
}

/// Wait for the child to exit, killing it if the timeout passes. `None` means
/// the child had to be killed.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            child.kill().ok();
            child.wait()?;
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
