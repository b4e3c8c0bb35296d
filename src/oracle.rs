// SPDX-License-Identifier: PMPL-1.0-or-later

//! Black-box oracle invocation.
//!
//! An oracle is an external executable that replays a sequence file against
//! a real allocator and reports the address gap between the two named
//! allocations on stdout. This module materializes a candidate into the
//! oracle's expected input file, runs it under a deadline, and classifies
//! the outcome. The candidate file lives in a scoped temp file that is
//! removed whatever the outcome.

use crate::types::OracleError;
use regex::Regex;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

/// Per-candidate oracle deadline.
pub const ORACLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Oracles that sandbox candidate code print this when they refuse part of
/// a candidate.
const SECURITY_MARKER: &str = "disabled for security reasons";

/// How a candidate sequence becomes the oracle's input file. This is the
/// only point where the two oracle flavors differ.
#[derive(Debug, Clone)]
pub enum Materialize {
    /// Replay-binary flavor: a private copy of the starting configuration
    /// with the candidate's protocol lines appended.
    Trace { starting_config: Vec<String> },
    /// Later solver stages: the candidate lands between a solved prefix and
    /// the suffix that places the earlier stages' named allocations.
    Splice {
        prefix: Vec<String>,
        suffix: Vec<String>,
    },
    /// Interpreter flavor: the candidate is a code fragment wrapped between
    /// a prologue and an epilogue.
    Script { prologue: String, epilogue: String },
}

impl Materialize {
    /// Render the full oracle input for one candidate. With `mark_stage`
    /// set, the stage marker is spliced in after the candidate's first
    /// named allocation; that form is what reproducer files persist, never
    /// what the oracle runs.
    pub fn render(&self, candidate: &[String], mark_stage: bool) -> String {
        let mut out = String::new();
        let mut push = |line: &str| {
            out.push_str(line);
            out.push('\n');
        };

        let emit_candidate = |push: &mut dyn FnMut(&str)| {
            for line in candidate {
                push(line);
                if mark_stage && line.starts_with("vtx src ") {
                    push(crate::trace::STAGE_MARKER);
                }
            }
        };

        match self {
            Materialize::Trace { starting_config } => {
                for line in starting_config {
                    push(line);
                }
                push("");
                emit_candidate(&mut push);
            }
            Materialize::Splice { prefix, suffix } => {
                for line in prefix {
                    push(line);
                }
                emit_candidate(&mut push);
                for line in suffix {
                    push(line);
                }
            }
            Materialize::Script { prologue, epilogue } => {
                push(prologue);
                emit_candidate(&mut push);
                push(epilogue);
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct OracleRunner {
    oracle: PathBuf,
    materialize: Materialize,
    timeout: Duration,
    distance_re: Regex,
}

impl OracleRunner {
    pub fn new(oracle: PathBuf, materialize: Materialize) -> Self {
        Self::with_timeout(oracle, materialize, ORACLE_TIMEOUT)
    }

    pub fn with_timeout(oracle: PathBuf, materialize: Materialize, timeout: Duration) -> Self {
        Self {
            oracle,
            materialize,
            timeout,
            distance_re: Regex::new(r"^vtx distance (-?\d+)\s*$").unwrap(),
        }
    }

    /// Run one candidate through the oracle and return the raw reported
    /// distance.
    pub fn run(&self, candidate: &[String]) -> Result<i64, OracleError> {
        let input = self.write_candidate(candidate).map_err(|_| OracleError::Os)?;

        let mut child = Command::new(&self.oracle)
            .arg(input.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|_| OracleError::Os)?;

        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => {}
                Err(_) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(OracleError::Os);
                }
            }
            if start.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(OracleError::Timeout);
            }
            thread::sleep(Duration::from_millis(10));
        }

        let output = child.wait_with_output().map_err(|_| OracleError::Os)?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if stdout.contains(SECURITY_MARKER) {
            return Err(OracleError::Security);
        }
        if !output.status.success() {
            return Err(OracleError::Exec);
        }

        self.extract_distance(&stdout).ok_or(OracleError::Exec)
    }

    pub fn materialize(&self) -> &Materialize {
        &self.materialize
    }

    fn write_candidate(&self, candidate: &[String]) -> std::io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        file.write_all(self.materialize.render(candidate, false).as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    fn extract_distance(&self, stdout: &str) -> Option<i64> {
        stdout.lines().find_map(|line| {
            self.distance_re
                .captures(line.trim_end())
                .and_then(|caps| caps[1].parse().ok())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn stub_oracle(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("oracle.sh");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn trace_runner(oracle: PathBuf) -> OracleRunner {
        OracleRunner::new(
            oracle,
            Materialize::Trace {
                starting_config: vec!["vtx alloc 32 100".to_string()],
            },
        )
    }

    #[test]
    fn test_reported_distance_is_extracted() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = stub_oracle(dir.path(), "echo 'vtx distance -72'");
        let distance = trace_runner(oracle)
            .run(&["vtx src 64".to_string(), "vtx dst 64".to_string()])
            .expect("stub oracle reports a distance");
        assert_eq!(distance, -72);
    }

    #[test]
    fn test_candidate_file_reaches_the_oracle() {
        let dir = tempfile::tempdir().unwrap();
        // succeed only if the input file carries both the starting config and
        // the candidate
        let oracle = stub_oracle(
            dir.path(),
            "grep -q 'vtx alloc 32 100' \"$1\" && grep -q 'vtx src 64' \"$1\" \
             && echo 'vtx distance 8'",
        );
        let distance = trace_runner(oracle)
            .run(&["vtx src 64".to_string()])
            .expect("oracle saw the materialized file");
        assert_eq!(distance, 8);
    }

    #[test]
    fn test_nonzero_exit_is_an_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = stub_oracle(dir.path(), "exit 3");
        assert_eq!(trace_runner(oracle).run(&[]), Err(OracleError::Exec));
    }

    #[test]
    fn test_missing_distance_line_is_an_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = stub_oracle(dir.path(), "echo 'no report here'");
        assert_eq!(trace_runner(oracle).run(&[]), Err(OracleError::Exec));
    }

    #[test]
    fn test_unspawnable_oracle_is_an_os_error() {
        let runner = trace_runner(PathBuf::from("/nonexistent/oracle"));
        assert_eq!(runner.run(&[]), Err(OracleError::Os));
    }

    #[test]
    fn test_hung_oracle_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = stub_oracle(dir.path(), "sleep 30");
        let runner = OracleRunner::with_timeout(
            oracle,
            Materialize::Trace {
                starting_config: Vec::new(),
            },
            Duration::from_millis(200),
        );
        assert_eq!(runner.run(&[]), Err(OracleError::Timeout));
    }

    #[test]
    fn test_security_refusal_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = stub_oracle(
            dir.path(),
            "echo 'foo has been disabled for security reasons'",
        );
        assert_eq!(trace_runner(oracle).run(&[]), Err(OracleError::Security));
    }

    #[test]
    fn test_splice_materialization_embeds_the_candidate() {
        let materialize = Materialize::Splice {
            prefix: vec!["vtx alloc 32 100".to_string()],
            suffix: vec!["vtx src 64".to_string(), "vtx dst 64".to_string()],
        };
        let rendered = materialize.render(&["vtx alloc 16 3".to_string()], false);
        assert_eq!(
            rendered,
            "vtx alloc 32 100\nvtx alloc 16 3\nvtx src 64\nvtx dst 64\n"
        );
    }

    #[test]
    fn test_marked_render_places_stage_marker_after_first_named_alloc() {
        let materialize = Materialize::Trace {
            starting_config: vec!["vtx alloc 32 100".to_string()],
        };
        let rendered = materialize.render(
            &["vtx src 64".to_string(), "vtx dst 64".to_string()],
            true,
        );
        assert_eq!(
            rendered,
            format!(
                "vtx alloc 32 100\n\nvtx src 64\n{}\nvtx dst 64\n",
                crate::trace::STAGE_MARKER
            )
        );
    }

    #[test]
    fn test_script_materialization_wraps_the_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = stub_oracle(
            dir.path(),
            "head -1 \"$1\" | grep -q 'BEGIN' && tail -1 \"$1\" | grep -q 'END' \
             && echo 'vtx distance 16'",
        );
        let runner = OracleRunner::new(
            oracle,
            Materialize::Script {
                prologue: "BEGIN".to_string(),
                epilogue: "END".to_string(),
            },
        );
        assert_eq!(runner.run(&["work();".to_string()]), Ok(16));
    }
}
