// SPDX-License-Identifier: PMPL-1.0-or-later

//! The per-worker search loop.

use super::{Control, Found, Report, REPORT_INTERVAL};
use crate::generate::CandidateGenerator;
use crate::oracle::OracleRunner;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::time::Instant;

/// Generate, evaluate, repeat. The loop never blocks on the control channel
/// so it always makes forward progress; a shutdown message or a hung-up
/// channel ends it after a final counter report.
pub(crate) fn search_loop(
    mut generator: Box<dyn CandidateGenerator>,
    runner: OracleRunner,
    control_rx: Receiver<Control>,
    report_tx: Sender<Report>,
    result_tx: Sender<Found>,
) {
    // Bounds are raw distances; the coordinator does the size adjustment.
    let mut best_neg: Option<i64> = None;
    let mut best_pos: Option<i64> = None;
    let mut execs: u64 = 0;
    let mut errors: u64 = 0;
    let mut last_report = Instant::now();

    loop {
        if last_report.elapsed() >= REPORT_INTERVAL && (execs > 0 || errors > 0) {
            if report_tx.send(Report { execs, errors }).is_err() {
                return;
            }
            execs = 0;
            errors = 0;
            last_report = Instant::now();
        }

        loop {
            match control_rx.try_recv() {
                Ok(Control::Bound(bound)) => {
                    if bound > 0 {
                        best_pos = Some(bound);
                    } else {
                        best_neg = Some(bound);
                    }
                }
                Ok(Control::Shutdown) | Err(TryRecvError::Disconnected) => {
                    if execs > 0 || errors > 0 {
                        let _ = report_tx.send(Report { execs, errors });
                    }
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        let candidate = generator.generate();
        let lines = candidate.stringify();
        execs += 1;

        let distance = match runner.run(&lines) {
            Ok(distance) => distance,
            Err(_) => {
                errors += 1;
                continue;
            }
        };

        let improved = if distance > 0 {
            let better = best_pos.map_or(true, |b| distance < b);
            if better {
                best_pos = Some(distance);
            }
            better
        } else {
            let better = best_neg.map_or(true, |b| distance > b);
            if better {
                best_neg = Some(distance);
            }
            better
        };

        if improved {
            if result_tx
                .send(Found {
                    lines,
                    distance,
                    execs,
                    errors,
                })
                .is_err()
            {
                return;
            }
            execs = 0;
            errors = 0;
            last_report = Instant::now();
        }
    }
}
