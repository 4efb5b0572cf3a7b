//! src/mods/batch.rs
//! Several files at once: one independent pipeline per file on a worker pool

use anyhow::Result;
use crossbeam_channel::bounded;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use crate::error::DetectError;
use crate::logger::Logger;
use crate::mods::detect::{ analyze_file, print_report, DetectionReport, StopReason };
use crate::tone_presence::DetectSettings;
use crate::Config;

/// Results come back in the order of `paths`, whatever order workers finish in.
pub fn analyze_files(
    paths: &[String],
    settings: &DetectSettings,
    jobs: usize,
    quit: Arc<AtomicBool>,
    logger: Arc<Logger>
) -> Vec<Result<DetectionReport, DetectError>> {
    if paths.is_empty() {
        return Vec::new();
    }
    let workers = jobs.clamp(1, paths.len());

    let (job_tx, job_rx) = bounded::<(usize, String)>(paths.len());
    for (idx, path) in paths.iter().enumerate() {
        let _ = job_tx.send((idx, path.clone()));
    }
    drop(job_tx);

    let (res_tx, res_rx) = bounded::<(usize, Result<DetectionReport, DetectError>)>(paths.len());

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let job_rx = job_rx.clone();
        let res_tx = res_tx.clone();
        let settings = settings.clone();
        let quit = quit.clone();
        let logger = logger.clone();
        handles.push(
            thread::spawn(move || {
                while let Ok((idx, path)) = job_rx.recv() {
                    let _ = log_debug!(logger, "worker {} analyzing {}", worker, path);
                    let outcome = analyze_file(&path, &settings, &quit, &logger);
                    if let Err(e) = &outcome {
                        let _ = log_error!(logger, "{}: {}", path, e);
                    }
                    if res_tx.send((idx, outcome)).is_err() {
                        break;
                    }
                }
            })
        );
    }
    drop(res_tx);

    let mut slots: Vec<Option<Result<DetectionReport, DetectError>>> = (0..paths.len())
        .map(|_| None)
        .collect();
    for (idx, outcome) in res_rx.iter() {
        slots[idx] = Some(outcome);
    }
    for handle in handles {
        let _ = handle.join();
    }

    slots
        .into_iter()
        .zip(paths)
        .map(|(slot, path)| {
            slot.unwrap_or_else(|| {
                Err(DetectError::StreamRead(format!("{}: worker exited without a result", path)))
            })
        })
        .collect()
}

/// Batch mode: every file gets its own report block; any failure makes the run fail.
pub fn run_batch(cli: &Config, logger: Arc<Logger>, quit: Arc<AtomicBool>) -> Result<()> {
    let settings = cli.detect_settings();
    // surface bad settings once instead of per file
    settings.validate()?;

    logger.info(
        &format!(
            "tone-detect batch starting…  files={} jobs={} tone={}Hz window_ms={} threshold={:.3} flush_on_end={}",
            cli.inputs.len(),
            cli.jobs,
            settings.tone_hz,
            settings.window_ms,
            settings.threshold,
            settings.flush_on_end
        )
    )?;

    let outcomes = analyze_files(&cli.inputs, &settings, cli.jobs, quit, logger.clone());

    let mut failed = 0usize;
    for (path, outcome) in cli.inputs.iter().zip(outcomes) {
        println!("== {} ==", path);
        match outcome {
            Ok(report) => {
                print_report(&report);
                if let StopReason::ReadError(msg) = &report.scan.stop {
                    logger.warn(&format!("{}: stopped early: {}", path, msg))?;
                    failed += 1;
                }
            }
            Err(e) => {
                failed += 1;
                eprintln!("error: {}", e);
            }
        }
        println!();
    }

    logger.info(&format!("Batch finished: {} of {} file(s) failed", failed, cli.inputs.len()))?;
    if failed > 0 {
        anyhow::bail!("{} of {} file(s) failed", failed, cli.inputs.len());
    }
    Ok(())
}
