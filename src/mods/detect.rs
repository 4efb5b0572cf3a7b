//! src/mods/detect.rs
//! Frame driver for one stream, and the single-file CLI mode built on it

use anyhow::Result;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::Arc;

use crate::decode::{ PcmSource, SymphoniaSource };
use crate::error::DetectError;
use crate::frames::FrameReader;
use crate::logger::Logger;
use crate::spectral::ToneAnalyzer;
use crate::tone_presence::{ DetectSettings, ToneInterval, ToneParams, ToneTracker, TrackerState };
use crate::Config;

#[derive(Clone, Debug, PartialEq)]
pub enum StopReason {
    EndOfStream,
    Interrupted,
    ReadError(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToneScan {
    pub intervals: Vec<ToneInterval>,
    pub frames: u64,
    /// PCM bytes the decoder produced, including a trailing partial frame.
    pub bytes_decoded: u64,
    pub stop: StopReason,
}

impl ToneScan {
    /// The container's declared length, or the decoded count once the stream
    /// was read to its end.
    pub fn resolve_length(&self, declared: Option<u64>) -> Option<u64> {
        declared.or_else(|| (self.stop == StopReason::EndOfStream).then_some(self.bytes_decoded))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetectionReport {
    pub path: String,
    pub params: ToneParams,
    pub length_bytes: Option<u64>,
    pub scan: ToneScan,
}

/// Runs the whole stream through window → FFT → magnitude → tracker.
///
/// Frame `k` is stamped `k * window_ms`. A read error ends the scan like end of
/// stream does, but is kept in `stop` so callers can surface it.
pub fn detect_tones<S: PcmSource>(
    source: S,
    params: &ToneParams,
    flush_on_end: bool,
    quit: &AtomicBool,
    logger: &Logger,
    mut on_interval: impl FnMut(&ToneInterval)
) -> Result<ToneScan, DetectError> {
    let mut reader = FrameReader::new(source, params.window_samples);
    let mut analyzer = ToneAnalyzer::new(params);
    let mut tracker = ToneTracker::new(params.threshold);
    let mut frame = vec![0.0f32; params.window_samples];

    let mut intervals = Vec::new();
    let mut frames = 0u64;
    let mut t_ms = 0u64;

    let stop = loop {
        if quit.load(Ordering::SeqCst) {
            break StopReason::Interrupted;
        }
        match reader.next_frame(&mut frame) {
            Ok(true) => {}
            Ok(false) => {
                break StopReason::EndOfStream;
            }
            Err(e) => {
                break StopReason::ReadError(e.to_string());
            }
        }

        let magnitude = analyzer.magnitude(&frame)?;
        let _ = log_debug!(logger, "t={}ms magnitude={:.5}", t_ms, magnitude);

        if let Some(interval) = tracker.observe(magnitude, t_ms) {
            let _ = log_info!(
                logger,
                "tone {}ms..{}ms ({}ms)",
                interval.start_ms,
                interval.end_ms,
                interval.duration_ms()
            );
            on_interval(&interval);
            intervals.push(interval);
        }

        frames += 1;
        t_ms += params.window_ms as u64;
    };

    if let TrackerState::Detecting { start_ms } = tracker.state() {
        let _ = log_debug!(logger, "tone open since {}ms when the scan stopped at {}ms", start_ms, t_ms);
    }
    if let Some(interval) = tracker.finish(t_ms, flush_on_end) {
        let _ = log_info!(
            logger,
            "tone {}ms..{}ms (open at end of stream)",
            interval.start_ms,
            interval.end_ms
        );
        on_interval(&interval);
        intervals.push(interval);
    }

    Ok(ToneScan { intervals, frames, bytes_decoded: reader.bytes_read(), stop })
}

/// Settings are checked before the file is touched; the bin range right after
/// the sample rate is known, so both fail before any frame is read.
pub fn open_stream(
    path: &str,
    settings: &DetectSettings
) -> Result<(SymphoniaSource, ToneParams), DetectError> {
    settings.validate()?;
    let source = SymphoniaSource::open(path)?;
    let params = ToneParams::derive(source.sample_rate(), settings)?;
    Ok((source, params))
}

pub fn analyze_file(
    path: &str,
    settings: &DetectSettings,
    quit: &AtomicBool,
    logger: &Logger
) -> Result<DetectionReport, DetectError> {
    let (source, params) = open_stream(path, settings)?;
    let declared = source.length_bytes();
    let scan = detect_tones(source, &params, settings.flush_on_end, quit, logger, |_| {})?;
    let length_bytes = scan.resolve_length(declared);
    let _ = log_info!(
        logger,
        "{}: {} frame(s), {} interval(s), stop={:?}",
        path,
        scan.frames,
        scan.intervals.len(),
        scan.stop
    );
    Ok(DetectionReport {
        path: path.to_string(),
        params,
        length_bytes,
        scan,
    })
}

pub fn print_parameters(params: &ToneParams, length_bytes: Option<u64>) {
    println!("Sample Rate: {}", params.sample_rate);
    match length_bytes {
        Some(len) => println!("Length: {}[bytes]", len),
        None => println!("Length: unknown"),
    }
    println!("Window size: {}[samples]", params.window_samples);
    println!("FFT size: {}", params.fft_size);
    println!("Spectral Line width: {}[hertz]", params.bin_width_hz);
    println!("Tone index: {}", params.target_bin);
}

pub fn print_report(report: &DetectionReport) {
    print_parameters(&report.params, report.length_bytes);
    for interval in &report.scan.intervals {
        println!("{}", interval);
    }
    match &report.scan.stop {
        StopReason::EndOfStream => {}
        StopReason::Interrupted => {
            println!("Interrupted after {} frame(s).", report.scan.frames);
        }
        StopReason::ReadError(msg) => {
            println!("Stopped after {} frame(s): {}", report.scan.frames, msg);
        }
    }
}

/// Single-file mode: parameters first, then each interval as soon as it closes.
pub fn run_detect(cli: &Config, logger: Arc<Logger>, quit: &AtomicBool) -> Result<()> {
    let settings = cli.detect_settings();
    let path = cli.inputs
        .first()
        .ok_or_else(|| anyhow::anyhow!("an input file is required"))?;

    logger.info(
        &format!(
            "tone-detect starting…  tone={}Hz window_ms={} threshold={:.3} flush_on_end={} input={}",
            settings.tone_hz,
            settings.window_ms,
            settings.threshold,
            settings.flush_on_end,
            path
        )
    )?;

    let (source, params) = open_stream(path, &settings)?;
    let length_bytes = source.length_bytes();
    logger.info(
        &format!(
            "Decoded stream: sr={} Hz, channels={}, window={} samples, fft={}, bin={} ({:.2} Hz wide)",
            params.sample_rate,
            source.channels(),
            params.window_samples,
            params.fft_size,
            params.target_bin,
            params.bin_width_hz
        )
    )?;
    print_parameters(&params, length_bytes);

    let scan = detect_tones(source, &params, settings.flush_on_end, quit, &logger, |interval| {
        println!("{}", interval)
    })?;

    match scan.stop {
        StopReason::EndOfStream => {
            if length_bytes.is_none() {
                println!("Length: {}[bytes]", scan.bytes_decoded);
            }
            logger.info(
                &format!(
                    "Finished: {} frame(s), {} interval(s)",
                    scan.frames,
                    scan.intervals.len()
                )
            )?;
        }
        StopReason::Interrupted => {
            logger.info(&format!("Interrupted after {} frame(s)", scan.frames))?;
            eprintln!("Interrupted after {} frame(s).", scan.frames);
        }
        StopReason::ReadError(msg) => {
            log_warn!(logger, "Read failed after {} frame(s): {}", scan.frames, msg)?;
            anyhow::bail!("analysis stopped after {} frame(s): {}", scan.frames, msg);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ interleaved_pcm, tone_samples, write_wav, PcmBuffer };

    const SR: u32 = 44_100;

    fn scan_pcm(
        samples: &[i16],
        channels: usize,
        settings: &DetectSettings
    ) -> ToneScan {
        let params = ToneParams::derive(SR, settings).unwrap();
        let source = PcmBuffer::new(SR, channels, interleaved_pcm(samples, channels));
        let quit = AtomicBool::new(false);
        detect_tones(
            source,
            &params,
            settings.flush_on_end,
            &quit,
            &Logger::disabled(),
            |_| {}
        ).unwrap()
    }

    #[test]
    fn tone_burst_in_silence() {
        let samples = tone_samples(SR, 800, Some((1000.0, 200, 400)), 1.0);
        let scan = scan_pcm(&samples, 2, &DetectSettings::new(1000));
        assert_eq!(scan.intervals, vec![ToneInterval { start_ms: 200, end_ms: 400 }]);
        assert_eq!(scan.frames, 20);
        assert_eq!(scan.stop, StopReason::EndOfStream);
    }

    #[test]
    fn unaligned_burst_within_one_window() {
        let samples = tone_samples(SR, 1000, Some((1000.0, 130, 330)), 1.0);
        let scan = scan_pcm(&samples, 2, &DetectSettings::new(1000));
        assert_eq!(scan.intervals.len(), 1);
        let iv = scan.intervals[0];
        assert_eq!(iv.start_ms % 40, 0);
        let d = iv.duration_ms() as i64;
        assert!((d - 200).abs() <= 40, "{:?}", iv);
    }

    #[test]
    fn silence_yields_nothing() {
        let samples = tone_samples(SR, 1000, None, 1.0);
        let scan = scan_pcm(&samples, 2, &DetectSettings::new(1000));
        assert!(scan.intervals.is_empty());
        assert_eq!(scan.frames, 25);
    }

    #[test]
    fn other_frequency_is_ignored() {
        let samples = tone_samples(SR, 800, Some((4000.0, 200, 400)), 1.0);
        let scan = scan_pcm(&samples, 2, &DetectSettings::new(1000));
        assert!(scan.intervals.is_empty());
    }

    #[test]
    fn tone_until_end_is_dropped_without_flush() {
        let samples = tone_samples(SR, 400, Some((1000.0, 0, 400)), 1.0);
        let scan = scan_pcm(&samples, 2, &DetectSettings::new(1000));
        assert_eq!(scan.frames, 10);
        assert!(scan.intervals.is_empty());
    }

    #[test]
    fn tone_until_end_is_flushed_when_enabled() {
        let samples = tone_samples(SR, 400, Some((1000.0, 0, 400)), 1.0);
        let mut settings = DetectSettings::new(1000);
        settings.flush_on_end = true;
        let scan = scan_pcm(&samples, 2, &settings);
        assert_eq!(scan.intervals, vec![ToneInterval { start_ms: 0, end_ms: 400 }]);
    }

    #[test]
    fn quiet_tone_needs_lower_threshold() {
        // ~0.2 × 0.1 amplitude sits under the default threshold
        let samples = tone_samples(SR, 800, Some((1000.0, 200, 400)), 0.1);
        assert!(scan_pcm(&samples, 2, &DetectSettings::new(1000)).intervals.is_empty());

        let mut settings = DetectSettings::new(1000);
        settings.threshold = 0.005;
        let scan = scan_pcm(&samples, 2, &settings);
        assert_eq!(scan.intervals, vec![ToneInterval { start_ms: 200, end_ms: 400 }]);
    }

    #[test]
    fn burst_just_over_default_threshold() {
        // ~0.0546 per frame against 0.05
        let samples = tone_samples(SR, 800, Some((1000.0, 200, 400)), 0.24);
        let scan = scan_pcm(&samples, 2, &DetectSettings::new(1000));
        assert_eq!(scan.intervals, vec![ToneInterval { start_ms: 200, end_ms: 400 }]);
    }

    #[test]
    fn decoded_bytes_fill_in_undeclared_length() {
        // 810 ms leaves a 10 ms tail that never becomes a frame
        let samples = tone_samples(SR, 810, None, 1.0);
        let scan = scan_pcm(&samples, 2, &DetectSettings::new(1000));
        assert_eq!(scan.frames, 20);
        assert_eq!(scan.bytes_decoded, (samples.len() * 4) as u64);

        assert_eq!(scan.resolve_length(None), Some(scan.bytes_decoded));
        assert_eq!(scan.resolve_length(Some(7)), Some(7));

        let cut_short = ToneScan { stop: StopReason::Interrupted, ..scan };
        assert_eq!(cut_short.resolve_length(None), None);
    }

    #[test]
    fn rerun_is_identical() {
        let samples = tone_samples(SR, 1200, Some((1000.0, 130, 610)), 0.8);
        let settings = DetectSettings::new(1000);
        let a = scan_pcm(&samples, 2, &settings);
        let b = scan_pcm(&samples, 2, &settings);
        assert_eq!(a, b);
    }

    #[test]
    fn mono_stream() {
        let samples = tone_samples(SR, 800, Some((1000.0, 200, 400)), 1.0);
        let scan = scan_pcm(&samples, 1, &DetectSettings::new(1000));
        assert_eq!(scan.intervals, vec![ToneInterval { start_ms: 200, end_ms: 400 }]);
    }

    #[test]
    fn two_bursts_with_custom_window() {
        let mut samples = tone_samples(SR, 1000, Some((1000.0, 100, 300)), 1.0);
        let second = tone_samples(SR, 1000, Some((1000.0, 600, 800)), 1.0);
        for (a, b) in samples.iter_mut().zip(second) {
            *a = a.saturating_add(b);
        }
        let mut settings = DetectSettings::new(1000);
        settings.window_ms = 50;
        let scan = scan_pcm(&samples, 2, &settings);
        assert_eq!(
            scan.intervals,
            vec![
                ToneInterval { start_ms: 100, end_ms: 300 },
                ToneInterval { start_ms: 600, end_ms: 800 }
            ]
        );
    }

    #[test]
    fn read_error_keeps_earlier_intervals() {
        let samples = tone_samples(SR, 800, Some((1000.0, 40, 120)), 1.0);
        let bytes = interleaved_pcm(&samples, 2);
        // fail inside frame 6 (1764 samples × 4 bytes per frame)
        let source = PcmBuffer::new(SR, 2, bytes).failing_at(1764 * 4 * 6 + 100);
        let params = ToneParams::derive(SR, &DetectSettings::new(1000)).unwrap();
        let quit = AtomicBool::new(false);

        let mut seen = Vec::new();
        let scan = detect_tones(source, &params, false, &quit, &Logger::disabled(), |iv| {
            seen.push(*iv)
        }).unwrap();

        assert_eq!(scan.frames, 6);
        assert!(matches!(scan.stop, StopReason::ReadError(_)));
        assert_eq!(scan.intervals, vec![ToneInterval { start_ms: 40, end_ms: 120 }]);
        assert_eq!(seen, scan.intervals);
    }

    #[test]
    fn quit_flag_stops_before_reading() {
        let samples = tone_samples(SR, 400, Some((1000.0, 0, 400)), 1.0);
        let params = ToneParams::derive(SR, &DetectSettings::new(1000)).unwrap();
        let quit = AtomicBool::new(true);
        let source = PcmBuffer::new(SR, 2, interleaved_pcm(&samples, 2));
        let scan = detect_tones(source, &params, true, &quit, &Logger::disabled(), |_| {}).unwrap();
        assert_eq!(scan.stop, StopReason::Interrupted);
        assert_eq!(scan.frames, 0);
        assert!(scan.intervals.is_empty());
    }

    #[test]
    fn wav_file_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("burst.wav");
        write_wav(&path, SR, 2, &tone_samples(SR, 800, Some((1000.0, 200, 400)), 1.0));

        let quit = AtomicBool::new(false);
        let report = analyze_file(
            path.to_str().unwrap(),
            &DetectSettings::new(1000),
            &quit,
            &Logger::disabled()
        ).unwrap();

        assert_eq!(report.params.window_samples, 1764);
        assert_eq!(report.params.fft_size, 2048);
        assert_eq!(report.params.target_bin, 46);
        assert_eq!(report.scan.intervals, vec![ToneInterval { start_ms: 200, end_ms: 400 }]);
        assert_eq!(report.scan.stop, StopReason::EndOfStream);
    }

    #[test]
    fn config_errors_surface_before_decoding() {
        let quit = AtomicBool::new(false);
        let err = analyze_file(
            "does-not-exist.mp3",
            &DetectSettings::new(-20),
            &quit,
            &Logger::disabled()
        ).unwrap_err();
        assert!(matches!(err, DetectError::Config(_)));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("low.wav");
        write_wav(&path, 8_000, 1, &tone_samples(8_000, 200, None, 1.0));
        let err = analyze_file(
            path.to_str().unwrap(),
            &DetectSettings::new(6_000),
            &quit,
            &Logger::disabled()
        ).unwrap_err();
        assert!(matches!(err, DetectError::Config(_)));
    }

    #[test]
    fn missing_file_is_decode_open() {
        let quit = AtomicBool::new(false);
        let err = analyze_file(
            "does-not-exist.mp3",
            &DetectSettings::new(1000),
            &quit,
            &Logger::disabled()
        ).unwrap_err();
        assert!(matches!(err, DetectError::DecodeOpen(_)));
    }
}
