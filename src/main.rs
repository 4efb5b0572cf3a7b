//! src/main.rs

use anyhow::Result;
use std::{ env, sync::{ atomic::{ AtomicBool, Ordering }, Arc } };

#[macro_use]
mod logger;
use logger::{ LogLevel, Logger };

mod error;

// expose the split mode files in src/mods/
mod mods;

// ───────────────────────────────────────────────────────────────────────────────
// tone_presence: analysis parameters + per-frame interval tracker
// ───────────────────────────────────────────────────────────────────────────────
pub mod tone_presence {
    use std::fmt;
    use crate::error::DetectError;

    // Defaults (overridable via CLI)
    pub const WINDOW_MS: u32 = 40;
    pub const MAGNITUDE_THRESHOLD: f32 = 0.05;

    #[derive(Clone, Debug, PartialEq)]
    pub struct DetectSettings {
        pub tone_hz: i64,
        pub window_ms: u32,
        pub threshold: f32,
        /// Emit the interval still open when the stream ends.
        pub flush_on_end: bool,
    }

    impl DetectSettings {
        pub fn new(tone_hz: i64) -> Self {
            Self {
                tone_hz,
                window_ms: WINDOW_MS,
                threshold: MAGNITUDE_THRESHOLD,
                flush_on_end: false,
            }
        }

        /// Checks everything that does not depend on the stream's sample rate.
        pub fn validate(&self) -> Result<(), DetectError> {
            if self.tone_hz < 0 {
                return Err(
                    DetectError::Config(
                        format!("tone frequency must not be negative, got {} Hz", self.tone_hz)
                    )
                );
            }
            if self.window_ms == 0 {
                return Err(DetectError::Config("window duration must be at least 1 ms".into()));
            }
            if !(0.0..=1.0).contains(&self.threshold) {
                return Err(
                    DetectError::Config(
                        format!("magnitude threshold must be within 0..=1, got {}", self.threshold)
                    )
                );
            }
            Ok(())
        }
    }

    /// Sizes derived once per stream; every downstream buffer is built from these.
    #[derive(Clone, Debug, PartialEq)]
    pub struct ToneParams {
        pub sample_rate: u32,
        pub window_ms: u32,
        pub window_samples: usize,
        pub fft_size: usize,
        pub bin_width_hz: f64,
        pub target_bin: usize,
        pub threshold: f32,
    }

    impl ToneParams {
        pub fn derive(sample_rate: u32, settings: &DetectSettings) -> Result<Self, DetectError> {
            settings.validate()?;
            if sample_rate == 0 {
                return Err(DetectError::Config("sample rate must be positive".into()));
            }

            // truncating throughout
            let window_samples = (((sample_rate as u64) * (settings.window_ms as u64)) /
                1000) as usize;
            if window_samples < 1 {
                return Err(
                    DetectError::Config(
                        format!(
                            "{} ms at {} Hz is shorter than one sample",
                            settings.window_ms,
                            sample_rate
                        )
                    )
                );
            }

            let fft_size = window_samples.next_power_of_two();
            let bin_width_hz = (sample_rate as f64) / (fft_size as f64);
            let target_bin = ((settings.tone_hz as f64) / bin_width_hz) as usize;

            let nyquist_bin = fft_size / 2;
            if target_bin > nyquist_bin {
                return Err(
                    DetectError::Config(
                        format!(
                            "tone {} Hz maps to bin {} but {} Hz audio only resolves bins 0..={} (max {:.1} Hz)",
                            settings.tone_hz,
                            target_bin,
                            sample_rate,
                            nyquist_bin,
                            (nyquist_bin as f64) * bin_width_hz
                        )
                    )
                );
            }

            Ok(Self {
                sample_rate,
                window_ms: settings.window_ms,
                window_samples,
                fft_size,
                bin_width_hz,
                target_bin,
                threshold: settings.threshold,
            })
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ToneInterval {
        pub start_ms: u64,
        pub end_ms: u64,
    }

    impl ToneInterval {
        pub fn duration_ms(&self) -> u64 {
            self.end_ms - self.start_ms
        }
    }

    impl fmt::Display for ToneInterval {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "Tone from {}ms to {}ms.", self.start_ms, self.end_ms)
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum TrackerState {
        Idle,
        Detecting {
            start_ms: u64,
        },
    }

    /// Two-state tracker turning per-frame magnitudes into intervals.
    pub struct ToneTracker {
        threshold: f32,
        state: TrackerState,
    }

    impl ToneTracker {
        pub fn new(threshold: f32) -> Self {
            Self { threshold, state: TrackerState::Idle }
        }

        pub fn state(&self) -> TrackerState {
            self.state
        }

        /// `t_ms` is the start time of the frame the magnitude was measured on.
        pub fn observe(&mut self, magnitude: f32, t_ms: u64) -> Option<ToneInterval> {
            let detected = magnitude > self.threshold;
            match (self.state, detected) {
                (TrackerState::Idle, true) => {
                    self.state = TrackerState::Detecting { start_ms: t_ms };
                    None
                }
                (TrackerState::Detecting { start_ms }, false) => {
                    self.state = TrackerState::Idle;
                    Some(ToneInterval { start_ms, end_ms: t_ms })
                }
                _ => None,
            }
        }

        /// Closes the stream. An open interval is dropped unless `flush` is set.
        pub fn finish(&mut self, end_ms: u64, flush: bool) -> Option<ToneInterval> {
            let open = match self.state {
                TrackerState::Detecting { start_ms } if flush => {
                    Some(ToneInterval { start_ms, end_ms })
                }
                _ => None,
            };
            self.state = TrackerState::Idle;
            open
        }
    }

}

// ───────────────────────────────────────────────────────────────────────────────
// spectral: Hamming window + real FFT + target-bin magnitude
// ───────────────────────────────────────────────────────────────────────────────
pub mod spectral {
    use std::sync::Arc;
    use realfft::{ RealFftPlanner, RealToComplex };
    use rustfft::num_complex::Complex;

    use crate::error::DetectError;
    use crate::tone_presence::ToneParams;

    /// Symmetric Hamming window: 0.54 - 0.46·cos(2πn/(N-1)).
    pub fn hamming(n: usize) -> Vec<f32> {
        if n == 1 {
            return vec![1.0];
        }
        (0..n)
            .map(|i| {
                let t = (2.0 * std::f64::consts::PI * (i as f64)) / ((n - 1) as f64);
                (0.54 - 0.46 * t.cos()) as f32
            })
            .collect()
    }

    pub struct ToneAnalyzer {
        fft: Arc<dyn RealToComplex<f32>>,
        // spans the whole padded transform; only the first frame_len taps meet samples
        window: Vec<f32>,
        frame_len: usize,
        input: Vec<f32>,
        spectrum: Vec<Complex<f32>>,
        scratch: Vec<Complex<f32>>,
        fft_size: usize,
        target_bin: usize,
    }

    impl ToneAnalyzer {
        pub fn new(params: &ToneParams) -> Self {
            let mut planner = RealFftPlanner::<f32>::new();
            let fft = planner.plan_fft_forward(params.fft_size);
            let input = fft.make_input_vec();
            let spectrum = fft.make_output_vec();
            let scratch = fft.make_scratch_vec();
            Self {
                fft,
                window: hamming(params.fft_size),
                frame_len: params.window_samples,
                input,
                spectrum,
                scratch,
                fft_size: params.fft_size,
                target_bin: params.target_bin,
            }
        }

        /// |X[target_bin]| / fft_size for one frame of `window_samples` values.
        ///
        /// The frame is zero-padded to `fft_size` and the padded buffer is
        /// Hamming-weighted as a whole.
        pub fn magnitude(&mut self, frame: &[f32]) -> Result<f32, DetectError> {
            if frame.len() != self.frame_len {
                return Err(
                    DetectError::Transform(
                        format!(
                            "frame has {} samples, expected {}",
                            frame.len(),
                            self.frame_len
                        )
                    )
                );
            }

            let (head, tail) = self.input.split_at_mut(frame.len());
            for ((dst, &s), &w) in head.iter_mut().zip(frame).zip(self.window.iter()) {
                *dst = s * w;
            }
            // zero padding times any tap is zero; realfft uses the input as
            // scratch, so the padding is rewritten every frame
            tail.fill(0.0);

            self.fft
                .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)
                .map_err(|e| DetectError::Transform(e.to_string()))?;

            let bin = self.spectrum
                .get(self.target_bin)
                .ok_or_else(|| {
                    DetectError::Config(
                        format!(
                            "bin {} outside spectrum of {} bins",
                            self.target_bin,
                            self.spectrum.len()
                        )
                    )
                })?;
            Ok(bin.norm() / (self.fft_size as f32))
        }
    }

}

// ───────────────────────────────────────────────────────────────────────────────
// Decoder for WAV/MP3/MP4 (AAC)/FLAC/Vorbis using symphonia, as i16 LE PCM bytes
// ───────────────────────────────────────────────────────────────────────────────
pub mod decode {
    use std::{ fs::File, io, path::Path };
    use symphonia::core::{
        audio::SampleBuffer,
        codecs::{ Decoder, DecoderOptions },
        errors::Error,
        formats::{ FormatOptions, FormatReader },
        io::MediaSourceStream,
        meta::MetadataOptions,
        probe::Hint,
    };
    use symphonia::default::{ get_codecs, get_probe };

    use crate::error::DetectError;

    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Interleaved signed 16-bit little-endian PCM.
    pub trait PcmSource {
        fn sample_rate(&self) -> u32;
        fn channels(&self) -> usize;
        /// Decoded size when the container declares it.
        fn length_bytes(&self) -> Option<u64>;
        /// `Ok(0)` means the stream is exhausted.
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    }

    pub struct SymphoniaSource {
        format: Box<dyn FormatReader>,
        decoder: Box<dyn Decoder>,
        track_id: u32,
        sample_rate: u32,
        channels: usize,
        length_bytes: Option<u64>,
        sample_buf: Option<SampleBuffer<i16>>,
        pending: Vec<u8>,
        cursor: usize,
        finished: bool,
    }

    fn to_io(err: Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, err)
    }

    impl SymphoniaSource {
        pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DetectError> {
            let path_ref = path.as_ref();
            let open_err = |msg: String| {
                DetectError::DecodeOpen(format!("{}: {}", path_ref.display(), msg))
            };

            let file = File::open(path_ref).map_err(|e| open_err(e.to_string()))?;
            let mss = MediaSourceStream::new(Box::new(file), Default::default());

            let mut hint = Hint::new();
            if let Some(ext) = path_ref.extension().and_then(|e| e.to_str()) {
                hint.with_extension(ext);
            }

            let probed = get_probe()
                .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
                .map_err(|e| open_err(e.to_string()))?;
            let format = probed.format;

            let (track_id, codec_params) = {
                let track = format
                    .default_track()
                    .ok_or_else(|| open_err("no default audio track found".into()))?;
                (track.id, track.codec_params.clone())
            };

            let decoder = get_codecs()
                .make(&codec_params, &DecoderOptions::default())
                .map_err(|e| open_err(e.to_string()))?;

            let mut source = Self {
                format,
                decoder,
                track_id,
                sample_rate: codec_params.sample_rate.unwrap_or(0),
                channels: codec_params.channels.map(|c| c.count()).unwrap_or(0),
                length_bytes: None,
                sample_buf: None,
                pending: Vec::new(),
                cursor: 0,
                finished: false,
            };

            // decode the first packet so the real channel layout and rate are known
            source.refill().map_err(|e| open_err(e.to_string()))?;
            if source.sample_rate == 0 {
                return Err(open_err("unknown sample rate".into()));
            }
            source.channels = source.channels.max(1);
            source.length_bytes = codec_params.n_frames.map(|n| {
                n * (source.channels as u64) * (BYTES_PER_SAMPLE as u64)
            });

            Ok(source)
        }

        /// Decodes packets until one yields audio for our track; false at end of stream.
        fn refill(&mut self) -> io::Result<bool> {
            loop {
                let packet = match self.format.next_packet() {
                    Ok(packet) => packet,
                    Err(Error::ResetRequired) => {
                        self.decoder.reset();
                        continue;
                    }
                    Err(Error::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        self.finished = true;
                        return Ok(false);
                    }
                    Err(err) => {
                        return Err(to_io(err));
                    }
                };

                if packet.track_id() != self.track_id {
                    continue;
                }

                let decoded = match self.decoder.decode(&packet) {
                    Ok(decoded) => decoded,
                    Err(Error::DecodeError(_)) => {
                        continue;
                    }
                    Err(err) => {
                        return Err(to_io(err));
                    }
                };

                let spec = *decoded.spec();
                if self.channels == 0 {
                    self.channels = spec.channels.count();
                }
                if self.sample_rate == 0 {
                    self.sample_rate = spec.rate;
                }

                if
                    self.sample_buf
                        .as_ref()
                        .map(|b| b.capacity() < decoded.capacity())
                        .unwrap_or(true)
                {
                    self.sample_buf = None;
                }
                let buf = self.sample_buf.get_or_insert_with(|| {
                    SampleBuffer::<i16>::new(decoded.capacity() as u64, spec)
                });

                buf.copy_interleaved_ref(decoded);

                self.pending.clear();
                self.cursor = 0;
                for s in buf.samples() {
                    self.pending.extend_from_slice(&s.to_le_bytes());
                }
                if !self.pending.is_empty() {
                    return Ok(true);
                }
            }
        }
    }

    impl PcmSource for SymphoniaSource {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn channels(&self) -> usize {
            self.channels
        }

        fn length_bytes(&self) -> Option<u64> {
            self.length_bytes
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor >= self.pending.len() {
                if self.finished || !self.refill()? {
                    return Ok(0);
                }
            }
            let n = buf.len().min(self.pending.len() - self.cursor);
            buf[..n].copy_from_slice(&self.pending[self.cursor..self.cursor + n]);
            self.cursor += n;
            Ok(n)
        }
    }

}

// ───────────────────────────────────────────────────────────────────────────────
// frames: fixed-size first-channel frames from a PcmSource
// ───────────────────────────────────────────────────────────────────────────────
pub mod frames {
    use std::io;

    use crate::decode::{ PcmSource, BYTES_PER_SAMPLE };
    use crate::error::DetectError;

    pub struct FrameReader<S> {
        source: S,
        raw: Vec<u8>,
        stride: usize,
        bytes_read: u64,
    }

    impl<S: PcmSource> FrameReader<S> {
        pub fn new(source: S, window_samples: usize) -> Self {
            let stride = source.channels().max(1) * BYTES_PER_SAMPLE;
            Self {
                source,
                raw: vec![0u8; window_samples * stride],
                stride,
                bytes_read: 0,
            }
        }

        /// Decoded PCM bytes pulled from the source so far, partial tail included.
        pub fn bytes_read(&self) -> u64 {
            self.bytes_read
        }

        /// Fills `frame` with the next window; `Ok(false)` once the stream
        /// cannot supply a whole one (the partial tail is discarded).
        pub fn next_frame(&mut self, frame: &mut [f32]) -> Result<bool, DetectError> {
            let mut filled = 0;
            while filled < self.raw.len() {
                match self.source.read(&mut self.raw[filled..]) {
                    Ok(0) => {
                        return Ok(false);
                    }
                    Ok(n) => {
                        filled += n;
                        self.bytes_read += n as u64;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                        continue;
                    }
                    Err(e) => {
                        return Err(DetectError::StreamRead(e.to_string()));
                    }
                }
            }

            // first channel only
            for (dst, sample) in frame.iter_mut().zip(self.raw.chunks_exact(self.stride)) {
                *dst = (i16::from_le_bytes([sample[0], sample[1]]) as f32) / 32768.0;
            }
            Ok(true)
        }
    }

}


// ───────────────────────────────────────────────────────────────────────────────
// CLI config + parsing
// ───────────────────────────────────────────────────────────────────────────────
#[derive(Clone, Debug)]
pub struct Config {
    pub tone_hz: i64,
    pub inputs: Vec<String>,

    pub window_ms: u32,
    pub threshold: f32,
    pub flush_on_end: bool,
    pub jobs: usize,

    // empty => logging disabled
    pub log_path: String,
    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tone_hz: 0,
            inputs: Vec::new(),
            window_ms: tone_presence::WINDOW_MS,
            threshold: tone_presence::MAGNITUDE_THRESHOLD,
            flush_on_end: false,
            jobs: std::thread
                ::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            log_path: String::new(),
            log_level: LogLevel::Info,
        }
    }
}

impl Config {
    pub fn detect_settings(&self) -> tone_presence::DetectSettings {
        tone_presence::DetectSettings {
            tone_hz: self.tone_hz,
            window_ms: self.window_ms,
            threshold: self.threshold,
            flush_on_end: self.flush_on_end,
        }
    }
}

fn print_usage(program: &str, cfg: &Config) {
    println!("Usage: {} [OPTIONS] <tone frequency> <audio file> [<audio file>...]\n", program);
    println!("Reports the time ranges where <tone frequency> (integer Hz) is present.");
    println!("Several files are analyzed in parallel and reported in the order given.\n");
    println!("Options:");
    println!(
        "  --window-ms <MS>              Analysis window length (default: {})",
        cfg.window_ms
    );
    println!(
        "  --threshold <FRAC>            Normalized magnitude a tone must exceed [0..1] (default: {:.2})",
        cfg.threshold
    );
    println!(
        "  --flush-on-end                Report a tone still sounding when the stream ends"
    );
    println!(
        "  -j, --jobs <N>                Files analyzed concurrently (default: {})",
        cfg.jobs
    );
    println!("  --log-path <PATH>             Append a log to PATH (default: no log)");
    println!(
        "  --log-level <LEVEL>           Log level: debug, info, warning, error (default: info)"
    );
    println!("  -h, --help                    Show this help");
    println!("\nExamples:");
    println!("  {} 1000 recording.mp3", program);
    println!("  {} --flush-on-end --threshold 0.1 440 a.wav b.flac", program);
}

/// `Ok(None)` means print usage and exit successfully.
fn parse_arguments(args: &[String]) -> std::result::Result<Option<Config>, String> {
    let mut config = Config::default();
    let mut positionals: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                return Ok(None);
            }
            "--window-ms" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --window-ms".to_string());
                }
                let v: u32 = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid window-ms value".to_string())?;
                config.window_ms = v;
                i += 2;
            }
            "--threshold" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --threshold".to_string());
                }
                config.threshold = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid threshold value".to_string())?;
                i += 2;
            }
            "--flush-on-end" => {
                config.flush_on_end = true;
                i += 1;
            }
            "-j" | "--jobs" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --jobs".to_string());
                }
                let v: usize = args[i + 1].parse().map_err(|_| "Invalid jobs value".to_string())?;
                config.jobs = v.max(1);
                i += 2;
            }
            "--log-path" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --log-path".to_string());
                }
                config.log_path = args[i + 1].to_string();
                i += 2;
            }
            "--log-level" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --log-level".to_string());
                }
                config.log_level = LogLevel::parse(&args[i + 1]).ok_or_else(|| {
                    format!(
                        "Invalid log level: {}. Valid options: debug, info, warning, error",
                        args[i + 1]
                    )
                })?;
                i += 2;
            }
            other if other.starts_with("--") => {
                return Err(format!("Unknown option: {}", other));
            }
            _ => {
                positionals.push(args[i].to_string());
                i += 1;
            }
        }
    }

    let mut positionals = positionals.into_iter();
    let freq = positionals.next().ok_or_else(|| "Missing <tone frequency>".to_string())?;
    config.tone_hz = match freq.parse::<i64>() {
        Ok(v) => v,
        Err(_) => {
            return Ok(None);
        }
    };
    config.inputs = positionals.collect();
    if config.inputs.is_empty() {
        return Err("Missing <audio file>".to_string());
    }

    Ok(Some(config))
}

// ───────────────────────────────────────────────────────────────────────────────
// main
// ───────────────────────────────────────────────────────────────────────────────
fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("tone-detect").to_string();

    let cli = match parse_arguments(&args) {
        Ok(Some(c)) => c,
        Ok(None) => {
            print_usage(&program, &Config::default());
            return Ok(());
        }
        Err(e) => {
            eprintln!("error: {}\n", e);
            print_usage(&program, &Config::default());
            std::process::exit(1);
        }
    };

    let logger = Arc::new(if cli.log_path.is_empty() {
        Logger::disabled()
    } else {
        Logger::new_with_level(&cli.log_path, true, cli.log_level)?
    });

    // ctrl+c stops at the next frame; intervals found so far are still reported
    let quit = Arc::new(AtomicBool::new(false));
    {
        let q = quit.clone();
        let _ = ctrlc::set_handler(move || {
            q.store(true, Ordering::SeqCst);
        });
    }

    if cli.inputs.len() == 1 {
        mods::detect::run_detect(&cli, logger, &quit)
    } else {
        mods::batch::run_batch(&cli, logger, quit)
    }
}
