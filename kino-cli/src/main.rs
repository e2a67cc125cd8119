//! # Kino
//!
//! Command line front end over the reference backend.
//!
//! ```text
//! kino probe <file>
//! kino play <file>
//! kino transcode <input> <output> [encode.json]
//! kino preview <file> [count]
//! kino generate <output> [seconds]
//! ```
//!
//! `--config <engine.json>` may precede the command.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use kino_core::media::{AudioFormat, ChannelLayout, PixelFormat, Rational, SampleFormat, VideoFormat};
use kino_core::raw::{generate, SynthAudio, SynthSpec, SynthVideo};
use kino_core::transcode::TranscodeNotification;
use kino_core::{EncodeContext, EngineConfig, MediaState, Notification, Player, RawLibrary, Transcoder};

const USAGE: &str = "usage: kino [--config <engine.json>] <probe|play|transcode|preview|generate> <args...>";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "kino=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args
                .get(i + 1)
                .cloned()
                .context("missing value for --config")?;
            args.drain(i..=i + 1);
            EngineConfig::from_json_file(Path::new(&path))
                .with_context(|| format!("loading config {}", path))?
        }
        None => EngineConfig::default(),
    };

    let Some((command, rest)) = args.split_first() else {
        bail!(USAGE);
    };
    tracing::debug!("Kino v{}", kino_core::VERSION);

    match (command.as_str(), rest) {
        ("probe", [input]) => probe(config, Path::new(input)),
        ("play", [input]) => play(config, Path::new(input)),
        ("transcode", [input, output]) => transcode(config, Path::new(input), Path::new(output), None),
        ("transcode", [input, output, encode]) => {
            transcode(config, Path::new(input), Path::new(output), Some(Path::new(encode)))
        }
        ("preview", [input]) => {
            let count = config.transcode.preview_count;
            preview(config, Path::new(input), count)
        }
        ("preview", [input, count]) => {
            let count = count.parse().with_context(|| format!("bad preview count '{}'", count))?;
            preview(config, Path::new(input), count)
        }
        ("generate", [output]) => synth(Path::new(output), 5.0),
        ("generate", [output, seconds]) => {
            let seconds = seconds.parse().with_context(|| format!("bad duration '{}'", seconds))?;
            synth(Path::new(output), seconds)
        }
        _ => bail!(USAGE),
    }
}

fn probe(config: EngineConfig, input: &Path) -> Result<()> {
    let transcoder = Transcoder::new(config, Arc::new(RawLibrary::default()))?;
    let info = transcoder
        .parse_input(input)?
        .recv()
        .context("input parser went away")?
        .with_context(|| format!("probing {}", input.display()))?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn play(config: EngineConfig, input: &Path) -> Result<()> {
    let mut player = Player::new(config, Arc::new(RawLibrary::default()))?;
    let notifications = player.notifications();
    let info = player.open(input).with_context(|| format!("opening {}", input.display()))?;
    tracing::info!("Playing {} ({:.1}s)", input.display(), info.duration_us as f64 / 1e6);

    let idle = Duration::from_secs(5);
    loop {
        match notifications.recv_timeout(idle) {
            Ok(Notification::MediaState(MediaState::EndOfMedia)) => break,
            Ok(Notification::Error(message)) => tracing::warn!("{}", message),
            Ok(_) => {}
            Err(_) if player.state() == MediaState::Playing => {}
            Err(_) => bail!("playback stalled in state {:?}", player.state()),
        }
    }
    player.stop();
    Ok(())
}

fn transcode(config: EngineConfig, input: &Path, output: &Path, encode: Option<&Path>) -> Result<()> {
    let encode: EncodeContext = match encode {
        Some(path) => {
            let json = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))?
        }
        None => EncodeContext::default(),
    };

    let mut transcoder = Transcoder::new(config, Arc::new(RawLibrary::default()))?;
    let notifications = transcoder.notifications();
    let progress = std::thread::spawn(move || {
        for notification in notifications.iter() {
            match notification {
                TranscodeNotification::Progress(stats) => {
                    tracing::info!("{:5.1}% {:.1} fps", stats.progress(), stats.fps);
                }
                TranscodeNotification::Error(message) => tracing::warn!("{}", message),
                _ => {}
            }
        }
    });

    let report = transcoder
        .transcode(input, output, encode)
        .with_context(|| format!("transcoding {} -> {}", input.display(), output.display()))?;
    drop(transcoder);
    let _ = progress.join();

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn preview(config: EngineConfig, input: &Path, count: usize) -> Result<()> {
    let transcoder = Transcoder::new(config, Arc::new(RawLibrary::default()))?;
    let previews = transcoder
        .preview(input, count)
        .recv()
        .context("preview worker went away")?
        .with_context(|| format!("previewing {}", input.display()))?;

    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("preview");
    let dir = input.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    for preview in &previews {
        let path = dir.join(format!("{}-{:02}.raw", stem, preview.index));
        std::fs::write(&path, &preview.data).with_context(|| format!("writing {}", path.display()))?;
        println!(
            "{} {}x{} {:?} at {:.3}s{}",
            path.display(),
            preview.format.width,
            preview.format.height,
            preview.format.pixel_format,
            preview.pts_us as f64 / 1e6,
            if preview.substituted { " (repeated)" } else { "" }
        );
    }
    Ok(())
}

fn synth(output: &Path, seconds: f64) -> Result<()> {
    if seconds.is_nan() || seconds <= 0.0 {
        bail!("duration must be positive");
    }
    let spec = SynthSpec {
        duration_us: (seconds * 1e6) as i64,
        video: Some(SynthVideo {
            format: VideoFormat::new(PixelFormat::Rgb24, 64, 36),
            frame_rate: Rational::new(25, 1),
            gop: 25,
        }),
        audio: vec![SynthAudio {
            format: AudioFormat::new(SampleFormat::S16, ChannelLayout::Stereo, 48_000),
            samples_per_packet: 1024,
        }],
        subtitles: vec![(500_000, 2_000_000, "Kino test pattern".into())],
        title: Some("Kino test pattern".into()),
    };
    let counts = generate(output, &spec).with_context(|| format!("writing {}", output.display()))?;
    tracing::info!("Wrote {} ({:?} packets per stream)", output.display(), counts);
    Ok(())
}
