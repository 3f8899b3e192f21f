//! FFmpeg worker launcher.

use tokio::process::Command;

use super::{WorkerLauncher, WorkerRequest};
use crate::config::WorkerConfig;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Launches ffmpeg with stream copy and machine-readable progress on stdout.
pub struct FfmpegLauncher {
    config: WorkerConfig,
    /// Cached version banner, probed once at construction.
    version: Option<String>,
}

impl FfmpegLauncher {
    /// Create a launcher with default configuration.
    pub fn new() -> Self {
        Self::with_config(WorkerConfig::default())
    }

    /// Create with a custom configuration.
    pub fn with_config(config: WorkerConfig) -> Self {
        let version = Self::detect_version(&config.binary_path);

        Self { config, version }
    }

    /// Detect the ffmpeg version.
    fn detect_version(path: &str) -> Option<String> {
        std::process::Command::new(path)
            .arg("-version")
            .output()
            .ok()
            .and_then(|output| {
                String::from_utf8(output.stdout)
                    .ok()
                    .and_then(|s| s.lines().next().map(|l| l.to_string()))
            })
    }

    /// Build the ffmpeg argument list for one request.
    fn build_args(&self, request: &WorkerRequest) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "warning".to_string(),
        ];

        args.extend(self.config.input_args.iter().cloned());

        if let Some(ref ua) = self.config.user_agent {
            args.extend(["-user_agent".to_string(), ua.clone()]);
        }

        for (key, value) in &self.config.headers {
            args.extend(["-headers".to_string(), format!("{}: {}", key, value)]);
        }

        args.extend(["-i".to_string(), request.url.clone()]);

        // Copy streams without re-encoding
        args.extend(["-c".to_string(), "copy".to_string()]);

        // HLS audio comes as ADTS; remuxing into mp4 needs the bitstream
        // filter or the output is unplayable.
        if request
            .file_name
            .rsplit('.')
            .next()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mp4") || ext.eq_ignore_ascii_case("m4a"))
        {
            args.extend(["-bsf:a".to_string(), "aac_adtstoasc".to_string()]);
        }

        args.extend(self.config.output_args.iter().cloned());

        // Progress protocol on stdout, human log spam off.
        args.extend([
            "-progress".to_string(),
            "pipe:1".to_string(),
            "-nostats".to_string(),
        ]);

        args.push(request.output_path().to_string_lossy().to_string());

        args
    }
}

impl Default for FfmpegLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerLauncher for FfmpegLauncher {
    fn command(&self, request: &WorkerRequest) -> Command {
        let mut command = Command::new(&self.config.binary_path);
        command
            .args(self.build_args(request))
            .env("LC_ALL", "C"); // Force consistent output

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            command.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }

        command
    }

    fn is_available(&self) -> bool {
        self.version.is_some()
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }
}
