//! Engine configuration
//!
//! All parameters a session is fixed to: sample rate, period size, device
//! routing, polyphony management, and per-voice processing options.

use serde::{Deserialize, Serialize};

use crate::{EngineError, EngineResult, MAX_FRAME_SIZE};

/// Scale factor marking an audio group as not routed to a channel (dB)
pub const MUTE_VOLUME: f64 = -121.0;

/// Resampler interpolation quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InterpolationType {
    #[default]
    Linear,
    Polyphase,
}

/// Per-output reverb parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReverbConfig {
    pub enabled: bool,
    /// Pre-delay before the wet signal (ms)
    pub predelay_ms: f64,
    /// Tail feedback amount (0.0 - 1.0)
    pub decay: f64,
    /// Wet level mixed onto the dry signal (0.0 - 1.0)
    pub wet: f64,
}

impl Default for ReverbConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            predelay_ms: 20.0,
            decay: 0.5,
            wet: 0.25,
        }
    }
}

/// Contribution of one audio group to one device channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMix {
    /// Audio group name (must match an entry in `SoundConfig::audio_groups`)
    pub group: String,
    /// Level of the group's left channel (dB)
    pub left_db: f64,
    /// Level of the group's right channel (dB)
    pub right_db: f64,
}

/// Configuration for one audio output device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioDeviceConfig {
    /// Device name (None = default device)
    pub name: Option<String>,
    /// Number of output channels
    pub channels: usize,
    /// Desired driver latency (ms)
    pub latency_ms: u32,
    /// Per-channel list of group contributions
    pub channel_outputs: Vec<Vec<GroupMix>>,
}

impl AudioDeviceConfig {
    /// Stereo device playing every audio group directly (group L to
    /// channel 0, group R to channel 1).
    pub fn default_stereo(audio_groups: &[String]) -> Self {
        let left = audio_groups
            .iter()
            .map(|g| GroupMix {
                group: g.clone(),
                left_db: 0.0,
                right_db: MUTE_VOLUME,
            })
            .collect();
        let right = audio_groups
            .iter()
            .map(|g| GroupMix {
                group: g.clone(),
                left_db: MUTE_VOLUME,
                right_db: 0.0,
            })
            .collect();
        Self {
            name: None,
            channels: 2,
            latency_ms: 50,
            channel_outputs: vec![left, right],
        }
    }
}

/// Engine-facing routing for one output device: a dB scale factor per
/// `(channel, group-side)` pair, `MUTE_VOLUME` where unrouted.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioOutputLayout {
    pub channels: usize,
    /// `scale_factors_db[channel][group * 2 + side]`, side 0 = L, 1 = R
    pub scale_factors_db: Vec<Vec<f64>>,
}

impl AudioOutputLayout {
    /// Flattened linear gain matrix, indexed
    /// `channel * n_groups * 2 + group * 2 + side`.
    ///
    /// Values outside (-120, +40) dB map to 0 (muted).
    pub fn linear_factors(&self, n_groups: usize) -> Vec<f64> {
        let width = n_groups * 2;
        let mut factors = vec![0.0; self.channels * width];

        for (channel, row) in self.scale_factors_db.iter().enumerate() {
            for (k, &db) in row.iter().enumerate().take(width) {
                if db >= -120.0 && db < 40.0 {
                    factors[channel * width + k] = 10.0_f64.powf(db * 0.05);
                }
            }
        }
        factors
    }
}

/// Full session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoundConfig {
    pub sample_rate: u32,
    pub samples_per_buffer: usize,
    /// Number of auxiliary worker threads
    pub concurrency: usize,
    pub audio_groups: Vec<String>,
    pub devices: Vec<AudioDeviceConfig>,
    pub polyphony_limit: usize,
    pub manage_polyphony: bool,
    /// How many times the release task is re-entered per period
    pub release_concurrency: usize,
    pub scale_release: bool,
    pub randomize_speaking: bool,
    pub release_alignment: bool,
    pub interpolation: InterpolationType,
    pub reverb: ReverbConfig,
    pub record_downmix: bool,
    /// Recorder sample width (2, 3 or 4 bytes)
    pub wave_format_bytes_per_sample: u8,
    /// Master gain (dB), converted to a linear amplitude at voice start
    pub volume_db: i32,
}

impl Default for SoundConfig {
    fn default() -> Self {
        let audio_groups = vec!["Main".to_string()];
        let devices = vec![AudioDeviceConfig::default_stereo(&audio_groups)];
        Self {
            sample_rate: 44100,
            samples_per_buffer: 512,
            concurrency: 0,
            audio_groups,
            devices,
            polyphony_limit: 2048,
            manage_polyphony: true,
            release_concurrency: 1,
            scale_release: true,
            randomize_speaking: true,
            release_alignment: true,
            interpolation: InterpolationType::Linear,
            reverb: ReverbConfig::default(),
            record_downmix: false,
            wave_format_bytes_per_sample: 4,
            volume_db: -15,
        }
    }
}

impl SoundConfig {
    /// Validate the parameters the engine cannot repair.
    pub fn validate(&self) -> EngineResult<()> {
        if self.samples_per_buffer == 0 || self.samples_per_buffer > MAX_FRAME_SIZE {
            return Err(EngineError::BufferTooLarge(
                self.samples_per_buffer,
                MAX_FRAME_SIZE,
            ));
        }
        if self.sample_rate == 0 {
            return Err(EngineError::InvalidConfig("sample rate is 0".into()));
        }
        if self.devices.is_empty() {
            return Err(EngineError::InvalidConfig(
                "at least one output device is required".into(),
            ));
        }
        if self.polyphony_limit == 0 {
            return Err(EngineError::InvalidConfig("polyphony limit is 0".into()));
        }
        if !matches!(self.wave_format_bytes_per_sample, 2 | 3 | 4) {
            return Err(EngineError::InvalidConfig(format!(
                "unsupported recorder sample width: {} bytes",
                self.wave_format_bytes_per_sample
            )));
        }
        for device in &self.devices {
            if device.channels == 0 {
                return Err(EngineError::InvalidConfig(
                    "device with 0 channels".into(),
                ));
            }
        }
        Ok(())
    }

    /// Number of configured audio groups (at least 1).
    pub fn audio_group_count(&self) -> usize {
        self.audio_groups.len().max(1)
    }

    /// Index of a named audio group.
    pub fn audio_group_id(&self, name: &str) -> EngineResult<usize> {
        self.audio_groups
            .iter()
            .position(|g| g == name)
            .ok_or_else(|| EngineError::UnknownAudioGroup(name.to_string()))
    }

    /// Build the engine-facing routing for every configured device.
    ///
    /// Groups referenced by a device but absent from `audio_groups` are
    /// left muted.
    pub fn output_layouts(&self) -> Vec<AudioOutputLayout> {
        let n_groups = self.audio_group_count();

        self.devices
            .iter()
            .map(|device| {
                let mut layout = AudioOutputLayout {
                    channels: device.channels,
                    scale_factors_db: vec![vec![MUTE_VOLUME; n_groups * 2]; device.channels],
                };

                for (channel, outputs) in device.channel_outputs.iter().enumerate() {
                    if channel >= device.channels {
                        break;
                    }
                    for mix in outputs {
                        if let Some(id) = self.audio_groups.iter().position(|g| g == &mix.group) {
                            layout.scale_factors_db[channel][id * 2] = mix.left_db;
                            layout.scale_factors_db[channel][id * 2 + 1] = mix.right_db;
                        }
                    }
                }
                layout
            })
            .collect()
    }
}

/// The single-stereo-device routing used when no device is configured.
pub fn default_output_layouts(n_audio_groups: usize) -> Vec<AudioOutputLayout> {
    let n_groups = n_audio_groups.max(1);
    let mut layout = AudioOutputLayout {
        channels: 2,
        scale_factors_db: vec![vec![MUTE_VOLUME; n_groups * 2]; 2],
    };

    for group in 0..n_groups {
        layout.scale_factors_db[0][group * 2] = 0.0;
        layout.scale_factors_db[1][group * 2 + 1] = 0.0;
    }
    vec![layout]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SoundConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.audio_group_count(), 1);
        assert_eq!(config.audio_group_id("Main").unwrap(), 0);
        assert!(config.audio_group_id("Swell").is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_buffer() {
        let config = SoundConfig {
            samples_per_buffer: MAX_FRAME_SIZE + 1,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::BufferTooLarge(_, _))
        ));
    }

    #[test]
    fn test_default_output_layout_routing() {
        let layouts = default_output_layouts(2);
        assert_eq!(layouts.len(), 1);

        let layout = &layouts[0];
        assert_eq!(layout.channels, 2);
        // Group L feeds channel 0, group R feeds channel 1, rest muted.
        assert_eq!(layout.scale_factors_db[0][0], 0.0);
        assert_eq!(layout.scale_factors_db[0][1], MUTE_VOLUME);
        assert_eq!(layout.scale_factors_db[1][2], MUTE_VOLUME);
        assert_eq!(layout.scale_factors_db[1][3], 0.0);
    }

    #[test]
    fn test_linear_factors_conversion() {
        let layouts = default_output_layouts(1);
        let factors = layouts[0].linear_factors(1);

        assert_eq!(factors.len(), 4);
        assert!((factors[0] - 1.0).abs() < 1e-12); // 0 dB
        assert_eq!(factors[1], 0.0); // muted
        assert_eq!(factors[2], 0.0);
        assert!((factors[3] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_group_left_muted() {
        let mut config = SoundConfig::default();
        config.devices[0].channel_outputs[0].push(GroupMix {
            group: "NoSuchGroup".into(),
            left_db: 0.0,
            right_db: 0.0,
        });

        let layouts = config.output_layouts();
        // Only the original "Main" routing survives.
        assert_eq!(layouts[0].scale_factors_db[0], vec![0.0, MUTE_VOLUME]);
    }
}
