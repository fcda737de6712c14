//! Sound system scenarios: multi-device rendezvous, attach/detach drain
//!
//! Periods are driven through `PortHandle`s instead of platform drivers,
//! from as many threads as the scenario needs.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pf_audio::{AudioError, AudioResult, LoopbackPort, SoundPort, SoundSystem};
use pf_core::{default_output_layouts, AudioDeviceConfig, Sample, SoundConfig};
use pf_engine::OrganEngine;
use pf_model::{
    AudioSection, MemorySoundProvider, NullRecorderSink, NullSampleStore, SampleStore,
    SimpleOrganModel, SoundProvider,
};

const SAMPLE_RATE: u32 = 32000;
const FRAMES: usize = 128;

fn two_device_config() -> SoundConfig {
    let mut config = SoundConfig {
        sample_rate: SAMPLE_RATE,
        samples_per_buffer: FRAMES,
        ..Default::default()
    };
    config.devices = vec![
        AudioDeviceConfig::default_stereo(&config.audio_groups),
        AudioDeviceConfig::default_stereo(&config.audio_groups),
    ];
    config
}

fn one_device_config() -> SoundConfig {
    SoundConfig {
        sample_rate: SAMPLE_RATE,
        samples_per_buffer: FRAMES,
        ..Default::default()
    }
}

fn build_engine(n_outputs: usize) -> Arc<OrganEngine> {
    let store: Arc<dyn SampleStore> = Arc::new(NullSampleStore);
    let mut engine = OrganEngine::new(Arc::new(SimpleOrganModel::single_windchest()), store);
    engine.set_volume(0);
    engine.set_randomize_speaking(false);

    let mut layouts = default_output_layouts(1);
    while layouts.len() < n_outputs {
        layouts.push(layouts[0].clone());
    }
    engine.build_and_start(&layouts, FRAMES, SAMPLE_RATE, Arc::new(NullRecorderSink));
    Arc::new(engine)
}

fn open_system(config: SoundConfig) -> SoundSystem {
    let mut system = SoundSystem::new(config, Arc::new(NullRecorderSink));
    system
        .open(&mut |params, handle| {
            Ok(Box::new(LoopbackPort::new(
                format!("loopback-{}", params.index),
                params,
                handle,
            )) as Box<dyn SoundPort>)
        })
        .expect("open sound system");
    system
}

fn sustained_pipe(value: Sample) -> Arc<dyn SoundProvider> {
    let frames = FRAMES;
    Arc::new(
        MemorySoundProvider::new(SAMPLE_RATE as Sample).with_attack(
            AudioSection::new(vec![value; frames * 2], 2, SAMPLE_RATE).with_loop(0, frames),
        ),
    )
}

#[test]
fn test_single_device_periods_advance() {
    let engine = build_engine(1);
    let system = open_system(one_device_config());
    system.attach_engine(Arc::clone(&engine));

    let handle = system.port_handle(0).unwrap();
    let mut out = vec![0.0; FRAMES * 2];
    for period in 1..=3u64 {
        assert!(handle.render(&mut out));
        assert_eq!(engine.time(), 1 + period * FRAMES as u64);
    }

    system.detach_engine();
    engine.stop_and_destroy();
}

#[test]
fn test_two_devices_advance_once_per_period() {
    let engine = build_engine(2);
    let system = open_system(two_device_config());
    system.attach_engine(Arc::clone(&engine));

    let handle0 = system.port_handle(0).unwrap();
    let handle1 = system.port_handle(1).unwrap();

    // First device alone does not advance the period.
    let mut out = vec![0.0; FRAMES * 2];
    handle0.render(&mut out);
    assert_eq!(engine.time(), 1);

    // The second arrival completes the rendezvous: exactly one buffer
    // of advance, not two.
    handle1.render(&mut out);
    assert_eq!(engine.time(), 1 + FRAMES as u64);

    system.detach_engine();
    engine.stop_and_destroy();
}

#[test]
fn test_two_devices_concurrent_callbacks() {
    let engine = build_engine(2);
    let system = open_system(two_device_config());
    system.attach_engine(Arc::clone(&engine));

    let provider = sustained_pipe(0.5);
    engine.start_pipe_sample(&provider, 1, 0, 64, 0, 0, false);

    const PERIODS: usize = 16;
    let mut threads = Vec::new();
    for device in 0..2 {
        let handle = system.port_handle(device).unwrap();
        threads.push(thread::spawn(move || {
            let mut out = vec![0.0; FRAMES * 2];
            for _ in 0..PERIODS {
                handle.render(&mut out);
            }
            out
        }));
    }
    let outputs: Vec<Vec<Sample>> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    // Both devices ran all periods and the clock advanced exactly once
    // per period.
    assert_eq!(engine.time(), 1 + (PERIODS * FRAMES) as u64);
    for out in &outputs {
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-9));
    }

    system.detach_engine();
    engine.stop_and_destroy();
}

#[test]
fn test_second_callback_blocks_until_rendezvous() {
    let engine = build_engine(2);
    let system = open_system(two_device_config());
    system.attach_engine(Arc::clone(&engine));

    let handle0 = system.port_handle(0).unwrap();
    let handle1 = system.port_handle(1).unwrap();

    // Device 0 runs two periods back to back; the second must block on
    // its gate until device 1 delivers period 1.
    let blocked = thread::spawn(move || {
        let mut out = vec![0.0; FRAMES * 2];
        handle0.render(&mut out);
        handle0.render(&mut out);
    });

    thread::sleep(Duration::from_millis(50));
    assert!(!blocked.is_finished());
    assert_eq!(engine.time(), 1);

    let mut out = vec![0.0; FRAMES * 2];
    handle1.render(&mut out); // completes period 1, frees device 0
    handle1.render(&mut out); // completes period 2
    blocked.join().unwrap();

    assert_eq!(engine.time(), 1 + 2 * FRAMES as u64);

    system.detach_engine();
    engine.stop_and_destroy();
}

#[test]
fn test_detach_engine_produces_silence() {
    let engine = build_engine(1);
    let system = open_system(one_device_config());
    system.attach_engine(Arc::clone(&engine));

    let provider = sustained_pipe(0.5);
    engine.start_pipe_sample(&provider, 1, 0, 64, 0, 0, false);

    let handle = system.port_handle(0).unwrap();
    let mut out = vec![0.0; FRAMES * 2];
    handle.render(&mut out);
    assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-9));
    let time_before = engine.time();

    system.detach_engine();
    assert!(engine.is_working());
    assert!(!engine.is_used());

    // A late callback renders silence and leaves the engine untouched.
    let mut late = vec![1.0; FRAMES * 2];
    assert!(handle.render(&mut late));
    assert!(late.iter().all(|&s| s == 0.0));
    assert_eq!(engine.time(), time_before);

    engine.stop_and_destroy();
}

#[test]
fn test_detach_drains_inflight_callbacks() {
    let engine = build_engine(1);
    let system = open_system(one_device_config());
    system.attach_engine(Arc::clone(&engine));

    let provider = sustained_pipe(0.3);
    engine.start_pipe_sample(&provider, 1, 0, 64, 0, 0, false);

    // Hammer callbacks from another thread while detaching.
    let handle = system.port_handle(0).unwrap();
    let pump = thread::spawn(move || {
        let mut out = vec![0.0; FRAMES * 2];
        for _ in 0..200 {
            handle.render(&mut out);
        }
    });

    thread::sleep(Duration::from_millis(5));
    system.detach_engine();

    // Once detach returned, the engine may be torn down safely even
    // though the pump keeps calling.
    engine.stop_and_destroy();
    pump.join().unwrap();
}

#[test]
fn test_open_failure_reports_error() {
    let mut system = SoundSystem::new(one_device_config(), Arc::new(NullRecorderSink));
    let result: AudioResult<()> = system.open(&mut |_params, _handle| {
        Err(AudioError::DeviceNotFound("missing-device".into()))
    });

    assert!(matches!(result, Err(AudioError::DeviceNotFound(_))));
    assert!(!system.is_open());
    assert!(system.last_error().unwrap().contains("missing-device"));
}

#[test]
fn test_buffer_size_mismatch_renders_silence() {
    let engine = build_engine(1);
    let system = open_system(one_device_config());
    system.attach_engine(Arc::clone(&engine));

    let provider = sustained_pipe(0.5);
    engine.start_pipe_sample(&provider, 1, 0, 64, 0, 0, false);

    // Driver hands us the wrong period size: silence, no engine step.
    let handle = system.port_handle(0).unwrap();
    let mut wrong = vec![1.0; (FRAMES / 2) * 2];
    assert!(handle.render(&mut wrong));
    assert!(wrong.iter().all(|&s| s == 0.0));
    assert_eq!(engine.time(), 1);

    // A correctly sized callback recovers.
    let mut out = vec![0.0; FRAMES * 2];
    handle.render(&mut out);
    assert_eq!(engine.time(), 1 + FRAMES as u64);

    system.detach_engine();
    engine.stop_and_destroy();
}

#[test]
fn test_close_is_idempotent() {
    let mut system = open_system(one_device_config());
    assert!(system.is_open());
    system.close();
    assert!(!system.is_open());
    system.close();
}
