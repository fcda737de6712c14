//! The sound system: N-device rendezvous and engine attachment
//!
//! Every device callback of a period must produce its slice from the
//! same engine period. Each device owns a gate (mutex + condition); a
//! callback that arrives again before the period is complete blocks on
//! its gate. The last callback to deliver its slice advances the engine,
//! wakes the worker pool, and releases all gates in index order.
//!
//! Attach/detach is drained: `detach_engine` returns only after every
//! in-flight callback has left the engine, after which late callbacks
//! render silence.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use pf_core::{Sample, SoundConfig, MAX_FRAME_SIZE};
use pf_engine::OrganEngine;
use pf_model::RecorderSink;

use crate::{AudioError, AudioResult, PortParams, SoundPort};

/// Publish the meter roughly 14x per second (samples between updates)
const METER_PUBLISH_SAMPLES: usize = 6144;

#[derive(Debug, Default)]
struct GateState {
    /// Device already delivered its slice for the running period
    wait: bool,
    /// Gate is armed (system open); cleared on close to free blockers
    waiting: bool,
}

#[derive(Debug, Default)]
struct DeviceGate {
    state: Mutex<GateState>,
    condvar: Condvar,
}

struct SystemInner {
    sample_rate: u32,
    samples_per_buffer: usize,
    device_channels: Vec<usize>,
    gates: Vec<DeviceGate>,
    engine: RwLock<Option<Arc<OrganEngine>>>,
    running: AtomicBool,
    calc_count: AtomicUsize,
    wait_count: AtomicUsize,
    /// Callbacks that entered but have not yet exited
    callbacks_entered: AtomicUsize,
    drain_lock: Mutex<()>,
    drain_condvar: Condvar,
    meter_counter: AtomicUsize,
    meter: Mutex<Vec<f64>>,
}

impl SystemInner {
    /// One driver callback for device `dev_index`. Always returns true
    /// (the stream continues); errors never propagate to the driver.
    fn audio_callback(&self, dev_index: usize, out: &mut [Sample]) -> bool {
        let n_devices = self.gates.len();
        if dev_index >= n_devices {
            out.fill(0.0);
            return true;
        }

        let channels = self.device_channels[dev_index];
        let n_frames = out.len() / channels.max(1);

        let mut was_entered = false;
        if self.running.load(Ordering::Acquire) {
            if n_frames == self.samples_per_buffer {
                self.callbacks_entered.fetch_add(1, Ordering::AcqRel);
                was_entered = true;
            } else {
                log::error!(
                    "no sound output: the driver changed samples per buffer to {}",
                    n_frames
                );
            }
        }

        // Re-check running after the entered count is visible, so the
        // control thread cannot start draining without seeing us.
        if was_entered && self.running.load(Ordering::Acquire) {
            let gate = &self.gates[dev_index];
            let mut state = gate.state.lock();
            while state.wait && state.waiting {
                gate.condvar.wait(&mut state);
            }

            let engine = self.engine.read();
            let cnt = self.calc_count.fetch_add(1, Ordering::AcqRel);
            match engine.as_ref() {
                Some(engine) => {
                    engine.get_audio_output(dev_index, cnt + 1 >= n_devices, out)
                }
                None => out.fill(0.0),
            }
            state.wait = true;

            let count = self.wait_count.fetch_add(1, Ordering::AcqRel);
            if count + 1 == n_devices {
                if let Some(engine) = engine.as_ref() {
                    engine.next_period();
                    self.update_meter(engine);
                    engine.wakeup_threads();
                }
                self.calc_count.store(0, Ordering::Release);
                self.wait_count.store(0, Ordering::Release);

                // Release every gate in index order; our own is already
                // locked.
                for (index, other) in self.gates.iter().enumerate() {
                    if index == dev_index {
                        state.wait = false;
                        gate.condvar.notify_one();
                    } else {
                        let mut other_state = other.state.lock();
                        other_state.wait = false;
                        other.condvar.notify_one();
                    }
                }
            }
        } else {
            out.fill(0.0);
        }

        if was_entered
            && self.callbacks_entered.fetch_sub(1, Ordering::AcqRel) <= 1
            && !self.running.load(Ordering::Acquire)
        {
            // Make sure the control thread is inside its wait before the
            // notification fires.
            let _guard = self.drain_lock.lock();
            self.drain_condvar.notify_all();
        }
        true
    }

    fn update_meter(&self, engine: &OrganEngine) {
        let counter =
            self.meter_counter.fetch_add(self.samples_per_buffer, Ordering::Relaxed)
                + self.samples_per_buffer;
        if counter >= METER_PUBLISH_SAMPLES {
            self.meter_counter.store(0, Ordering::Relaxed);
            *self.meter.lock() = engine.meter_info();
        }
    }

    fn wait_callbacks_drained(&self) {
        let mut guard = self.drain_lock.lock();
        while self.callbacks_entered.load(Ordering::Acquire) > 0 {
            self.drain_condvar.wait(&mut guard);
        }
    }
}

/// Driver-facing entry into the sound system; one per device port
#[derive(Clone)]
pub struct PortHandle {
    inner: Arc<SystemInner>,
    index: usize,
}

impl PortHandle {
    /// Produce one period of interleaved audio for this device.
    pub fn render(&self, out: &mut [Sample]) -> bool {
        self.inner.audio_callback(self.index, out)
    }

    pub fn device_index(&self) -> usize {
        self.index
    }
}

struct OpenState {
    inner: Arc<SystemInner>,
    ports: Vec<Box<dyn SoundPort>>,
}

/// Factory the sound system uses to instantiate one port per configured
/// device (platform backends, or loopback ports in tests).
pub type PortFactory = dyn FnMut(PortParams, PortHandle) -> AudioResult<Box<dyn SoundPort>>;

/// System-wide audio frontend; usable with or without a loaded organ
pub struct SoundSystem {
    config: SoundConfig,
    recorder: Arc<dyn RecorderSink>,
    open_state: Option<OpenState>,
    last_error: Option<String>,
}

impl SoundSystem {
    pub fn new(config: SoundConfig, recorder: Arc<dyn RecorderSink>) -> Self {
        Self {
            config,
            recorder,
            open_state: None,
            last_error: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open_state.is_some()
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn samples_per_buffer(&self) -> usize {
        self.config.samples_per_buffer
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Latest published meter snapshot (polyphony fraction + channel
    /// peaks).
    pub fn meter_info(&self) -> Vec<f64> {
        self.open_state
            .as_ref()
            .map(|open| open.inner.meter.lock().clone())
            .unwrap_or_default()
    }

    /// Callback entry for device `index`, for driving periods without a
    /// platform backend.
    pub fn port_handle(&self, index: usize) -> Option<PortHandle> {
        let open = self.open_state.as_ref()?;
        (index < open.inner.gates.len()).then(|| PortHandle {
            inner: Arc::clone(&open.inner),
            index,
        })
    }

    /// Instantiate and start every configured device port.
    pub fn open(&mut self, factory: &mut PortFactory) -> AudioResult<()> {
        if self.open_state.is_some() {
            return Err(AudioError::AlreadyOpen);
        }
        if self.config.samples_per_buffer > MAX_FRAME_SIZE {
            return Err(AudioError::UnsupportedBufferSize(
                self.config.samples_per_buffer,
            ));
        }

        self.last_error = None;

        let inner = Arc::new(SystemInner {
            sample_rate: self.config.sample_rate,
            samples_per_buffer: self.config.samples_per_buffer,
            device_channels: self.config.devices.iter().map(|d| d.channels).collect(),
            gates: self.config.devices.iter().map(|_| DeviceGate::default()).collect(),
            engine: RwLock::new(None),
            running: AtomicBool::new(false),
            calc_count: AtomicUsize::new(0),
            wait_count: AtomicUsize::new(0),
            callbacks_entered: AtomicUsize::new(0),
            drain_lock: Mutex::new(()),
            drain_condvar: Condvar::new(),
            meter_counter: AtomicUsize::new(0),
            meter: Mutex::new(Vec::new()),
        });

        let result = self.open_ports(&inner, factory).and_then(|mut ports| {
            Self::start_streams(&inner, &mut ports)?;
            Ok(ports)
        });

        match result {
            Ok(ports) => {
                self.recorder
                    .set_bytes_per_sample(self.config.wave_format_bytes_per_sample);
                self.open_state = Some(OpenState { inner, ports });
                log::info!(
                    "sound system open: {} devices, {} frames at {} Hz",
                    self.config.devices.len(),
                    self.config.samples_per_buffer,
                    self.config.sample_rate
                );
                Ok(())
            }
            Err(error) => {
                self.last_error = Some(error.to_string());
                log::error!("failed to open sound system: {}", error);
                Err(error)
            }
        }
    }

    fn open_ports(
        &self,
        inner: &Arc<SystemInner>,
        factory: &mut PortFactory,
    ) -> AudioResult<Vec<Box<dyn SoundPort>>> {
        let mut ports = Vec::with_capacity(self.config.devices.len());

        for (index, device) in self.config.devices.iter().enumerate() {
            let params = PortParams {
                channels: device.channels,
                sample_rate: self.config.sample_rate,
                samples_per_buffer: self.config.samples_per_buffer,
                desired_latency_ms: device.latency_ms,
                index,
            };
            let handle = PortHandle {
                inner: Arc::clone(inner),
                index,
            };
            let mut port = factory(params, handle)?;
            if let Err(error) = port.open() {
                for port in ports.iter_mut().rev() {
                    Self::close_port(port);
                }
                return Err(error);
            }
            ports.push(port);
        }
        Ok(ports)
    }

    fn start_streams(
        inner: &Arc<SystemInner>,
        ports: &mut [Box<dyn SoundPort>],
    ) -> AudioResult<()> {
        inner.calc_count.store(0, Ordering::Release);
        inner.wait_count.store(0, Ordering::Release);
        for gate in &inner.gates {
            let mut state = gate.state.lock();
            state.wait = false;
            state.waiting = true;
        }

        for port in ports.iter_mut() {
            port.start_stream()?;
        }
        Ok(())
    }

    fn close_port(port: &mut Box<dyn SoundPort>) {
        port.close();
    }

    /// Serve audio from `engine`; every subsequent device callback pulls
    /// its slice out of it.
    pub fn attach_engine(&self, engine: Arc<OrganEngine>) {
        let Some(open) = self.open_state.as_ref() else {
            return;
        };
        engine.set_used(true);
        *open.inner.engine.write() = Some(engine);
        open.inner.callbacks_entered.store(0, Ordering::Release);
        open.inner.running.store(true, Ordering::Release);
    }

    /// Stop serving audio and wait for all in-flight callbacks to leave
    /// the engine. Only after this returns may the engine be destroyed.
    pub fn detach_engine(&self) {
        let Some(open) = self.open_state.as_ref() else {
            return;
        };
        open.inner.running.store(false, Ordering::Release);
        open.inner.wait_callbacks_drained();

        if let Some(engine) = open.inner.engine.write().take() {
            engine.set_used(false);
        }
    }

    /// Release all gates, close every port (in reverse order), reset
    /// meters.
    pub fn close(&mut self) {
        let Some(mut open) = self.open_state.take() else {
            return;
        };

        self.detach_open(&open);

        for gate in &open.inner.gates {
            let mut state = gate.state.lock();
            state.wait = false;
            state.waiting = false;
            gate.condvar.notify_all();
        }

        for port in open.ports.iter_mut().rev() {
            Self::close_port(port);
        }
        open.inner.meter.lock().clear();
        log::info!("sound system closed");
    }

    fn detach_open(&self, open: &OpenState) {
        if open.inner.engine.read().is_some() {
            open.inner.running.store(false, Ordering::Release);
            open.inner.wait_callbacks_drained();
            if let Some(engine) = open.inner.engine.write().take() {
                engine.set_used(false);
            }
        }
    }
}

impl Drop for SoundSystem {
    fn drop(&mut self) {
        self.close();
    }
}
