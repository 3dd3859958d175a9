//! Dedicated pump thread.
//!
//! For hosts without a frame loop of their own. The engine moves behind one
//! mutex; the pump thread locks it once per cycle and client threads lock it
//! for play requests and parameter changes, so play requests still fail or
//! succeed synchronously.

use crate::engine::SoundEngine;
use crate::error::{Result, SoundsError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A [`SoundEngine`] shared between the pump thread and client threads.
#[derive(Clone)]
pub struct SharedSoundEngine {
    inner: Arc<Mutex<SoundEngine>>,
}

impl SharedSoundEngine {
    pub fn new(engine: SoundEngine) -> Self {
        Self {
            inner: Arc::new(Mutex::new(engine)),
        }
    }

    /// Locks the engine. Keep the guard short-lived: the pump waits on it.
    pub fn lock(&self) -> MutexGuard<'_, SoundEngine> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with the engine locked.
    pub fn with<T>(&self, f: impl FnOnce(&mut SoundEngine) -> T) -> T {
        f(&mut self.lock())
    }
}

/// Pumps a [`SharedSoundEngine`] at its configured cadence until stopped.
pub struct PumpThread {
    engine: SharedSoundEngine,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PumpThread {
    /// Moves `engine` behind a mutex and starts pumping it.
    pub fn spawn(engine: SoundEngine) -> Result<Self> {
        Self::spawn_shared(SharedSoundEngine::new(engine))
    }

    pub fn spawn_shared(engine: SharedSoundEngine) -> Result<Self> {
        let interval = engine.lock().pump_interval();
        let running = Arc::new(AtomicBool::new(true));

        let thread_engine = engine.clone();
        let thread_running = running.clone();
        let thread = std::thread::Builder::new()
            .name("sounds-pump".to_string())
            .spawn(move || pump_loop(thread_engine, thread_running, interval))
            .map_err(|e| SoundsError::Engine(format!("Failed to spawn pump thread: {}", e)))?;

        log::info!("Pump thread started ({:?} interval)", interval);
        Ok(Self {
            engine,
            running,
            thread: Some(thread),
        })
    }

    pub fn engine(&self) -> &SharedSoundEngine {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stops the thread and waits for the cycle in progress to finish.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Pump thread panicked");
            }
            log::info!("Pump thread stopped");
        }
    }
}

impl Drop for PumpThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump_loop(engine: SharedSoundEngine, running: Arc<AtomicBool>, interval: Duration) {
    let mut deadline = Instant::now();
    while running.load(Ordering::Relaxed) {
        let report = engine.lock().pump();
        for (handle, error) in report.internal_errors() {
            log::error!("{} hit an internal error: {}", handle, error);
        }

        deadline += interval;
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        } else {
            // Behind schedule: restart the cadence from now.
            deadline = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineDesc, PlayRequest};
    use crate::decoder::DefaultDecoderService;
    use crate::hardware::VirtualHardware;

    #[test]
    fn test_pump_thread_feeds_voices() {
        crate::init_test_logging();
        let hw = VirtualHardware::new();
        let desc = EngineDesc::new()
            .voice_count(1)
            .buffer_count(4)
            .buffer_size_bytes(400)
            .sample_rate(1000)
            .channels(1)
            .pump_interval(Duration::from_millis(1));
        let mut engine = SoundEngine::new(desc, hw.clone(), DefaultDecoderService::new()).unwrap();
        let id = engine
            .register_samples("tone", vec![0.0f32; 10_000], 1, 1000)
            .unwrap();

        let mut pump = PumpThread::spawn(engine).unwrap();
        let handle = pump
            .engine()
            .with(|engine| engine.request_play(PlayRequest::new(id)))
            .unwrap();

        let started = Instant::now();
        while hw.enqueued_total() == 0 && started.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(hw.enqueued_total() > 0);
        assert!(pump.engine().lock().is_playing(handle));

        pump.stop();
        assert!(!pump.is_running());
    }
}
