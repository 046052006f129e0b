use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Per-device mutual exclusion: at most one run drives a given device at a time.
#[derive(Default)]
pub struct TaskScheduler {
    device_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_lock(&self, serial: &str) -> Arc<Mutex<()>> {
        let mut guard = match self.device_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .entry(serial.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
