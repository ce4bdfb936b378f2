use std::collections::{HashMap, VecDeque};

/// Most recent raw values for one source, per measurement. `None` until the
/// source has history.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PreviousValues {
    pub temperature: Option<f64>,
    pub vibration: Option<f64>,
    pub pressure: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Averages {
    pub temperature: f64,
    pub vibration: f64,
    pub pressure: f64,
}

/// What one `record` changed: whether it created the source and the value
/// each bounded buffer evicted, if any.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RecordUndo {
    created: bool,
    evicted: [Option<f64>; 3],
}

#[derive(Debug)]
struct SourceWindow {
    temperature: VecDeque<f64>,
    vibration: VecDeque<f64>,
    pressure: VecDeque<f64>,
}

impl SourceWindow {
    fn new(capacity: usize) -> Self {
        Self {
            temperature: VecDeque::with_capacity(capacity),
            vibration: VecDeque::with_capacity(capacity),
            pressure: VecDeque::with_capacity(capacity),
        }
    }
}

/// Bounded FIFO history per source. Windows are created on first record and
/// live for the rest of the process.
#[derive(Debug)]
pub struct RollingAggregator {
    window: usize,
    sources: HashMap<String, SourceWindow>,
}

impl RollingAggregator {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            sources: HashMap::new(),
        }
    }

    pub fn tracked_sources(&self) -> usize {
        self.sources.len()
    }

    pub fn record(
        &mut self,
        source_id: &str,
        temperature: f64,
        vibration: f64,
        pressure: f64,
    ) -> RecordUndo {
        let capacity = self.window;
        let created = !self.sources.contains_key(source_id);
        let entry = self
            .sources
            .entry(source_id.to_string())
            .or_insert_with(|| SourceWindow::new(capacity));
        RecordUndo {
            created,
            evicted: [
                push_bounded(&mut entry.temperature, temperature, capacity),
                push_bounded(&mut entry.vibration, vibration, capacity),
                push_bounded(&mut entry.pressure, pressure, capacity),
            ],
        }
    }

    /// Reverts the latest `record` for `source_id`, restoring any value it
    /// evicted. Only valid while no later record touched the same source.
    pub fn revert(&mut self, source_id: &str, undo: RecordUndo) {
        if undo.created {
            self.sources.remove(source_id);
            return;
        }
        let Some(entry) = self.sources.get_mut(source_id) else {
            return;
        };
        let [temperature, vibration, pressure] = undo.evicted;
        pop_restore(&mut entry.temperature, temperature);
        pop_restore(&mut entry.vibration, vibration);
        pop_restore(&mut entry.pressure, pressure);
    }

    /// Must be read before `record` for the same reading; the vibration spike
    /// rule compares against the pre-update value.
    pub fn previous(&self, source_id: &str) -> PreviousValues {
        let Some(entry) = self.sources.get(source_id) else {
            return PreviousValues::default();
        };
        PreviousValues {
            temperature: entry.temperature.back().copied(),
            vibration: entry.vibration.back().copied(),
            pressure: entry.pressure.back().copied(),
        }
    }

    pub fn averages(
        &self,
        source_id: &str,
        fallback_temperature: f64,
        fallback_vibration: f64,
        fallback_pressure: f64,
    ) -> Averages {
        let entry = self.sources.get(source_id);
        Averages {
            temperature: entry
                .and_then(|e| mean(&e.temperature))
                .unwrap_or(fallback_temperature),
            vibration: entry
                .and_then(|e| mean(&e.vibration))
                .unwrap_or(fallback_vibration),
            pressure: entry
                .and_then(|e| mean(&e.pressure))
                .unwrap_or(fallback_pressure),
        }
    }

    #[cfg(test)]
    fn vibration_history(&self, source_id: &str) -> Vec<f64> {
        self.sources
            .get(source_id)
            .map(|e| e.vibration.iter().copied().collect())
            .unwrap_or_default()
    }
}

fn push_bounded(buffer: &mut VecDeque<f64>, value: f64, capacity: usize) -> Option<f64> {
    let evicted = if buffer.len() >= capacity {
        buffer.pop_front()
    } else {
        None
    };
    buffer.push_back(value);
    evicted
}

fn pop_restore(buffer: &mut VecDeque<f64>, evicted: Option<f64>) {
    buffer.pop_back();
    if let Some(value) = evicted {
        buffer.push_front(value);
    }
}

fn mean(buffer: &VecDeque<f64>) -> Option<f64> {
    if buffer.is_empty() {
        return None;
    }
    Some(buffer.iter().sum::<f64>() / buffer.len() as f64)
}
