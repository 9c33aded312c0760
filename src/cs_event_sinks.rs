//! Various event sinks for different use cases

use std::cell::{Ref, RefCell};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::rc::Rc;

use log::{debug, info, warn};

use crate::cs_interface::{Event, EventSink, Height, NodeId, SimTime};

fn fmt_height(height: Option<Height>) -> String {
    match height {
        Some(h) => h.to_string(),
        None => "-".to_string(),
    }
}

// ============================================================================
// Logging Sink
// ============================================================================

/// Event sink that forwards every event to the `log` facade, one line per event
pub struct LoggingEventSink {
    enabled: bool,
}

impl LoggingEventSink {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl EventSink for LoggingEventSink {
    fn log(&mut self, time: SimTime, node: NodeId, event: Event) {
        if !self.enabled {
            return;
        }

        // Format: time node EVENT details
        let name = event.name();
        match event {
            Event::BlockMined {
                height,
                nonce,
                algorithm,
            } => {
                info!(
                    "{:>6} N{:<3} {:<24} h:{} nonce:{} alg:{}",
                    time, node, name, height, nonce, algorithm
                );
            }
            Event::ReorgStart {
                old_height,
                peer_height,
            } => {
                info!(
                    "{:>6} N{:<3} {:<24} h:{} -> peer h:{}",
                    time, node, name, old_height, peer_height
                );
            }
            Event::ReorgComplete {
                old_height,
                new_height,
                orphaned,
            } => {
                info!(
                    "{:>6} N{:<3} {:<24} h:{} -> h:{} orphaned:{}",
                    time, node, name, old_height, new_height, orphaned
                );
            }
            Event::ReorgRejectedFinality {
                finalized_height,
                fork_point,
            } => {
                // the node itself warns about this one
                debug!(
                    "{:>6} N{:<3} {:<24} fork:{} final:{}",
                    time,
                    node,
                    name,
                    fmt_height(fork_point),
                    fmt_height(finalized_height)
                );
            }
            Event::FinalityUpdate {
                previous_final_height,
                new_final_height,
            } => {
                info!(
                    "{:>6} N{:<3} {:<24} {} -> {}",
                    time,
                    node,
                    name,
                    fmt_height(previous_final_height),
                    new_final_height
                );
            }
            Event::FinalityError { reason, height } => {
                debug!(
                    "{:>6} N{:<3} {:<24} h:{} {}",
                    time, node, name, height, reason
                );
            }
        }
    }
}

// ============================================================================
// CSV Event Sink
// ============================================================================

/// CSV event sink for structured data export.
///
/// A missing height (nothing finalized, no common ancestor) is written as -1.
pub struct CsvEventSink<W: Write = BufWriter<File>> {
    writer: W,
}

impl CsvEventSink {
    pub fn new<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Self::from_writer(BufWriter::new(file))
    }
}

impl<W: Write> CsvEventSink<W> {
    pub fn from_writer(mut writer: W) -> std::io::Result<Self> {
        writeln!(writer, "time,node,event_type,height,value1,value2,details")?;
        Ok(Self { writer })
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

fn csv_height(height: Option<Height>) -> i128 {
    height.map_or(-1, i128::from)
}

impl<W: Write> EventSink for CsvEventSink<W> {
    fn log(&mut self, time: SimTime, node: NodeId, event: Event) {
        let name = event.name();
        let result = match event {
            Event::BlockMined {
                height,
                nonce,
                algorithm,
            } => writeln!(
                self.writer,
                "{},{},{},{},{},0,{}",
                time, node, name, height, nonce, algorithm
            ),
            Event::ReorgStart {
                old_height,
                peer_height,
            } => writeln!(
                self.writer,
                "{},{},{},{},{},0,old->peer",
                time, node, name, old_height, peer_height
            ),
            Event::ReorgComplete {
                old_height,
                new_height,
                orphaned,
            } => writeln!(
                self.writer,
                "{},{},{},{},{},{},old->new orphaned",
                time, node, name, old_height, new_height, orphaned
            ),
            Event::ReorgRejectedFinality {
                finalized_height,
                fork_point,
            } => writeln!(
                self.writer,
                "{},{},{},{},{},0,final fork",
                time,
                node,
                name,
                csv_height(finalized_height),
                csv_height(fork_point)
            ),
            Event::FinalityUpdate {
                previous_final_height,
                new_final_height,
            } => writeln!(
                self.writer,
                "{},{},{},{},{},0,new prev",
                time,
                node,
                name,
                new_final_height,
                csv_height(previous_final_height)
            ),
            Event::FinalityError { reason, height } => writeln!(
                self.writer,
                "{},{},{},{},0,0,\"{}\"",
                time,
                node,
                name,
                height,
                reason.replace('"', "'")
            ),
        };

        if let Err(e) = result {
            warn!("Error writing to CSV: {}", e);
        }
    }
}

impl<W: Write> Drop for CsvEventSink<W> {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

// ============================================================================
// Collector Event Sink (In-Memory)
// ============================================================================

/// Collects events in memory for programmatic analysis
#[derive(Default)]
pub struct CollectorEventSink {
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub time: SimTime,
    pub node: NodeId,
    pub event: Event,
}

impl CollectorEventSink {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    // Query helpers
    pub fn blocks_mined(&self) -> impl Iterator<Item = &EventRecord> {
        self.events
            .iter()
            .filter(|e| matches!(e.event, Event::BlockMined { .. }))
    }

    pub fn reorgs(&self) -> impl Iterator<Item = &EventRecord> {
        self.events
            .iter()
            .filter(|e| matches!(e.event, Event::ReorgComplete { .. }))
    }

    pub fn finality_updates(&self) -> impl Iterator<Item = &EventRecord> {
        self.events
            .iter()
            .filter(|e| matches!(e.event, Event::FinalityUpdate { .. }))
    }

    pub fn for_node(&self, node: NodeId) -> impl Iterator<Item = &EventRecord> {
        self.events.iter().filter(move |e| e.node == node)
    }

    pub fn in_time_range(&self, start: SimTime, end: SimTime) -> impl Iterator<Item = &EventRecord> {
        self.events
            .iter()
            .filter(move |e| e.time >= start && e.time <= end)
    }

    pub fn count_by_type(&self) -> EventTypeCounts {
        let mut counts = EventTypeCounts::default();
        for record in &self.events {
            match record.event {
                Event::BlockMined { .. } => counts.block_mined += 1,
                Event::ReorgStart { .. } => counts.reorg_start += 1,
                Event::ReorgComplete { .. } => counts.reorg_complete += 1,
                Event::ReorgRejectedFinality { .. } => counts.reorg_rejected_finality += 1,
                Event::FinalityUpdate { .. } => counts.finality_update += 1,
                Event::FinalityError { .. } => counts.finality_error += 1,
            }
        }
        counts
    }

    pub fn export_to_csv<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let mut csv_sink = CsvEventSink::new(path)?;
        for record in &self.events {
            csv_sink.log(record.time, record.node, record.event.clone());
        }
        csv_sink.flush()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EventTypeCounts {
    pub block_mined: usize,
    pub reorg_start: usize,
    pub reorg_complete: usize,
    pub reorg_rejected_finality: usize,
    pub finality_update: usize,
    pub finality_error: usize,
}

impl EventSink for CollectorEventSink {
    fn log(&mut self, time: SimTime, node: NodeId, event: Event) {
        self.events.push(EventRecord { time, node, event });
    }
}

// ============================================================================
// Shared Sink (one sink fed by many nodes)
// ============================================================================

/// Cloneable handle so every node can write into the same sink
pub struct SharedSink<S: EventSink> {
    inner: Rc<RefCell<S>>,
}

impl<S: EventSink> SharedSink<S> {
    pub fn new(sink: S) -> Self {
        Self {
            inner: Rc::new(RefCell::new(sink)),
        }
    }

    pub fn borrow(&self) -> Ref<'_, S> {
        self.inner.borrow()
    }
}

impl<S: EventSink> Clone for SharedSink<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<S: EventSink> EventSink for SharedSink<S> {
    fn log(&mut self, time: SimTime, node: NodeId, event: Event) {
        self.inner.borrow_mut().log(time, node, event);
    }
}

// ============================================================================
// Multi Sink (Combine Multiple Sinks)
// ============================================================================

/// Combines multiple event sinks
#[derive(Default)]
pub struct MultiEventSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl MultiEventSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add_sink(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for MultiEventSink {
    fn log(&mut self, time: SimTime, node: NodeId, event: Event) {
        for sink in &mut self.sinks {
            sink.log(time, node, event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::{Level, LevelFilter, Log, Metadata, Record};
    use std::sync::{Mutex, Once};

    fn sample_events() -> Vec<(SimTime, NodeId, Event)> {
        vec![
            (
                10,
                0,
                Event::BlockMined {
                    height: 1,
                    nonce: 42,
                    algorithm: "PoW",
                },
            ),
            (
                20,
                1,
                Event::ReorgRejectedFinality {
                    finalized_height: Some(3),
                    fork_point: None,
                },
            ),
            (
                30,
                1,
                Event::FinalityUpdate {
                    previous_final_height: None,
                    new_final_height: 0,
                },
            ),
        ]
    }

    #[test]
    fn test_collector_queries() {
        let mut sink = CollectorEventSink::new();
        for (time, node, event) in sample_events() {
            sink.log(time, node, event);
        }

        assert_eq!(sink.blocks_mined().count(), 1);
        assert_eq!(sink.finality_updates().count(), 1);
        assert_eq!(sink.for_node(1).count(), 2);
        assert_eq!(sink.in_time_range(15, 30).count(), 2);

        let counts = sink.count_by_type();
        assert_eq!(counts.block_mined, 1);
        assert_eq!(counts.reorg_rejected_finality, 1);
        assert_eq!(counts.finality_error, 0);
    }

    #[test]
    fn test_csv_rows() {
        let mut sink = CsvEventSink::from_writer(Vec::new()).unwrap();
        for (time, node, event) in sample_events() {
            sink.log(time, node, event);
        }

        let text = String::from_utf8(std::mem::take(&mut sink.writer)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "time,node,event_type,height,value1,value2,details");
        assert_eq!(lines[1], "10,0,BLOCK_MINED,1,42,0,PoW");
        assert_eq!(lines[2], "20,1,REORG_REJECTED_FINALITY,3,-1,0,final fork");
        assert_eq!(lines[3], "30,1,FINALITY_UPDATE,0,-1,0,new prev");
    }

    #[test]
    fn test_shared_and_multi_sinks() {
        let first = SharedSink::new(CollectorEventSink::new());
        let second = SharedSink::new(CollectorEventSink::new());

        let mut multi = MultiEventSink::new();
        multi.add_sink(Box::new(first.clone()));
        multi.add_sink(Box::new(second.clone()));

        let mut other_handle = first.clone();
        for (time, node, event) in sample_events() {
            multi.log(time, node, event);
        }
        other_handle.log(
            40,
            2,
            Event::ReorgStart {
                old_height: 1,
                peer_height: 2,
            },
        );

        assert_eq!(first.borrow().events.len(), 4);
        assert_eq!(second.borrow().events.len(), 3);
        assert_eq!(first.borrow().events[..3], second.borrow().events[..]);
    }

    /// Records every log line so the console sink's levels can be checked
    struct CaptureLogger;

    static CAPTURED: Mutex<Vec<(Level, String)>> = Mutex::new(Vec::new());
    static CAPTURE_INIT: Once = Once::new();

    impl Log for CaptureLogger {
        fn enabled(&self, _: &Metadata) -> bool {
            true
        }

        fn log(&self, record: &Record) {
            if let Ok(mut lines) = CAPTURED.lock() {
                lines.push((record.level(), record.args().to_string()));
            }
        }

        fn flush(&self) {}
    }

    fn captured_for(node: NodeId) -> Vec<(Level, String)> {
        let tag = format!("N{:<3}", node);
        CAPTURED
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, line)| line.contains(&tag))
            .cloned()
            .collect()
    }

    #[test]
    fn test_logging_sink_levels() {
        CAPTURE_INIT.call_once(|| {
            let _ = log::set_logger(&CaptureLogger);
            log::set_max_level(LevelFilter::Trace);
        });

        let mut quiet = LoggingEventSink::new(false);
        quiet.log(1, 901, sample_events().remove(0).2);
        assert!(captured_for(901).is_empty());

        let mut sink = LoggingEventSink::new(true);
        sink.log(
            10,
            902,
            Event::BlockMined {
                height: 1,
                nonce: 42,
                algorithm: "PoW",
            },
        );
        sink.log(
            20,
            902,
            Event::ReorgRejectedFinality {
                finalized_height: Some(3),
                fork_point: None,
            },
        );
        sink.log(
            30,
            902,
            Event::FinalityError {
                reason: "double spend".to_string(),
                height: 2,
            },
        );

        let levels: Vec<Level> = captured_for(902).iter().map(|(level, _)| *level).collect();
        // the node reports rejections and faults itself at warn/error
        assert_eq!(levels, vec![Level::Info, Level::Debug, Level::Debug]);
    }
}
