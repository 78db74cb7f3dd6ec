// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{sink::Sink, source, source::Source};

/// Fan-in/fan-out junction between a test's output producers and
/// consumers.
///
/// Every source drains into every sink. The hub always carries at least
/// one sink (an [`Sink::Observer`]) so draining never stalls on an empty
/// consumer list. Ownership is move-only: after fork the child holds only
/// its own socket end, so no hub state ever crosses the process boundary.
#[derive(Debug)]
pub struct IoHub {
    sources: Vec<Source>,
    sinks: Vec<Sink>,
}

impl IoHub {
    /// Creates a hub with no sources and the default observer sink.
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            sinks: vec![Sink::Observer],
        }
    }

    /// Attaches a sink.
    pub fn add_sink(&mut self, sink: Sink) {
        self.sinks.push(sink);
    }

    /// Attaches a source.
    pub fn add_source(&mut self, source: Source) {
        self.sources.push(source);
    }

    /// Fans raw bytes out to every sink.
    pub fn push(&mut self, bytes: &[u8]) {
        for sink in &mut self.sinks {
            sink.push(bytes);
        }
    }

    /// Waits until the child socket is readable and drains it. Pends
    /// forever when there is no (open) child source; the monitor's tick
    /// arm bounds the wait.
    pub async fn pump(&mut self) -> usize {
        source::pump_child(&mut self.sources, &mut self.sinks).await
    }

    /// Drains every source without waiting. Returns the number of bytes
    /// delivered, which the monitor uses to reset the inactivity clock.
    pub fn poll_sources(&mut self) -> usize {
        let Self { sources, sinks } = self;
        sources.iter_mut().map(|source| source.poll(sinks)).sum()
    }

    /// Gives every sink a chance to flush complete lines.
    pub fn flush_sinks(&mut self) {
        for sink in &mut self.sinks {
            sink.sync();
        }
    }

    /// Force-flushes partial tails and releases sink file resources.
    pub fn finish_sinks(&mut self) {
        for sink in &mut self.sinks {
            sink.finish();
        }
    }

    /// Renders the in-memory replay buffer, if one was installed.
    pub fn replay(&mut self) -> Option<Vec<u8>> {
        self.sinks.iter_mut().find_map(|sink| match sink {
            Sink::Buf(buf) => Some(buf.dump()),
            _ => None,
        })
    }

    /// Drops and clears the sources.
    pub fn close(&mut self) {
        self.sources.clear();
    }

    /// Drops and clears the sinks.
    pub fn clear(&mut self) {
        self.sinks.clear();
    }
}

impl Default for IoHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::BufSink;
    use std::time::Instant;

    #[test]
    fn push_fans_out_to_all_sinks() {
        let mut hub = IoHub::new();
        hub.add_sink(Sink::Buf(BufSink::new(Instant::now())));
        hub.add_sink(Sink::Buf(BufSink::new(Instant::now())));

        hub.push(b"line\n");
        hub.flush_sinks();

        let dumps: Vec<String> = hub
            .sinks
            .iter_mut()
            .filter_map(|sink| match sink {
                Sink::Buf(buf) => Some(String::from_utf8(buf.dump()).unwrap()),
                _ => None,
            })
            .collect();
        assert_eq!(dumps, vec!["| [ 0:00] line\n", "| [ 0:00] line\n"]);
    }

    #[test]
    fn close_and_clear_empty_the_hub() {
        let mut hub = IoHub::new();
        hub.add_sink(Sink::Buf(BufSink::new(Instant::now())));
        hub.close();
        hub.clear();
        assert!(hub.sources.is_empty());
        assert!(hub.sinks.is_empty());
    }
}
