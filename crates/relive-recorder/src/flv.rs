//! Incremental FLV tag scanning for stream-gap detection.
//!
//! Appending a reconnected stream onto an existing FLV file is only
//! safe when the tag timestamps continue where the file left off. The
//! scanner watches timestamps as bytes flow through and reports a
//! discontinuity when they jump, so the recorder can rotate to a fresh
//! segment instead of writing a corrupt container.

/// Forward jump between consecutive tags treated as a gap, in ms.
const GAP_THRESHOLD_MS: u32 = 5_000;

/// Backward jump treated as a reset, in ms.
const BACKWARD_THRESHOLD_MS: u32 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discontinuity {
    /// Timestamps jumped forward past the gap threshold
    Gap { from_ms: u32, to_ms: u32 },
    /// Timestamps went backwards, usually a fresh encoder session
    Reset { from_ms: u32, to_ms: u32 },
}

enum ScanState {
    /// Expecting the 9-byte file header plus the first back-pointer
    Header,
    /// Expecting a tag header at the current position
    TagHeader,
    /// Skipping over tag payload plus the trailing back-pointer
    Skipping { remaining: usize },
}

/// Streaming FLV tag scanner. Feed it the raw bytes in arrival order.
pub struct FlvScanner {
    state: ScanState,
    buffer: Vec<u8>,
    last_timestamp_ms: Option<u32>,
}

impl Default for FlvScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl FlvScanner {
    pub fn new() -> Self {
        Self {
            state: ScanState::Header,
            buffer: Vec::new(),
            last_timestamp_ms: None,
        }
    }

    /// Reset for a fresh stream while keeping the last seen timestamp,
    /// so a post-reconnect jump is still visible.
    pub fn restart_stream(&mut self) {
        self.state = ScanState::Header;
        self.buffer.clear();
    }

    pub fn last_timestamp_ms(&self) -> Option<u32> {
        self.last_timestamp_ms
    }

    /// Consume a chunk, returning the first discontinuity found in it.
    pub fn feed(&mut self, data: &[u8]) -> Option<Discontinuity> {
        self.buffer.extend_from_slice(data);
        let mut found = None;

        loop {
            match self.state {
                ScanState::Header => {
                    // "FLV" signature + version + flags + header size (9) + first back-pointer (4)
                    if self.buffer.len() < 13 {
                        break;
                    }
                    self.buffer.drain(..13);
                    self.state = ScanState::TagHeader;
                }
                ScanState::TagHeader => {
                    // type (1) + data size (3) + timestamp (3) + ts-extended (1) + stream id (3)
                    if self.buffer.len() < 11 {
                        break;
                    }
                    let data_size = u32::from_be_bytes([
                        0,
                        self.buffer[1],
                        self.buffer[2],
                        self.buffer[3],
                    ]) as usize;
                    let timestamp_ms = u32::from_be_bytes([
                        self.buffer[7],
                        self.buffer[4],
                        self.buffer[5],
                        self.buffer[6],
                    ]);

                    if found.is_none() {
                        found = self.check_timestamp(timestamp_ms);
                    }
                    self.last_timestamp_ms = Some(timestamp_ms);

                    self.buffer.drain(..11);
                    // payload plus the 4-byte previous-tag-size field
                    self.state = ScanState::Skipping {
                        remaining: data_size + 4,
                    };
                }
                ScanState::Skipping { remaining } => {
                    let take = remaining.min(self.buffer.len());
                    self.buffer.drain(..take);
                    if take < remaining {
                        self.state = ScanState::Skipping {
                            remaining: remaining - take,
                        };
                        break;
                    }
                    self.state = ScanState::TagHeader;
                }
            }
        }

        found
    }

    fn check_timestamp(&self, timestamp_ms: u32) -> Option<Discontinuity> {
        let last = self.last_timestamp_ms?;
        if timestamp_ms > last && timestamp_ms - last > GAP_THRESHOLD_MS {
            Some(Discontinuity::Gap {
                from_ms: last,
                to_ms: timestamp_ms,
            })
        } else if timestamp_ms < last && last - timestamp_ms > BACKWARD_THRESHOLD_MS {
            Some(Discontinuity::Reset {
                from_ms: last,
                to_ms: timestamp_ms,
            })
        } else {
            None
        }
    }
}
