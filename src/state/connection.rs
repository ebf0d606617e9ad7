/// Lifecycle of the live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// First connection attempt in progress.
    Connecting,
    /// Connected and resynchronised.
    Open,
    /// Lost the connection; waiting out the backoff or retrying.
    Reconnecting,
    /// Torn down for good.
    Closed,
}

/// Observable connectivity of the live channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConnection {
    /// Current lifecycle state.
    pub status: ChannelStatus,
    /// Consecutive failed attempts since the channel was last open.
    pub retry_count: u32,
    /// Last failure seen, if any.
    pub last_error: Option<String>,
}

impl ChannelConnection {
    /// Connection record for a channel that was never opened.
    pub fn closed() -> Self {
        Self {
            status: ChannelStatus::Closed,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Whether messages are flowing.
    pub fn is_open(&self) -> bool {
        self.status == ChannelStatus::Open
    }
}
