use std::time::Duration;
use anyhow::bail;

/// How long a caller is prepared to wait for a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitTime {
    /// return immediately, i.e. effectively fire-and-forget
    NoWait,
    Forever,
    Bounded(Duration),
}

impl WaitTime {
    /// Legacy millisecond encoding: `-1` waits forever, zero and other negative values do not
    ///  wait at all.
    pub fn from_millis(millis: i64) -> WaitTime {
        match millis {
            -1 => WaitTime::Forever,
            m if m <= 0 => WaitTime::NoWait,
            m => WaitTime::Bounded(Duration::from_millis(m as u64)),
        }
    }
}

impl From<Duration> for WaitTime {
    fn from(value: Duration) -> Self {
        if value.is_zero() {
            WaitTime::NoWait
        }
        else {
            WaitTime::Bounded(value)
        }
    }
}

pub struct CommunicatorConfig {
    /// Upper bound for a frame's payload. A peer announcing a bigger frame is considered broken
    ///  or malicious, and the connection is terminated.
    pub max_message_size: usize,

    /// The wait budget for `send` if neither the call nor the engine specify one
    pub default_wait_time: WaitTime,

    /// Granularity at which waiting callers re-check their deadline and the engine's liveness.
    ///  Responses themselves are handed over immediately, so this only affects how precisely
    ///  timeouts are observed.
    pub response_poll_interval: Duration,

    /// sent as part of the handshake
    pub protocol_version: u32,
}

impl CommunicatorConfig {
    pub const PROTOCOL_VERSION: u32 = 1;

    pub fn default_config() -> CommunicatorConfig {
        CommunicatorConfig {
            max_message_size: 16*1024*1024,
            default_wait_time: WaitTime::Bounded(Duration::from_millis(7500)),
            response_poll_interval: Duration::from_millis(250),
            protocol_version: Self::PROTOCOL_VERSION,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_message_size > i32::MAX as usize {
            bail!("maximum message size {} does not fit the wire format's i32 size field", self.max_message_size);
        }
        if self.response_poll_interval.is_zero() {
            bail!("response poll interval must be positive");
        }
        Ok(())
    }
}

pub struct RawChannelConfig {
    /// maximum number of (uncompressed) payload bytes per block
    pub block_size: usize,

    /// This is the number of sent blocks a sender keeps for re-sending. A peer requesting a block
    ///  that fell out of this window causes the channel to fail.
    pub retained_blocks: usize,

    /// capacity of the receive side's circular buffer in bytes
    pub buffer_capacity: usize,

    /// If true, every block is sent with a request for acknowledgement, and the sender retries
    ///  the block until the peer confirms it. Otherwise blocks are fire-and-forget, and gaps are
    ///  repaired through resend requests.
    pub acknowledged: bool,

    /// wait budget per attempt in acknowledged mode
    pub ack_wait_time: WaitTime,

    /// Gives up on a block after this many unacknowledged attempts. `None` retries for as long
    ///  as the connection is alive.
    pub max_ack_attempts: Option<usize>,

    /// Offer compression when opening a channel. Each side compresses its outgoing blocks iff
    ///  the opening side offered it.
    pub compression: bool,
}

impl RawChannelConfig {
    pub fn default_config() -> RawChannelConfig {
        RawChannelConfig {
            block_size: 32*1024,
            retained_blocks: 25,
            buffer_capacity: 10*1024*1024,
            acknowledged: false,
            ack_wait_time: WaitTime::Bounded(Duration::from_millis(7500)),
            max_ack_attempts: None,
            compression: false,
        }
    }

    pub fn validate(&self, communicator_config: &CommunicatorConfig) -> anyhow::Result<()> {
        if self.block_size == 0 {
            bail!("block size must be positive");
        }
        // compression may in rare cases inflate data slightly, plus header overhead
        if self.block_size + self.block_size / 8 + 128 > communicator_config.max_message_size {
            bail!("block size {} does not fit into the maximum message size {}", self.block_size, communicator_config.max_message_size);
        }
        if self.retained_blocks == 0 {
            bail!("at least one block must be retained for re-sending");
        }
        if self.buffer_capacity == 0 {
            bail!("receive buffer capacity must be positive");
        }
        if self.ack_wait_time == WaitTime::NoWait {
            // end-of-stream blocks are always acknowledged
            bail!("raw channels require a wait time for acknowledgements");
        }
        if self.max_ack_attempts == Some(0) {
            bail!("at least one attempt is required to send a block");
        }
        Ok(())
    }
}

pub struct LivenessConfig {
    /// time to wait for pongs after each round of pings
    pub ping_window: Duration,
    /// number of ping rounds before an unresponsive peer is purged
    pub max_rounds: usize,
    /// pause between two liveness cycles
    pub cycle_interval: Duration,
}

impl LivenessConfig {
    pub fn default_config() -> LivenessConfig {
        LivenessConfig {
            ping_window: Duration::from_secs(10),
            max_rounds: 3,
            cycle_interval: Duration::from_secs(60),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_rounds == 0 {
            bail!("at least one ping round is required");
        }
        Ok(())
    }
}
