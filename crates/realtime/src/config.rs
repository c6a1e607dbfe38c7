use std::time::Duration;

/// A sliding-window allowance: at most `max` events per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub max: u32,
    pub window: Duration,
}

impl Limit {
    pub const fn new(max: u32, window: Duration) -> Self {
        Self { max, window }
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub max_message_chars: usize,
    pub send_limit: Limit,
    pub typing_limit: Limit,
    pub typing_ttl: Duration,
    pub typing_auto_stop: Duration,
    pub ring_timeout: Duration,
    /// Lifetime of shared call state and busy markers, bounding leaks from
    /// crashed instances.
    pub call_state_ttl: Duration,
    pub replay_batch_size: u32,
    pub replay_batch_delay: Duration,
    pub admission_global_limit: Limit,
    pub admission_address_limit: Limit,
    pub connection_budget: usize,
    pub session_ttl: Duration,
    pub outbound_queue: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_message_chars: 4000,
            send_limit: Limit::new(10, Duration::from_millis(1000)),
            typing_limit: Limit::new(1, Duration::from_millis(1000)),
            typing_ttl: Duration::from_secs(5),
            typing_auto_stop: Duration::from_secs(3),
            ring_timeout: Duration::from_secs(45),
            call_state_ttl: Duration::from_secs(4 * 60 * 60),
            replay_batch_size: 50,
            replay_batch_delay: Duration::from_millis(100),
            admission_global_limit: Limit::new(200, Duration::from_secs(1)),
            admission_address_limit: Limit::new(20, Duration::from_secs(10)),
            connection_budget: 10_000,
            session_ttl: Duration::from_secs(90),
            outbound_queue: 256,
        }
    }
}
