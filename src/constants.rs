//! # System Constants
//!
//! Broker topology names, routing keys and the operational bounds shared by every
//! process role in the pipeline.

use std::time::Duration;

/// Exchange names
pub mod exchanges {
    pub const REQUESTS: &str = "requests";
    pub const EXECUTION: &str = "execution";
    pub const NOTIFICATIONS: &str = "notifications";
    pub const RESULTS: &str = "results";
    pub const PROGRESS: &str = "progress";
    pub const DEAD_LETTER: &str = "dead_letter";
}

/// Queue names
pub mod queues {
    pub const CONFIG: &str = "config_queue";
    pub const HANDLER: &str = "handler_queue";
    pub const EXECUTION_ALGORITHM: &str = "execution_algorithm_queue";
    pub const EXECUTION_VISUALIZATION: &str = "execution_visualization_queue";
    pub const NOTIFICATIONS: &str = "notifications_queue";
    pub const RESULTS: &str = "results_queue";
    pub const PROGRESS: &str = "progress_queue";
    pub const DEAD_LETTER: &str = "dead_letter_queue";
}

/// Routing keys
pub mod routing_keys {
    pub const CONFIG_CREATE: &str = "config.create";
    pub const HANDLER_START: &str = "handler.start";
    pub const EXECUTION_ALGORITHM: &str = "execution.algorithm";
    pub const EXECUTION_VISUALIZATION: &str = "execution.visualization";
    pub const NOTIFY_HANDLER: &str = "notify.handler";
    pub const RESULTS_DONE: &str = "results.done";
    pub const PROGRESS_UPDATE: &str = "progress.update";
    pub const DEAD_LETTER: &str = "dead.letter";
}

/// Queue argument keys understood by the broker
pub mod queue_arguments {
    pub const DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
    pub const DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
}

/// Envelope status literals as they appear on the wire
pub const STATUS_OK: &str = "OK";
pub const STATUS_ERROR: &str = "ERROR";

/// Connection attempts before the Connection Manager gives up
pub const MAX_RETRIES: u32 = 5;

/// Fixed delay between connection attempts
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Per-message time-to-live applied by the publisher (milliseconds)
pub const MESSAGE_TTL_MS: u64 = 5000;

/// AMQP delivery mode for persistent messages
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Default consumer prefetch window
pub const DEFAULT_PREFETCH: u16 = 10;

/// Upper bound on the visualization render pool regardless of core count
pub const MAX_RENDER_WORKERS: usize = 8;

/// Default heartbeat interval negotiated with the broker (seconds)
pub const DEFAULT_HEARTBEAT_SECONDS: u16 = 600;

/// Default timeout for a blocked connection attempt (seconds)
pub const DEFAULT_BLOCKED_TIMEOUT_SECONDS: u64 = 300;

/// Short variable codes used by the numerical executable
pub fn variable_code(variable_name: &str) -> Option<&'static str> {
    match variable_name {
        "geopotential" => Some("z"),
        "temperature" => Some("t"),
        "u-component_of_wind" => Some("u"),
        _ => None,
    }
}
