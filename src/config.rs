use std::env;

/// Default number of entries a stream buffers before dropping new ones.
pub const DEFAULT_MAX_BUFFER: usize = 4096;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub max_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_buffer: DEFAULT_MAX_BUFFER,
        }
    }
}

impl StreamConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(max_buffer) = env::var("FLOWLINE_MAX_BUFFER") {
            if let Ok(n) = max_buffer.parse::<usize>() {
                config.max_buffer = n;
            }
        }

        config
    }
}
