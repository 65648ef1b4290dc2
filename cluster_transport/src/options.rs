//! Per-request and per-response options.

use std::time::Duration;

/// Options for an outbound request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// `None` waits indefinitely; no timeout task is armed.
    pub timeout: Option<Duration>,
    pub compress: bool,
}

impl RequestOptions {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            timeout: None,
            compress: false,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn with_timeout_ms(self, millis: u64) -> Self {
        self.with_timeout(Duration::from_millis(millis))
    }

    #[must_use]
    pub const fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }
}

/// Options for a response sent from a handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseOptions {
    pub compress: bool,
}

impl ResponseOptions {
    #[must_use]
    pub const fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_options_builder() {
        let opts = RequestOptions::new().with_timeout_ms(100).with_compress(true);
        assert_eq!(opts.timeout, Some(Duration::from_millis(100)));
        assert!(opts.compress);
        assert_eq!(RequestOptions::default().timeout, None);
    }
}
