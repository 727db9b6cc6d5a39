//! Composer configuration.

use memalias_common::{Result, error::Error};

/// Number of times a free address range is probed and claimed before giving up.
pub const DEFAULT_MAX_ATTEMPTS: usize = 128;

/// Extra pages reserved around the shared window, so that its page-aligned start
/// still fits inside a reservation that begins at an arbitrary guest address.
pub const DEFAULT_MARGIN_PAGES: usize = 2;

/// Size of a WebAssembly linear-memory page.
pub const WASM_PAGE_SIZE: usize = 64 * 1024;

/// Configuration for splicing a shared segment into guest memory.
#[derive(Debug, Clone)]
pub struct ComposerConfig {
    /// Maximum number of probe-and-claim attempts for the composed address range.
    pub max_attempts: usize,
    /// Number of whole host pages added to the guest reservation as slack.
    pub margin_pages: usize,
    /// Size in bytes of one guest memory page; the composed range spans
    /// `pages * guest_page_size` bytes.
    pub guest_page_size: usize,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            margin_pages: DEFAULT_MARGIN_PAGES,
            guest_page_size: WASM_PAGE_SIZE,
        }
    }
}

impl ComposerConfig {
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_margin_pages(mut self, margin_pages: usize) -> Self {
        self.margin_pages = margin_pages;
        self
    }

    pub fn with_guest_page_size(mut self, guest_page_size: usize) -> Self {
        self.guest_page_size = guest_page_size;
        self
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// At least one attempt and one margin page are required: without slack the
    /// aligned window can't be guaranteed to fit inside an unaligned reservation.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::invalid_arg(
                "max_attempts",
                "must be greater than 0",
            ));
        }
        if self.margin_pages == 0 {
            return Err(Error::invalid_arg(
                "margin_pages",
                "must be greater than 0",
            ));
        }
        if self.guest_page_size == 0 || !self.guest_page_size.is_power_of_two() {
            return Err(Error::invalid_arg(
                "guest_page_size",
                "must be a power of two",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ComposerConfig::default();
        assert_eq!(config.max_attempts, 128);
        assert_eq!(config.margin_pages, 2);
        assert_eq!(config.guest_page_size, 65536);
        config.validate().expect("default config");
    }

    #[test]
    fn test_invalid_configs() {
        let base = ComposerConfig::default();
        assert!(base.clone().with_max_attempts(0).validate().is_err());
        assert!(base.clone().with_margin_pages(0).validate().is_err());
        assert!(base.clone().with_guest_page_size(0).validate().is_err());
        assert!(base.with_guest_page_size(3000).validate().is_err());
    }
}
