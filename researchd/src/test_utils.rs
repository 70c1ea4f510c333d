//! Test helpers shared by unit and integration tests.

use url::Url;

use crate::config::{Config, DatabaseConfig, NotifierTransport};

/// Link secret used throughout the tests.
pub const TEST_SECRET: &str = "researchd-test-secret-0123456789abcdef";

/// An in-memory configuration that never reaches a real provider or mail server.
pub fn create_test_config() -> Config {
    let emails_dir = std::env::temp_dir().join(format!("researchd-test-emails-{}", std::process::id()));

    let mut config = Config::default();
    config.database = DatabaseConfig::Memory;
    config.links.secret = Some(TEST_SECRET.to_string());
    config.provider.api_key = Some("sk-test".to_string());
    // Nothing listens on the discard port, so a stray provider call fails fast
    config.provider.base_url = Url::parse("http://127.0.0.1:9/v1").unwrap_or_else(|_| unreachable!("static URL"));
    config.notifier.transport = NotifierTransport::File {
        path: emails_dir.to_string_lossy().into_owned(),
    };
    config
}
