#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use mcp::ProviderConfig;
use runtime::{Error, Generator, Result, SupervisorConfig};

pub fn calc_provider(name: &str) -> ProviderConfig {
    ProviderConfig::new(name, env!("CARGO_BIN_EXE_calc-provider"))
}

pub fn fast_settings() -> SupervisorConfig {
    SupervisorConfig {
        probe_interval: Duration::from_millis(100),
        restart_backoff: Duration::from_millis(50),
        request_timeout: Duration::from_secs(5),
    }
}

/// Generator that replays canned responses in order.
pub struct Scripted {
    replies: Mutex<VecDeque<String>>,
}

impl Scripted {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
        }
    }
}

impl Generator for Scripted {
    async fn generate(&self, _prompt: &str) -> Result<String> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Generation("script exhausted".into()))
    }
}
