#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ferry_api::message::SubscriptionMode;
use ferry_engine::config::RelayConfig;
use ferry_engine::loopback::LoopbackBroker;
use ferry_engine::Relay;

/// Config with short timeouts and fast reconnects.
pub fn fast_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.lifecycle.connect_timeout_ms = 500;
    config.lifecycle.change_timeout_ms = 500;
    config.lifecycle.publish_timeout_ms = 500;
    config.lifecycle.reconnect.initial_delay_ms = 10;
    config.lifecycle.reconnect.max_delay_ms = 40;
    config.lifecycle.reconnect.max_attempts = 5;
    config
}

pub fn relay_with(config: RelayConfig, mode: SubscriptionMode) -> (Relay, Arc<LoopbackBroker>) {
    let broker = Arc::new(LoopbackBroker::new(mode));
    let relay = Relay::new(config, broker.clone()).unwrap();
    (relay, broker)
}

pub fn relay(mode: SubscriptionMode) -> (Relay, Arc<LoopbackBroker>) {
    relay_with(fast_config(), mode)
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
