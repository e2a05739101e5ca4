//! 可观测性：全局 tracing 订阅器
//!
//! 默认级别 info（--verbose 时为 debug），RUST_LOG 存在时以其为准；json=true 输出 NDJSON。
//! 重复调用只有第一次生效。

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init(verbose: bool, json: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init(false, false);
        init(true, true);
        tracing::info!("still logging");
    }
}
