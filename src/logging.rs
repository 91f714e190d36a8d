//! 日志初始化：`RUST_LOG` 优先，默认本服务 info、HTTP 追踪 warn。

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_DIRECTIVES: &str = concat!(env!("CARGO_CRATE_NAME"), "=info,tower_http=warn,info");

/// 初始化 tracing 日志订阅与默认过滤规则。
pub fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
