//! 进程级运行时
//!
//! 每个进程构造一个 [`ShutdownCoordinator`]，显式注册需要关闭的生产者、消费者和连接：
//!
//! ```rust,ignore
//! let coordinator = ShutdownCoordinator::install(RuntimeConfig::default())?;
//! let producer = Producer::new(connector, policy, coordinator.scheduler(), settings);
//! coordinator.register(producer.clone());
//!
//! tokio::spawn(async move { coordinator.exit_on_signal().await });
//! ```

pub mod config;
pub mod shutdown;

pub use config::RuntimeConfig;
pub use shutdown::{
    ShutdownCoordinator, ShutdownHandle, ShutdownOutcome, ShutdownReport, consume,
    consume_or_exit,
};
