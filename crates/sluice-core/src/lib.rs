//! sluice-core
//!
//! Transactional outbox dispatcher: moves committed outbox rows to a broker
//! and writes their lifecycle status back in coalesced batches.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, record, status, schema, errors）
//! - **ports**: 抽象化レイヤー（Ledger, BrokerConnection, BrokerConsumer, Clock, IdGenerator）
//! - **app**: パイプライン（scheduler, broker_pool, coalescer, consumer, dispatcher, status）
//! - **impls**: 実装（InMemoryLedger, InMemoryBroker。開発・テスト用）
//! - **config**: DispatcherConfig

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

#[cfg(test)]
mod tests;

pub use self::app::{ControlHandle, Dispatcher, DispatcherBuilder, DispatcherStatus, ShutdownReport};
pub use self::config::DispatcherConfig;
