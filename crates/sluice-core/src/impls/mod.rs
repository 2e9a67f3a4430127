//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryLedger**: outbox ストア（filtered index 2 本を模倣）
//! - **InMemoryBroker**: partition 付き topic + consumer group
//!
//! SQL / 実ブローカー向けの実装は別クレートに置く想定。SQL 側は
//! `domain::schema` の SQL をそのまま使う。

pub mod inmem_broker;
pub mod inmem_ledger;

pub use self::inmem_broker::{InMemoryBroker, PublishedMessage};
pub use self::inmem_ledger::InMemoryLedger;
