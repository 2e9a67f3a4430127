//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。外部システム（outbox ストア、
//! メッセージブローカー、時計）へのインターフェース。
//!
//! # 設計原則
//! - outbox ストアが source of truth
//! - ブローカーは at-least-once の配送路（順序保証は partition 内のみ）

pub mod broker;
pub mod clock;
pub mod id_generator;
pub mod ledger;

pub use self::broker::{
    Ack, BrokerConnection, BrokerConnector, BrokerConsumer, ConsumerGroupCoordinator, Delivery,
};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::ledger::{BacklogCounts, BulkUpdateReport, Ledger};
