//! App - アプリケーション層
//!
//! ports を組み合わせて dispatch パイプラインを実装します。
//!
//! # 主要コンポーネント
//! - **DispatcherBuilder**: 構築とワイヤリング
//! - **DispatchScheduler**: 未送信レコードの poll と投入
//! - **BrokerClientPool**: broker 接続ハンドルと backpressure
//! - **StatusCoalescer**: status 更新のバッチ化と flush loop
//! - **ConsumerGroup**: consumer-group ワーカー
//! - **Dispatcher**: 順序付きシャットダウン
//! - **ControlHandle**: status / pause / resume / force flush

pub mod backoff;
pub mod broker_pool;
pub mod builder;
pub mod coalescer;
pub mod consumer;
pub mod dispatcher;
pub mod scheduler;
pub mod status;

// 主要な型を再エクスポート
pub use self::backoff::PollBackoff;
pub use self::broker_pool::{BrokerClientPool, DrainReport, PendingAck};
pub use self::builder::DispatcherBuilder;
pub use self::coalescer::{CoalescerStats, FlushListener, FlushOutcome, StatusCoalescer};
pub use self::consumer::{
    ConsumerGroup, ConsumerStats, HandlerContext, HandlerError, RecordHandler,
};
pub use self::dispatcher::{Dispatcher, ShutdownReport};
pub use self::scheduler::{DispatchScheduler, InFlightRegistry, SchedulerStats};
pub use self::status::{ControlHandle, DispatcherStatus};
