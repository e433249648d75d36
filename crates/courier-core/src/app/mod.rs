//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせて転送エンジンを実装します。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: エンジンの構築とワイヤリング（起動時検証）
//! - **Engine**: ダッシュボード API の表面
//! - **TaskRegistry**: タスク定義とライフサイクル
//! - **Listener**: 購読・重複排除・取り込みキュー
//! - **Pipeline**: フィルタと変換ステージ
//! - **Dispatcher**: リトライ付き配送、自動一時停止の失敗ウィンドウ
//! - **ReleaseBuffer**: 並行配送の結果を送信元順に放出
//! - **CounterAggregator / AnalyticsCollector**: カウンタと配送試行ログ
//! - **WorkerLoop**: Active なタスクごとの実行単位

pub mod analytics;
pub mod builder;
pub mod counters;
pub mod dispatcher;
pub mod listener;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod sequencer;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::analytics::{AnalyticsCollector, AttemptStats};
pub use self::builder::{BuildError, EngineBuilder};
pub use self::counters::{CounterAggregator, CounterSnapshot};
pub use self::dispatcher::{DeliveryReport, Dispatcher};
pub use self::pipeline::{Pipeline, PipelineOutput, StageSet, StageSetError};
pub use self::registry::TaskRegistry;
pub use self::retry::RetryPolicy;
pub use self::runtime::Engine;
pub use self::status::{EngineStatus, TaskStatusView};
