//! courier-core
//!
//! Core building blocks for the Courier forwarding engine.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, message, stage, filter, attempt, outcome, events, errors）
//! - **ports**: 抽象化レイヤー（MessagingPlatform, TaskStore, Stage, Clock, IdGenerator）
//! - **app**: エンジン本体（registry, listener, pipeline, dispatcher, counters, analytics, worker_loop, runtime, builder）
//! - **impls**: 実装（InMemoryPlatform, InMemoryTaskStore, SqliteTaskStore, 組み込みステージ）
//! - **config**: TOML 設定
//! - **observability**: タスクごとのメトリクスと tracing span

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;

pub use app::{BuildError, Engine, EngineBuilder};
pub use config::EngineConfig;
