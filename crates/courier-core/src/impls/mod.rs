//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: テスト・デモ用の正本
//! - **SqliteTaskStore**: 再起動を跨いでタスクを保持する正本
//! - **InMemoryPlatform**: 開発用のメッセージングプラットフォーム
//! - **stages**: 組み込みの変換ステージ
//!
//! 実プラットフォーム（Telegram など）のアダプタはこのクレートの外側に置きます。

pub mod inmem_platform;
pub mod inmem_store;
pub mod sqlite_store;
pub mod stages;

pub use self::inmem_platform::{DestinationBehavior, InMemoryPlatform};
pub use self::inmem_store::InMemoryTaskStore;
pub use self::sqlite_store::SqliteTaskStore;
pub use self::stages::{
    ButtonsToTextStage, CleanStage, HeaderFooterStage, LabelTranslator, RemoveLineNumbersStage,
    RemoveLinesStage, ReplaceStage, StyleRewriter, TextWatermarkStage,
};
