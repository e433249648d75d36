//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（メッセージングプラットフォーム、ストレージ、
//! 変換ステージ）へのインターフェースで、実装の詳細を隠蔽します。

pub mod clock;
pub mod id_generator;
pub mod platform;
pub mod stage;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::platform::{MessagingPlatform, Subscription};
pub use self::stage::Stage;
pub use self::task_store::TaskStore;
