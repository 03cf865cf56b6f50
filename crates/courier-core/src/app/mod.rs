//! App - アプリケーション層
//!
//! ports を組み合わせて dispatch core を実装します。
//!
//! # 主要コンポーネント
//! - **ControllerBuilder**: 設定の検証と Controller の構築
//! - **Controller**: worker の受け入れ、背景タスク、shutdown
//! - **WorkerRegistry**: 接続中 worker と id 採番
//! - **Dispatcher**: submit / broadcast
//! - **Correlator**: 非同期モードの応答対応付け
//! - **Runner**: worker 側の受信・実行・返信ループ
//! - **ReceiveLoop / IdleLoop / ReaperLoop / HeartbeatLoop**: controller の背景ループ

pub mod builder;
pub mod controller;
pub mod correlator;
pub mod dispatcher;
mod heartbeat_loop;
mod idle_loop;
mod reaper_loop;
mod receive_loop;
pub mod registry;
pub mod runner;
pub mod status;

pub use self::builder::{BuildError, ControllerBuilder};
pub use self::controller::Controller;
pub use self::correlator::{Correlator, PendingResponse};
pub use self::dispatcher::{BroadcastReport, Dispatcher};
pub use self::registry::{Worker, WorkerRegistry};
pub use self::runner::Runner;
pub use self::status::{ControllerStatus, WorkerStatus};
