pub mod config;
pub mod console;
pub mod devnet;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod program;
pub mod rpc;
pub mod session;
pub mod sync;
pub mod view;
pub mod wallet;

pub use dispatch::{
    Action,
    ActionDispatcher,
    ActionKind,
    ActionOutcome,
    ActionState,
    FeeSchedule,
};
pub use error::{
    ClientError,
    Result,
};
pub use session::{
    Session,
    SessionSettings,
    SessionStatus,
};
