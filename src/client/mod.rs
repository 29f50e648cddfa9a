#![forbid(unsafe_code)]

// Client side: clock offset estimation, drift correction and the session that wires them

pub mod clock;
pub mod player;
pub mod session;
pub mod sync_engine;

pub use clock::ClockSync;
pub use player::{Player, PlayerEvent, PlayerKind, SimulatedPlayer};
pub use session::{ClientEvent, SyncClient};
pub use sync_engine::{Correction, CorrectionAction, SyncConfig, SyncEngine, SyncPhase};
