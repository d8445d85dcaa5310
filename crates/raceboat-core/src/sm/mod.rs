//! One module per cooperating state machine (§4 of the design doc). Each
//! module is deliberately minimal: a `State` enum, an `Event` enum, and a
//! pure `transition` table. Side effects ("enter" actions that call a
//! plugin or complete a user callback) live in `crate::manager`, which is
//! the only place that can see both a context and the rest of the world —
//! per the design note, no virtual dispatch, just tagged variants and a
//! lookup table.

pub mod bootstrap_dial;
pub mod bootstrap_listen;
pub mod bootstrap_pre_conduit;
pub mod conduit;
pub mod connection;
pub mod dial;
pub mod listen;
pub mod pre_conduit;
pub mod recv;
pub mod resume;
pub mod send;
pub mod send_receive;
