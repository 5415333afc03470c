//! Coordination of a two-cell inspection run.
//!
//! Two measurement cells execute one logical plan over a best-effort link.
//! The [`coordinator`] correlates requests and completions through the
//! [`ledger`], the [`verify`] classifiers reduce every measurement outcome to
//! a recovery action, and the [`retry`] loop acts on it.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod link;
pub mod net;
pub mod protocol;
pub mod retry;
pub mod verify;
pub mod wait;

mod trace;

pub use config::{CellConfig, CellRole};
pub use coordinator::Coordinator;
pub use error::{CellError, Fault};
pub use trace::init_tracing;
