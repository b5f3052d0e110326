//! # engine
//!
//! The trading reactors and the broker seam they share.
//!
//! - [`spike`] — tick-driven, one-shot BUY per symbol
//! - [`cutoff`] — clock-driven, per-account liquidation
//! - [`sync`] — periodic broker → position store mirror
//!
//! Reactors read the bus and the stores; none of them writes ticks.

pub mod clock;
pub mod cutoff;
pub mod executor;
pub mod spike;
pub mod sync;
