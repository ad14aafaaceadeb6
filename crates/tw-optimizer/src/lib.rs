//! # tw-optimizer
//!
//! Adaptive search for Tunewright. A [`ParameterOptimizer`] tunes one integer
//! tunable at a time by repeatedly sampling and narrowing an interval, using
//! an [`Objective`] to price each candidate value.

mod objective;
mod search;
mod trial;

pub use objective::{FnObjective, Objective, Probe};
pub use search::{sample_points, ParameterOptimizer, SearchOutcome};
pub use trial::{ProbeRecord, SearchId, SearchPhase, SearchRound, SearchTrace};
