//! # tw-stats
//!
//! Results engine for Tunewright. Noisy, partially censored timing samples
//! are modelled as a normal distribution, and candidates are compared with
//! Welch's t-test over per-size result stores they can share.

pub mod candidate;
pub mod normal;
pub mod results;
pub mod ttest;

pub use candidate::{compare_candidates, Candidate, CandidateId, Comparison, Side};
pub use normal::Normal;
pub use results::{ResultDistribution, ResultSettings, ResultsDb, SharedResults};
pub use ttest::{welch_t_test, welch_t_test_samples, SampleMoments, WelchTest};
