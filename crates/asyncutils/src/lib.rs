//! Small async building blocks shared across the rangedb crates.
//!
//! - [`SingleFlight`] collapses concurrent requests for the same key into a
//!   single unit of work whose result every caller receives.
//! - [`Throttle`] rate-limits periodic notifications such as progress events.

mod singleflight;
mod throttle;

pub use crate::singleflight::{Abandoned, FlightSnapshot, SingleFlight};
pub use crate::throttle::Throttle;
