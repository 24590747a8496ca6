//! Venue abstraction for the hedging core.
//!
//! The core talks to two venues through [`VenueAdapter`]:
//! - the local spot venue, quoting coins and the stable coin in local currency
//! - the derivative venue, quoting linear perpetuals settled in the stable coin
//!
//! [`MockVenue`] is an in-process paper venue used for dry runs and tests.

mod error;
pub mod mock;
mod traits;
mod types;

pub use error::{VenueError, VenueResult};
pub use mock::{MockVenue, PaperFill, PaperScenario, PaperWorld};
#[cfg(test)]
pub use traits::MockVenueAdapter;
pub use traits::{contract_size, short_position, VenueAdapter};
pub use types::*;
