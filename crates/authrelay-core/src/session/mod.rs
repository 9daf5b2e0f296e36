//! Session renewal.
//!
//! When a request comes back 401 the dispatcher hands it to the
//! `RenewalCoordinator`, which makes sure exactly one refresh call is in
//! flight, parks every other request that fails meanwhile, and replays them
//! in arrival order once the new access token is stored. A failed refresh
//! clears the credential store and emits `SessionEvent::Terminated` so the
//! front end can send the user back to login.

pub mod coordinator;
pub mod events;
pub mod transport;

pub use coordinator::{RenewalCoordinator, RenewalPhase, Replay};
pub use events::SessionEvent;
pub use transport::{HttpSessionTransport, RenewedTokens, SessionTransport};
