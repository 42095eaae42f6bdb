pub mod delivery;
pub mod error;
pub mod gateway;
pub mod segment;

pub use delivery::{DeliveryManager, DeliveryOutcome};
pub use error::{ContextError, DeliveryError};
pub use gateway::{ContextMessage, ContextProvider, DeliveryGateway, OutboundContent};
