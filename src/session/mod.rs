//! Session domain types.

mod models;

pub use models::{
    Creator, Interaction, Session, SessionFilter, SessionMode, SessionSummary, SessionType,
};
