//! `vela-cards`: keyword/value card buffers.
//!
//! Block headers and the status area are flat text buffers of 80-character
//! records ("cards"): an 8-character right-padded key, `= `, then the
//! value, space-padded to 80 columns. The record `END` terminates the
//! dictionary. The format is shared between processes, so the physical
//! layout never changes; everything above it goes through typed puts and
//! gets.
//!
//! String values are single-quoted so they round-trip with leading or
//! trailing blanks intact. Integers and doubles are right-justified in a
//! 20-column value field.

mod cards;
mod params;

pub use cards::{CARD_LEN, Cards, CardsError};
pub use params::{ObsParams, SubintParams};
