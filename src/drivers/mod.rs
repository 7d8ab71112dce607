//! Instrument drivers.

pub mod cryocon;
