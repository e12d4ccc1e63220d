//! Platform radio backends

mod bluest_radio;

pub use bluest_radio::BluestRadio;
