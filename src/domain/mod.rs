// Domain layer: payload model and ports. No I/O here.

pub mod model;
pub mod ports;
