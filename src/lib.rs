// order-lifecycle: Order-group lifecycle engine for bracketed positions
// Tracks entry orders with their protective stop/target pairs from
// registration through fills, level crossings, and closure

pub mod data;
pub mod lifecycle;
pub mod logging;
pub mod orders;
