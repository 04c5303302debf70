pub mod candle;
pub mod remap;

// Re-export the canonical data types
pub use candle::{Candle, StreamOrigin};
pub use remap::TimestampRemapper;
