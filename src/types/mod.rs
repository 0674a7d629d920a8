pub mod trading;
pub mod candle;
pub mod position;
pub mod market;

pub use trading::*;
pub use candle::*;
pub use position::*;
pub use market::*;
