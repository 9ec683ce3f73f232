pub mod geometry;
pub use geometry::*;

pub mod pixel;
pub use pixel::*;

pub mod restore;
pub use restore::*;

pub mod slice;
pub use slice::*;
