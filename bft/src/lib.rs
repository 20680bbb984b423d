pub mod engine;
pub mod error;
pub mod forth;
pub mod image;
pub mod ir;
pub mod lift;
pub mod scan;

pub use engine::{Engine, Tape};
pub use error::Error;
pub use image::Image;
pub use lift::{lift, CodePlanter, Flags};
