pub mod mime;
pub mod paths;
pub mod range;
