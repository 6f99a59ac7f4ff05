pub mod cluster;
pub mod cull;
pub mod exif;
pub mod extractor;
pub mod record;
pub mod runner;
pub mod scanner;
