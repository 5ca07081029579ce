mod md5;
mod sniff;
mod transparency;

pub use md5::{calculate_md5, calculate_md5_of_file};
pub use sniff::{SniffedTile, gzip_encode, is_gzip_magic, sniff};
pub use transparency::is_fully_transparent_png;
