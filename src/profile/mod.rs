mod encode;

pub use encode::{decode_profile, encode_profile, gunzip, gzip};
