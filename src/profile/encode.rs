use crate::delta::DeltaProfile;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

/// Serializes a delta profile with bincode and gzips the result.
pub fn encode_profile(profile: &DeltaProfile) -> anyhow::Result<Vec<u8>> {
    let raw = bincode::serialize(profile)?;
    gzip(&raw)
}

pub fn decode_profile(data: &[u8]) -> anyhow::Result<DeltaProfile> {
    let raw = gunzip(data)?;
    Ok(bincode::deserialize(&raw)?)
}

pub fn gzip(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn gunzip(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    // gzip magic number
    if data.len() < 2 || data[0] != 0x1f || data[1] != 0x8b {
        anyhow::bail!("payload is not gzip compressed");
    }

    let mut decompressed = Vec::new();
    GzDecoder::new(data).read_to_end(&mut decompressed)?;
    Ok(decompressed)
}
