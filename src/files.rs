//! Generator checkpoint files. Parameters are safetensors written by `VarMap`; the label
//! maps that give the parameters meaning are stored next to them.

use std::{
    fs,
    path::{Path, PathBuf},
};
#[cfg(feature = "encode")]
use std::{
    fs::File,
    io,
    io::{Read, Write},
};

#[cfg(feature = "encode")]
use bincode::{Decode, Encode};

use crate::{error::Result, relabel::LabelMaps};

pub const CHECKPOINT_DIR: &str = "checkpoint";
pub const SAMPLES_FILE: &str = "samples.csv";

#[cfg(feature = "encode")]
pub const MAPS_FILE: &str = "label_maps.bin";
#[cfg(not(feature = "encode"))]
pub const MAPS_FILE: &str = "label_maps.json";

/// `logdir/checkpoint/epoch_{epoch}.safetensors`
pub fn checkpoint_path(logdir: &Path, epoch: usize) -> PathBuf {
    logdir
        .join(CHECKPOINT_DIR)
        .join(format!("epoch_{epoch}.safetensors"))
}

/// Where the label maps for a checkpoint live: the same directory.
pub fn maps_path(checkpoint: &Path) -> PathBuf {
    match checkpoint.parent() {
        Some(dir) => dir.join(MAPS_FILE),
        None => PathBuf::from(MAPS_FILE),
    }
}

/// Save to file, using Bincode.
#[cfg(feature = "encode")]
pub(crate) fn save<T: Encode>(path: &Path, data: &T) -> io::Result<()> {
    let config = bincode::config::standard();

    let encoded: Vec<u8> = bincode::encode_to_vec(data, config).map_err(io::Error::other)?;

    let mut file = File::create(path)?;
    file.write_all(&encoded)?;
    Ok(())
}

/// Load from file, using Bincode.
#[cfg(feature = "encode")]
pub(crate) fn load<T: Decode<()>>(path: &Path) -> io::Result<T> {
    let mut file = File::open(path)?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;

    load_from_bytes(&buffer)
}

#[cfg(feature = "encode")]
pub(crate) fn load_from_bytes<T: Decode<()>>(buffer: &[u8]) -> io::Result<T> {
    let config = bincode::config::standard();

    match bincode::decode_from_slice(buffer, config) {
        Ok((decoded, _len)) => Ok(decoded),
        Err(e) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Error decoding; did the format change? {e}"),
        )),
    }
}

pub fn save_maps(path: &Path, maps: &LabelMaps) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    #[cfg(feature = "encode")]
    save(path, maps)?;
    #[cfg(not(feature = "encode"))]
    fs::write(path, serde_json::to_vec_pretty(maps)?)?;
    Ok(())
}

pub fn load_maps(path: &Path) -> Result<LabelMaps> {
    #[cfg(feature = "encode")]
    let maps = load(path)?;
    #[cfg(not(feature = "encode"))]
    let maps = serde_json::from_slice(&fs::read(path)?)?;
    Ok(maps)
}
