//! Checkpoint location and (de)serialization.
//!
//! Checkpoints are safetensors archives of little-endian `f32` tensors keyed
//! by parameter name. They are written once by training (or `pix2pix init`)
//! and only ever read by the service.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::{Dtype, SafeTensors, View};

use crate::error::{Error, Result};

/// File extension of checkpoint archives.
pub const CHECKPOINT_EXTENSION: &str = "safetensors";

/// Where a named checkpoint lives: `<root>/<model>/<id>.safetensors`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointLocation {
    pub root: PathBuf,
    pub model: String,
    pub id: String,
}

impl Default for CheckpointLocation {
    fn default() -> Self {
        Self {
            root: PathBuf::from("checkpoints"),
            model: "pix2pix".to_string(),
            id: "ckpt-40".to_string(),
        }
    }
}

impl CheckpointLocation {
    /// Create a location from its parts.
    pub fn new(root: impl Into<PathBuf>, model: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            model: model.into(),
            id: id.into(),
        }
    }

    /// Path of the checkpoint archive.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.root
            .join(&self.model)
            .join(format!("{}.{CHECKPOINT_EXTENSION}", self.id))
    }
}

/// An in-memory set of named parameter tensors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checkpoint {
    tensors: HashMap<String, ArrayD<f32>>,
}

impl Checkpoint {
    /// Create an empty checkpoint.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a checkpoint archive from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist, cannot be read, is not a
    /// valid archive, or holds tensors that are not `f32`.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(Error::CheckpointMissing {
                path: path.to_path_buf(),
            });
        }

        let bytes = fs::read(path).map_err(|source| Error::CheckpointRead {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_bytes(&bytes)
    }

    /// Parse a checkpoint from archive bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid archive of `f32` tensors.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let archive =
            SafeTensors::deserialize(bytes).map_err(|source| Error::CheckpointFormat { source })?;

        let mut tensors = HashMap::with_capacity(archive.len());

        for (name, view) in archive.tensors() {
            if view.dtype() != Dtype::F32 {
                return Err(Error::ParameterDtype {
                    name,
                    dtype: format!("{:?}", view.dtype()),
                });
            }

            let values: Vec<f32> = view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();

            let tensor = ArrayD::from_shape_vec(IxDyn(view.shape()), values)?;
            tensors.insert(name, tensor);
        }

        Ok(Self { tensors })
    }

    /// Serialize to archive bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut entries: Vec<(&str, Encoded)> = self
            .tensors
            .iter()
            .map(|(name, tensor)| (name.as_str(), Encoded::new(tensor)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        safetensors::serialize(entries.iter().map(|(name, e)| (*name, e)), &None)
            .map_err(|source| Error::CheckpointFormat { source })
    }

    /// Write the checkpoint to disk, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to a temporary file first, then rename for atomicity
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, self.to_bytes()?)?;
        fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Add or replace a parameter.
    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Look up a parameter by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    /// Remove a parameter, checking it has exactly the expected shape.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingParameter`] or [`Error::ParameterShape`].
    pub fn take(&mut self, name: &str, expected: &[usize]) -> Result<ArrayD<f32>> {
        let tensor = self
            .tensors
            .remove(name)
            .ok_or_else(|| Error::MissingParameter {
                name: name.to_string(),
            })?;

        if tensor.shape() != expected {
            return Err(Error::ParameterShape {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual: tensor.shape().to_vec(),
            });
        }

        Ok(tensor)
    }

    /// Names of all parameters, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// A tensor flattened to little-endian bytes for serialization.
struct Encoded {
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl Encoded {
    fn new(tensor: &ArrayD<f32>) -> Self {
        let bytes = tensor.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self {
            shape: tensor.shape().to_vec(),
            bytes,
        }
    }
}

impl View for &Encoded {
    fn dtype(&self) -> Dtype {
        Dtype::F32
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.bytes)
    }

    fn data_len(&self) -> usize {
        self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample() -> Checkpoint {
        let mut checkpoint = Checkpoint::new();
        checkpoint.insert("head.conv.bias", array![0.5f32, -0.25, 1.0].into_dyn());
        checkpoint.insert(
            "encoder.0.conv.kernel",
            ArrayD::from_shape_fn(IxDyn(&[2, 2, 1, 3]), |ix| ix[0] as f32 - ix[3] as f32),
        );
        checkpoint
    }

    #[test]
    fn test_location_path() {
        let location = CheckpointLocation::default();
        assert_eq!(
            location.path(),
            Path::new("checkpoints/pix2pix/ckpt-40.safetensors")
        );

        let custom = CheckpointLocation::new("/srv/models", "facades", "ckpt-7");
        assert_eq!(custom.path(), Path::new("/srv/models/facades/ckpt-7.safetensors"));
    }

    #[test]
    fn test_write_then_read_preserves_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ckpt.safetensors");

        let checkpoint = sample();
        checkpoint.write(&path).unwrap();

        let restored = Checkpoint::read(&path).unwrap();
        assert_eq!(restored, checkpoint);
        assert_eq!(restored.names(), ["encoder.0.conv.kernel", "head.conv.bias"]);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Checkpoint::read(dir.path().join("absent.safetensors")).unwrap_err();
        assert!(matches!(err, Error::CheckpointMissing { .. }));
    }

    #[test]
    fn test_corrupt_file() {
        assert!(matches!(
            Checkpoint::from_bytes(b"\x01\x02 not an archive"),
            Err(Error::CheckpointFormat { .. })
        ));
    }

    #[test]
    fn test_take_checks_shape() {
        let mut checkpoint = sample();

        let err = checkpoint.take("head.conv.bias", &[4]).unwrap_err();
        assert!(matches!(err, Error::ParameterShape { .. }));

        let err = checkpoint.take("decoder.0.conv.kernel", &[4]).unwrap_err();
        assert!(matches!(err, Error::MissingParameter { .. }));

        let kernel = checkpoint.take("encoder.0.conv.kernel", &[2, 2, 1, 3]).unwrap();
        assert_eq!(kernel[[1, 0, 0, 0]], 1.0);
        assert!(checkpoint.get("encoder.0.conv.kernel").is_none());
    }
}
