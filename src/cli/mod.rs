//! Shared CLI utilities for the strata-session binary tools.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::SessionError;
use crate::tensor::{Tensor, TensorDtype};

/// Initialize tracing/logging to stderr.
///
/// If `disable` is true, no output is produced.
/// Otherwise respects `RUST_LOG` env var, defaulting to WARN.
pub fn init_logging(disable: bool) {
    use tracing_subscriber::EnvFilter;

    if disable {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// One array in an inputs file.
#[derive(Debug, Deserialize)]
struct InputArray {
    shape: Vec<usize>,
    data: Vec<f64>,
    #[serde(default)]
    dtype: Option<String>,
}

impl InputArray {
    fn into_tensor(self, name: &str) -> Result<Tensor, SessionError> {
        let n: usize = self.shape.iter().product();
        if n != self.data.len() {
            return Err(SessionError::shape(name, &[n], &[self.data.len()]));
        }
        let dtype = match self.dtype.as_deref() {
            None => TensorDtype::F32,
            Some(s) => TensorDtype::from_name(s).ok_or_else(|| {
                SessionError::Config(format!("input '{}': unknown dtype '{}'", name, s))
            })?,
        };
        Ok(match dtype {
            TensorDtype::F32 => Tensor::new(self.shape, self.data.iter().map(|&v| v as f32).collect()),
            TensorDtype::I32 => Tensor::from_i32(self.shape, self.data.iter().map(|&v| v as i32).collect()),
            TensorDtype::Bool => Tensor::from_bool(self.shape, self.data.iter().map(|&v| v != 0.0).collect()),
            TensorDtype::F16 => Tensor::from_f16(
                self.shape,
                self.data
                    .iter()
                    .map(|&v| half::f16::from_f64(v).to_bits())
                    .collect(),
            ),
        })
    }
}

/// Load placeholder values from a JSON object of
/// `{"name": {"shape": [..], "data": [..], "dtype": "f32"}}`.
///
/// `dtype` is optional and defaults to f32.
pub fn read_inputs(path: &Path) -> Result<HashMap<String, Tensor>, SessionError> {
    let text = std::fs::read_to_string(path)?;
    let raw: HashMap<String, InputArray> = serde_json::from_str(&text)?;
    raw.into_iter()
        .map(|(name, array)| {
            let tensor = array.into_tensor(&name)?;
            Ok((name, tensor))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("inputs.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_read_inputs_defaults_to_f32() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, r#"{"x": {"shape": [2, 2], "data": [1, 2, 3, 4]}}"#);
        let inputs = read_inputs(&path).unwrap();
        let x = &inputs["x"];
        assert_eq!(x.shape(), &[2, 2]);
        assert_eq!(x.dtype(), TensorDtype::F32);
        assert_eq!(x.as_f32(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_read_inputs_with_dtypes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"{
                "p": {"shape": [1], "data": [1], "dtype": "bool"},
                "k": {"shape": [3], "data": [1, -2, 3], "dtype": "i32"}
            }"#,
        );
        let inputs = read_inputs(&path).unwrap();
        assert_eq!(inputs["p"].as_bool(), &[true]);
        assert_eq!(inputs["k"].as_i32(), &[1, -2, 3]);
    }

    #[test]
    fn test_read_inputs_element_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, r#"{"x": {"shape": [3], "data": [1, 2]}}"#);
        assert!(matches!(
            read_inputs(&path),
            Err(SessionError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_read_inputs_unknown_dtype() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, r#"{"x": {"shape": [1], "data": [1], "dtype": "q4"}}"#);
        assert!(matches!(read_inputs(&path), Err(SessionError::Config(_))));
    }

    #[test]
    fn test_read_inputs_bad_json_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "{not json");
        assert!(matches!(read_inputs(&path), Err(SessionError::Json(_))));
        assert!(matches!(
            read_inputs(Path::new("/nonexistent/inputs.json")),
            Err(SessionError::Io(_))
        ));
    }

    #[test]
    fn test_init_logging_disabled_does_not_panic() {
        init_logging(true);
    }
}
