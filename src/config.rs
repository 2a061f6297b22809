//! JSON configuration file helpers

use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Read and parse a JSON configuration file; missing fields take defaults
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_str(&text)
        .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))
}

/// Durations stored as integer milliseconds
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        #[serde(with = "millis")]
        wait: Duration,
    }

    fn temp_file(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "sockws-{}-{}-{}.json",
            name,
            std::process::id(),
            rand::random::<u32>()
        ));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_millisecond_durations() {
        let path = temp_file("ok", r#"{"name": "x", "wait": 1500}"#);
        let sample: Sample = load_json(&path).unwrap();
        assert_eq!(sample.wait, Duration::from_millis(1500));
        assert_eq!(serde_json::to_string(&sample).unwrap(), r#"{"name":"x","wait":1500}"#);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn malformed_and_missing_files_are_config_errors() {
        let path = temp_file("bad", "{ not json");
        assert!(matches!(load_json::<Sample>(&path), Err(Error::Config(_))));
        fs::remove_file(&path).unwrap();
        assert!(matches!(load_json::<Sample>(&path), Err(Error::Config(_))));
    }
}
