//! Optional per-instrument HMM parameter persistence for warm restarts
//! (spec §6). No teacher file covers this directly; the shape follows the
//! rest of the engine's `serde_json` usage for its other on-disk formats
//! (signals, replay logs).

use std::path::{Path, PathBuf};

use quantis_core::{Instrument, QuantisError};

use crate::hmm::Theta;

/// Directory-backed checkpoint store: one `<instrument>.json` file per
/// instrument under `dir`.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, instrument: &Instrument) -> PathBuf {
        self.dir.join(format!("{}.json", instrument.as_str()))
    }

    /// Load a previously checkpointed `Theta`, if one exists. Absence is not
    /// an error — the caller falls back to `Theta::weakly_informative_prior`.
    pub fn load(&self, instrument: &Instrument) -> Result<Option<Theta>, QuantisError> {
        let path = self.path_for(instrument);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).map_err(QuantisError::Io)?;
        let theta: Theta = serde_json::from_str(&content)?;
        Ok(Some(theta))
    }

    /// Persist `theta` for `instrument`, creating the checkpoint directory
    /// if needed. Writes to a temp file and renames, so a crash mid-write
    /// never leaves a truncated checkpoint behind.
    pub fn save(&self, instrument: &Instrument, theta: &Theta) -> Result<(), QuantisError> {
        std::fs::create_dir_all(&self.dir).map_err(QuantisError::Io)?;
        let path = self.path_for(instrument);
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(theta)?;
        std::fs::write(&tmp_path, content).map_err(QuantisError::Io)?;
        std::fs::rename(&tmp_path, &path).map_err(QuantisError::Io)?;
        Ok(())
    }

    pub fn exists(&self, instrument: &Instrument) -> bool {
        Path::new(&self.path_for(instrument)).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmm::Theta;

    #[test]
    fn round_trips_theta_through_disk() {
        let dir = std::env::temp_dir().join(format!("quantis-checkpoint-test-{}", std::process::id()));
        let store = CheckpointStore::new(&dir);
        let instrument = Instrument::from("BTC-USDT");
        let theta = Theta::weakly_informative_prior(3).unwrap();

        store.save(&instrument, &theta).unwrap();
        assert!(store.exists(&instrument));

        let loaded = store.load(&instrument).unwrap().unwrap();
        assert_eq!(loaded.k, theta.k);
        assert_eq!(loaded.nu, theta.nu);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_checkpoint_returns_none() {
        let dir = std::env::temp_dir().join(format!("quantis-checkpoint-missing-{}", std::process::id()));
        let store = CheckpointStore::new(&dir);
        let instrument = Instrument::from("ETH-USDT");
        assert!(store.load(&instrument).unwrap().is_none());
    }
}
