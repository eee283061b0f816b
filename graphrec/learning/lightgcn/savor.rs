use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
};

use super::model::{LightGcn, ModelError};

/// Checkpoint written to disk by [`CheckpointSavor`].
#[derive(Debug, Clone, PartialEq)]
pub struct SavedCheckpoint {
    /// Epoch the checkpoint was taken after.
    pub epoch: usize,
    /// Training loss at that epoch.
    pub loss: f32,
    /// File location.
    pub path: PathBuf,
}

/// Writes `epoch_<n>.json` checkpoints and keeps only the newest `max_to_keep`.
#[derive(Debug)]
pub struct CheckpointSavor {
    dir: PathBuf,
    max_to_keep: usize,
    saved: VecDeque<SavedCheckpoint>,
}

impl CheckpointSavor {
    /// Creates a savor writing into `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, max_to_keep: usize) -> Self {
        Self {
            dir: dir.into(),
            max_to_keep: max_to_keep.max(1),
            saved: VecDeque::new(),
        }
    }

    /// Target directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Saves the model and evicts the oldest checkpoint beyond capacity.
    pub fn store(
        &mut self,
        model: &LightGcn,
        epoch: usize,
        loss: f32,
    ) -> Result<SavedCheckpoint, ModelError> {
        let path = self.dir.join(format!("epoch_{epoch}.json"));
        model.save(&path)?;
        self.saved.retain(|c| c.path != path);
        let checkpoint = SavedCheckpoint { epoch, loss, path };
        self.saved.push_back(checkpoint.clone());
        while self.saved.len() > self.max_to_keep {
            if let Some(old) = self.saved.pop_front() {
                match fs::remove_file(&old.path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(checkpoint)
    }

    /// Most recent checkpoint.
    #[must_use]
    pub fn latest(&self) -> Option<&SavedCheckpoint> {
        self.saved.back()
    }

    /// Retained checkpoint with the lowest loss.
    #[must_use]
    pub fn best(&self) -> Option<&SavedCheckpoint> {
        self.saved.iter().min_by(|a, b| a.loss.total_cmp(&b.loss))
    }

    /// Retained checkpoints, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &SavedCheckpoint> {
        self.saved.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lightgcn::model::LightGcnConfig;
    use tempfile::tempdir;

    #[test]
    fn keeps_newest_checkpoints_and_tracks_best() {
        let dir = tempdir().unwrap();
        let model = LightGcn::new(2, 3, LightGcnConfig {
            embed_size: 4,
            ..LightGcnConfig::default()
        });
        let mut savor = CheckpointSavor::new(dir.path().join("model"), 2);
        savor.store(&model, 1, 0.2).unwrap();
        savor.store(&model, 2, 0.5).unwrap();
        savor.store(&model, 3, 0.4).unwrap();

        assert!(!dir.path().join("model/epoch_1.json").exists());
        assert!(dir.path().join("model/epoch_3.json").exists());
        assert_eq!(savor.iter().count(), 2);
        assert_eq!(savor.latest().unwrap().epoch, 3);
        assert_eq!(savor.best().unwrap().epoch, 3);
        let restored = LightGcn::load(&savor.latest().unwrap().path).unwrap();
        assert_eq!(restored.embeddings(), model.embeddings());
    }
}
