use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::images::{Image, ImageError};

#[derive(Debug, thiserror::Error)]
pub enum ImageStoreError {
    #[error("image {0} not found")]
    NotFound(u64),

    #[error("image {0} already exists")]
    AlreadyExists(u64),

    #[error("not an image uri of this store: {0}")]
    InvalidUri(String),

    #[error("image error: {0}")]
    Image(#[from] ImageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw image persistence keyed by the vector index's ids.
pub trait ImageStore: Send + Sync {
    /// Store `image` under `id` and return its uri.
    fn insert(&mut self, image: &Image, id: u64) -> Result<String, ImageStoreError>;
    fn get(&self, id: u64) -> Result<Image, ImageStoreError>;
    /// Uri an image with this id has (or would have) in the store.
    fn get_uri(&self, id: u64) -> String;
    fn get_id(&self, uri: &str) -> Result<u64, ImageStoreError>;
    fn has(&self, id: u64) -> bool;
    fn delete(&mut self, id: u64) -> Result<(), ImageStoreError>;
    fn size(&self) -> usize;
    /// All ids, ascending.
    fn ids(&self) -> Vec<u64>;

    fn uris(&self) -> Vec<String> {
        self.ids().into_iter().map(|id| self.get_uri(id)).collect()
    }
}

/// Prefix and suffix of in-flight writes
const TEMP_PREFIX: &str = ".incoming-";
const TEMP_SUFFIX: &str = ".tmp";

/// Directory of `{id}.png` files.
pub struct LocalImageStore {
    base_dir: PathBuf,
    ids: BTreeSet<u64>,
}

impl LocalImageStore {
    pub fn new(base_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(base_dir)?;

        let mut ids = BTreeSet::new();
        for entry in std::fs::read_dir(base_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if Self::is_unfinished_write(&path) {
                log::warn!("Removing unfinished write {}", path.display());
                std::fs::remove_file(&path)?;
                continue;
            }
            if let Some(id) = Self::parse_id(&path) {
                ids.insert(id);
            }
        }

        log::info!("Image directory = {}", base_dir.display());
        log::info!("Found {} images", ids.len());

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            ids,
        })
    }

    fn path_for(&self, id: u64) -> PathBuf {
        self.base_dir.join(format!("{id}.png"))
    }

    fn parse_id(path: &Path) -> Option<u64> {
        if path.extension().and_then(|e| e.to_str()) != Some("png") {
            return None;
        }
        // only the canonical spelling maps back to `path_for(id)`
        let stem = path.file_stem()?.to_str()?;
        let id: u64 = stem.parse().ok()?;
        (id.to_string() == stem).then_some(id)
    }

    fn is_unfinished_write(path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX))
    }
}

impl ImageStore for LocalImageStore {
    fn insert(&mut self, image: &Image, id: u64) -> Result<String, ImageStoreError> {
        if self.has(id) {
            return Err(ImageStoreError::AlreadyExists(id));
        }

        let png = image.encode_png()?;
        let path = self.path_for(id);

        // temp file in the same directory so the rename stays atomic
        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.base_dir)?;
        temp.write_all(&png)?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| e.error)?;

        self.ids.insert(id);
        let uri = self.get_uri(id);
        log::trace!("Inserted image: {uri}, count = {}", self.size());
        Ok(uri)
    }

    fn get(&self, id: u64) -> Result<Image, ImageStoreError> {
        if !self.has(id) {
            return Err(ImageStoreError::NotFound(id));
        }
        let bytes = std::fs::read(self.path_for(id))?;
        Ok(Image::decode(&bytes)?)
    }

    fn get_uri(&self, id: u64) -> String {
        self.path_for(id).to_string_lossy().into_owned()
    }

    fn get_id(&self, uri: &str) -> Result<u64, ImageStoreError> {
        let path = Path::new(uri);
        let in_store = path.parent().is_some_and(|parent| parent == self.base_dir);
        match Self::parse_id(path) {
            Some(id) if in_store => Ok(id),
            _ => Err(ImageStoreError::InvalidUri(uri.to_string())),
        }
    }

    fn has(&self, id: u64) -> bool {
        self.ids.contains(&id)
    }

    fn delete(&mut self, id: u64) -> Result<(), ImageStoreError> {
        if !self.has(id) {
            return Err(ImageStoreError::NotFound(id));
        }
        std::fs::remove_file(self.path_for(id))?;
        self.ids.remove(&id);
        log::trace!("Deleted image: {id}, count = {}", self.size());
        Ok(())
    }

    fn size(&self) -> usize {
        self.ids.len()
    }

    fn ids(&self) -> Vec<u64> {
        self.ids.iter().copied().collect()
    }
}
