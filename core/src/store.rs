use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Filesystem-backed key/value store: one file per key under `root`.
#[derive(Clone)]
pub struct FsKv {
    root: PathBuf,
}

/// Minimal key/value interface over byte keys and values.
pub trait Kv: Clone + Send + Sync + 'static {
    /// Get value bytes for `key`, if present.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    /// Set value bytes for `key`, overwriting if it exists.
    fn put(&self, key: &[u8], val: &[u8]) -> Result<()>;
    /// Delete `key`; returns `true` if a value existed.
    fn delete(&self, key: &[u8]) -> bool;
}

/// Serde helpers layered on top of any [`Kv`] implementation.
pub trait KvSerde: Kv {
    /// Deserialize type `T` stored at `key` using `bincode`.
    fn get_t<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get(key) {
            Some(bytes) => {
                let v = bincode::deserialize::<T>(&bytes)
                    .with_context(|| "bincode deserialize")?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }
    /// Serialize `val` with `bincode` and store at `key`.
    fn put_t<T: Serialize>(&self, key: &[u8], val: &T) -> Result<()> {
        let buf = bincode::serialize(val).with_context(|| "bincode serialize")?;
        self.put(key, &buf)
    }
}
impl<T: Kv> KvSerde for T {}

/// Default KV type exported by this crate (FS-backed).
pub type DefaultKv = FsKv;

/// Open an FS-backed KV rooted at `dir` (created if missing).
pub fn open_default<P: AsRef<Path>>(dir: P) -> Result<DefaultKv> {
    let root = dir.as_ref().to_path_buf();
    fs::create_dir_all(&root)
        .with_context(|| format!("create kv dir {}", root.display()))?;
    Ok(FsKv { root })
}

/// Build a namespaced key as bytes: `"{ns}:{key}"`.
pub fn ns(ns: &str, key: &str) -> Vec<u8> {
    format!("{ns}:{key}").into_bytes()
}

/// Keys used by the ping daemon.
pub mod keys {
    use super::ns;

    /// Generated device id, kept so the id survives restarts.
    pub fn device_id() -> Vec<u8> {
        ns("device", "id")
    }

    /// Last observed status of the job called `job`.
    pub fn last_status(job: &str) -> Vec<u8> {
        ns("jobs", &format!("{job}:status"))
    }
}

impl FsKv {
    /// Directory holding the value files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &[u8]) -> PathBuf {
        // Arbitrary key bytes map to a hex file name.
        let name: String = key.iter().map(|b| format!("{b:02x}")).collect();
        self.root.join(name)
    }
}

impl Kv for FsKv {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        fs::read(self.path_for(key)).ok()
    }

    fn put(&self, key: &[u8], val: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        // Write temp then rename so readers never see a half-written value.
        let tmp = path.with_extension("tmp");
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(val).with_context(|| format!("write {}", tmp.display()))?;
        f.sync_all().ok();
        fs::rename(&tmp, &path).with_context(|| format!("rename to {}", path.display()))?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> bool {
        fs::remove_file(self.path_for(key)).is_ok()
    }
}
