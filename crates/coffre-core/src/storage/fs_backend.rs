use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use coffre_protocol::{ByteRange, ResourceKind};
use coffre_types::{CoffreError, Mac, Result};

const CONFIG_FILE: &str = "CONFIG";

/// Local filesystem store.
///
/// Layout: `CONFIG` at the root, then one directory per resource kind.
/// Packfiles are sharded by their first byte (`packfiles/ab/<hex>`);
/// other kinds are flat.
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
    location: String,
}

impl FsStore {
    pub fn new(path: &str) -> Self {
        FsStore {
            root: PathBuf::from(path),
            location: path.to_string(),
        }
    }

    fn blob_path(&self, kind: ResourceKind, mac: Mac) -> PathBuf {
        match kind {
            ResourceKind::Packfile | ResourceKind::EccPackfile => self
                .root
                .join(kind.as_str())
                .join(mac.shard_prefix())
                .join(mac.to_hex()),
            _ => self.root.join(kind.as_str()).join(mac.to_hex()),
        }
    }

    fn kind_dir(&self, kind: ResourceKind) -> PathBuf {
        self.root.join(kind.as_str())
    }
}

impl super::Store for FsStore {
    fn location(&self) -> &str {
        &self.location
    }

    fn open(&self) -> Result<Vec<u8>> {
        fs::read(self.root.join(CONFIG_FILE)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoffreError::RepoNotFound(self.location.clone())
            } else {
                CoffreError::Io(e)
            }
        })
    }

    fn create(&self, config: &[u8]) -> Result<()> {
        let config_path = self.root.join(CONFIG_FILE);
        if config_path.exists() {
            return Err(CoffreError::RepoAlreadyExists(self.location.clone()));
        }
        fs::create_dir_all(&self.root)?;
        for kind in ResourceKind::ALL {
            fs::create_dir_all(self.kind_dir(kind))?;
        }
        write_atomic(&config_path, config)
    }

    fn list(&self, kind: ResourceKind) -> Result<Vec<Mac>> {
        let mut macs = Vec::new();
        let dir = self.kind_dir(kind);
        if !dir.exists() {
            return Ok(macs);
        }
        collect_macs(&dir, &mut macs)?;
        macs.sort();
        Ok(macs)
    }

    fn get(&self, kind: ResourceKind, mac: Mac, range: Option<ByteRange>) -> Result<Vec<u8>> {
        let path = self.blob_path(kind, mac);
        let mut file = fs::File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoffreError::ResourceNotFound(format!("{kind}/{mac}"))
            } else {
                CoffreError::Io(e)
            }
        })?;

        match range {
            None => {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf)?;
                Ok(buf)
            }
            Some(range) => {
                file.seek(SeekFrom::Start(range.offset))?;
                let mut buf = vec![0u8; range.length as usize];
                file.read_exact(&mut buf).map_err(|e| {
                    CoffreError::Storage(format!("short range read on {kind}/{mac}: {e}"))
                })?;
                Ok(buf)
            }
        }
    }

    fn put(&self, kind: ResourceKind, mac: Mac, data: &[u8]) -> Result<u64> {
        let path = self.blob_path(kind, mac);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, data)?;
        Ok(data.len() as u64)
    }

    fn delete(&self, kind: ResourceKind, mac: Mac) -> Result<()> {
        match fs::remove_file(self.blob_path(kind, mac)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                CoffreError::ResourceNotFound(format!("{kind}/{mac}")),
            ),
            Err(e) => Err(CoffreError::Io(e)),
        }
    }

    fn size(&self, kind: ResourceKind, mac: Mac) -> Result<u64> {
        match fs::metadata(self.blob_path(kind, mac)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                CoffreError::ResourceNotFound(format!("{kind}/{mac}")),
            ),
            Err(e) => Err(CoffreError::Io(e)),
        }
    }
}

/// Write via a temp file in the same directory, then rename into place.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let unique = std::process::id() as u64 ^ rand::random::<u64>();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".tmp.{file_name}.{unique:x}"));
    fs::write(&tmp, data)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(CoffreError::Io(e));
    }
    Ok(())
}

fn collect_macs(dir: &Path, out: &mut Vec<Mac>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if path.is_dir() {
            collect_macs(&path, out)?;
        } else if !name.starts_with(".tmp.") {
            if let Some(mac) = Mac::from_hex(&name) {
                out.push(mac);
            }
        }
    }
    Ok(())
}
