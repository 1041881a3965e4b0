use serde::{Deserialize, Serialize};

use coffre_types::Mac;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    Directory,
    File,
    Symlink,
}

/// Reference to one content chunk of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub mac: Mac,
    pub length: u32,
}

/// One entry of a snapshot: a directory, regular file or symlink.
/// Paths are relative to the snapshot root, `/`-separated, no leading
/// slash; the root itself is the empty path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub path: String,
    pub kind: ItemKind,
    pub mode: u32,
    /// Nanoseconds since the epoch; negative values are clamped to zero
    /// by consumers.
    pub mtime: i64,
    pub size: u64,
    pub link_target: Option<String>,
    pub chunks: Vec<ChunkRef>,
}

impl Item {
    pub fn dir(path: &str, mode: u32, mtime: i64) -> Item {
        Item {
            path: path.to_string(),
            kind: ItemKind::Directory,
            mode,
            mtime,
            size: 0,
            link_target: None,
            chunks: Vec::new(),
        }
    }

    pub fn file(path: &str, mode: u32, mtime: i64, size: u64, chunks: Vec<ChunkRef>) -> Item {
        Item {
            path: path.to_string(),
            kind: ItemKind::File,
            mode,
            mtime,
            size,
            link_target: None,
            chunks,
        }
    }

    pub fn symlink(path: &str, mtime: i64, target: &str) -> Item {
        Item {
            path: path.to_string(),
            kind: ItemKind::Symlink,
            mode: 0o777,
            mtime,
            size: target.len() as u64,
            link_target: Some(target.to_string()),
            chunks: Vec::new(),
        }
    }

    /// Last path component.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_last_component() {
        assert_eq!(Item::dir("a/b/c", 0o755, 0).name(), "c");
        assert_eq!(Item::file("top.txt", 0o644, 0, 1, vec![]).name(), "top.txt");
    }

    #[test]
    fn symlink_carries_target() {
        let link = Item::symlink("l", 0, "/etc/hosts");
        assert_eq!(link.link_target.as_deref(), Some("/etc/hosts"));
        assert_eq!(link.size, 10);
    }
}
