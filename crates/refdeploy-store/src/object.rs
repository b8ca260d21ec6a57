use std::fmt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectType {
    File,
    DirTree,
    Commit,
    CommitMeta,
}

impl ObjectType {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::DirTree => "dirtree",
            Self::Commit => "commit",
            Self::CommitMeta => "commitmeta",
        }
    }

    /// Detached metadata is not content-addressed.
    #[must_use]
    pub fn is_content_addressed(self) -> bool {
        !matches!(self, Self::CommitMeta)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// `objects/<xx>/<rest>.<ext>`, relative to a repo root or base URL.
#[must_use]
pub fn relative_object_path(kind: ObjectType, checksum: &str) -> String {
    let (prefix, rest) = checksum.split_at(checksum.len().min(2));
    format!("objects/{prefix}/{rest}.{}", kind.extension())
}

#[must_use]
pub fn object_path(repo: &Path, kind: ObjectType, checksum: &str) -> PathBuf {
    repo.join(relative_object_path(kind, checksum))
}

/// Recover `(checksum, kind)` from an `objects/<xx>/<rest>.<ext>` path.
#[must_use]
pub fn parse_object_path(path: &Path) -> Option<(String, ObjectType)> {
    let prefix = path.parent()?.file_name()?.to_str()?;
    let file = path.file_name()?.to_str()?;
    let (rest, ext) = file.rsplit_once('.')?;
    let kind = match ext {
        "file" => ObjectType::File,
        "dirtree" => ObjectType::DirTree,
        "commit" => ObjectType::Commit,
        "commitmeta" => ObjectType::CommitMeta,
        _ => return None,
    };
    Some((format!("{prefix}{rest}"), kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_paths_split_the_checksum() {
        let checksum = sha256_hex(b"hello");
        let path = object_path(Path::new("/repo"), ObjectType::Commit, &checksum);
        assert!(path
            .to_string_lossy()
            .starts_with(&format!("/repo/objects/{}/", &checksum[..2])));
        assert_eq!(
            parse_object_path(&path),
            Some((checksum, ObjectType::Commit))
        );
    }
}
