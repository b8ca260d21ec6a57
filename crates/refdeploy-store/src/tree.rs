//! Flat tree listing: `a(suays)` of path, mode, file checksum, link target.

use refdeploy_domain::{Variant, VariantType};

use crate::error::{StoreError, StoreResult};
use crate::object::sha256_hex;

pub const TREE_TYPE: &str = "a(suays)";

pub const S_IFMT: u32 = 0o170_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFLNK: u32 = 0o120_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File { checksum: String },
    Symlink { target: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    /// Relative, `/`-separated, no leading slash.
    pub path: String,
    pub mode: u32,
    pub kind: EntryKind,
}

impl TreeEntry {
    #[must_use]
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Whether this entry lies at or below `subpath` (also true for its ancestors,
    /// which a partial checkout still needs).
    #[must_use]
    pub fn within(&self, subpath: &str) -> bool {
        let subpath = subpath.trim_matches('/');
        if subpath.is_empty() || self.path == subpath {
            return true;
        }
        is_descendant(&self.path, subpath) || is_descendant(subpath, &self.path)
    }
}

fn is_descendant(path: &str, ancestor: &str) -> bool {
    path.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tree {
    pub entries: Vec<TreeEntry>,
}

fn entry_type() -> VariantType {
    VariantType::Tuple(vec![
        VariantType::String,
        VariantType::Uint32,
        VariantType::Array(Box::new(VariantType::Byte)),
        VariantType::String,
    ])
}

impl Tree {
    /// Entries are kept sorted by path so parents precede children.
    pub fn sort(&mut self) {
        self.entries.sort_by(|a, b| a.path.cmp(&b.path));
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let items = self
            .entries
            .iter()
            .map(|entry| {
                let (checksum, target) = match &entry.kind {
                    EntryKind::Dir => (Vec::new(), String::new()),
                    EntryKind::File { checksum } => {
                        (hex::decode(checksum).unwrap_or_default(), String::new())
                    }
                    EntryKind::Symlink { target } => (Vec::new(), target.clone()),
                };
                Variant::tuple(vec![
                    Variant::string(&entry.path),
                    Variant::Uint32(entry.mode),
                    Variant::bytes(&checksum),
                    Variant::String(target),
                ])
            })
            .collect();
        Variant::Array(entry_type(), items).to_bytes()
    }

    #[must_use]
    pub fn checksum(&self) -> String {
        sha256_hex(&self.to_bytes())
    }

    pub fn from_bytes(checksum: &str, data: &[u8]) -> StoreResult<Self> {
        let value = Variant::parse(TREE_TYPE, data).map_err(|source| StoreError::Decode {
            checksum: checksum.to_string(),
            source,
        })?;
        let corrupt = || StoreError::ChecksumMismatch {
            checksum: checksum.to_string(),
            kind: "dirtree",
            actual: "malformed entry".into(),
        };
        let mut entries = Vec::new();
        for item in value.as_array().unwrap_or_default() {
            let path = item.child(0).and_then(Variant::as_str).ok_or_else(corrupt)?;
            let mode = item.child(1).and_then(Variant::as_u32).ok_or_else(corrupt)?;
            if path.is_empty() || path.starts_with('/') || path.split('/').any(|c| c == "..") {
                return Err(corrupt());
            }
            let kind = match mode & S_IFMT {
                S_IFDIR => EntryKind::Dir,
                S_IFLNK => EntryKind::Symlink {
                    target: item
                        .child(3)
                        .and_then(Variant::as_str)
                        .ok_or_else(corrupt)?
                        .to_string(),
                },
                S_IFREG => {
                    let bytes = item
                        .child(2)
                        .and_then(Variant::as_bytes)
                        .filter(|b| b.len() == 32)
                        .ok_or_else(corrupt)?;
                    EntryKind::File {
                        checksum: hex::encode(bytes),
                    }
                }
                _ => return Err(corrupt()),
            };
            entries.push(TreeEntry {
                path: path.to_string(),
                mode,
                kind,
            });
        }
        Ok(Self { entries })
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&TreeEntry> {
        let path = path.trim_matches('/');
        self.entries.iter().find(|entry| entry.path == path)
    }

    pub fn files(&self) -> impl Iterator<Item = (&TreeEntry, &str)> {
        self.entries.iter().filter_map(|entry| match &entry.kind {
            EntryKind::File { checksum } => Some((entry, checksum.as_str())),
            _ => None,
        })
    }
}
