//! SQLite storage layer for eddy.
//!
//! Provides:
//! - Store handles naming a durable, shareable database
//! - Schema initialization and migrations
//! - Row and parameter conversion
//! - Statement footprints (tables read and written)

pub mod rows;
pub mod schema;
pub mod tables;

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Maximum store name length.
const MAX_NAME_LEN: usize = 255;

/// Identifies a durable store namespace.
///
/// Two handles with the same name in the same data directory refer to the
/// same database and take part in the same leader election.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreHandle {
    name: String,
    path: PathBuf,
    lease_path: PathBuf,
}

impl StoreHandle {
    /// Create a handle for store `name` under `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::Initialization("store name cannot be empty".into()));
        }

        if name.len() > MAX_NAME_LEN {
            return Err(Error::Initialization(format!(
                "store name too long (max {MAX_NAME_LEN} characters)"
            )));
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(Error::Initialization(
                "store name must contain only alphanumeric characters, dashes, underscores, or dots"
                    .into(),
            ));
        }

        // Relative and absolute spellings of one directory name one store.
        let data_dir = data_dir.as_ref();
        let data_dir = std::path::absolute(data_dir).unwrap_or_else(|_| data_dir.to_path_buf());
        Ok(Self {
            name: name.to_string(),
            path: data_dir.join(format!("{name}.db")),
            lease_path: data_dir.join(format!("{name}.lease.db")),
        })
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the sidecar file holding the leader lease.
    pub fn lease_path(&self) -> &Path {
        &self.lease_path
    }

    /// Key under which contexts sharing this store coordinate.
    pub fn namespace(&self) -> String {
        self.path.display().to_string()
    }
}
