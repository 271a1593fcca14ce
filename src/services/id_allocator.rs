//! Short opaque file id allocation.

use crate::{
    models::file_record::FILE_ID_LEN,
    services::catalog::{Catalog, CatalogError, FileFilter},
};
use rand::{Rng, distr::Alphanumeric};
use thiserror::Error;
use tracing::warn;

/// Draws before giving up. At 62^8 ids a second collision in a row is
/// already vanishingly unlikely.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 16;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("no free file id after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Draw a candidate id: 8 uniform characters from `[A-Za-z0-9]`.
pub fn random_file_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(FILE_ID_LEN)
        .map(char::from)
        .collect()
}

/// Allocates ids that no catalog row currently uses.
///
/// The check is advisory: the `files.id` primary key is what finally
/// rejects a racing duplicate insert.
#[derive(Clone)]
pub struct IdAllocator {
    catalog: Catalog,
    max_attempts: u32,
    generate: fn() -> String,
}

impl IdAllocator {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            generate: random_file_id,
        }
    }

    /// Replace the candidate source.
    pub fn with_generator(mut self, generate: fn() -> String) -> Self {
        self.generate = generate;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub async fn allocate(&self) -> Result<String, AllocationError> {
        for attempt in 1..=self.max_attempts {
            let candidate = (self.generate)();
            if self.catalog.count_files(FileFilter::Id(&candidate)).await? == 0 {
                return Ok(candidate);
            }
            warn!("file id collision on attempt {}, drawing again", attempt);
        }
        Err(AllocationError::Exhausted {
            attempts: self.max_attempts,
        })
    }
}
