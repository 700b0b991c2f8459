use std::fmt;

use crate::classification::ClassificationError;
use crate::config::ConfigErr;
use crate::loader::LoadError;
use crate::merger::MergeError;
use crate::storage::StorageError;

/// Every failure a command can end with.
#[derive(Debug)]
pub enum AppError {
    Config(ConfigErr),
    Load(LoadError),
    Merge(MergeError),
    Classification(ClassificationError),
    Storage(StorageError),
    Render(serde_json::Error),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{e}"),
            Self::Load(e) => write!(f, "load failed: {e}"),
            Self::Merge(e) => write!(f, "merge failed: {e}"),
            Self::Classification(e) => write!(f, "classification failed: {e}"),
            Self::Storage(e) => write!(f, "{e}"),
            Self::Render(e) => write!(f, "unable to render report: {e}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<ConfigErr> for AppError {
    fn from(e: ConfigErr) -> Self {
        Self::Config(e)
    }
}

impl From<LoadError> for AppError {
    fn from(e: LoadError) -> Self {
        Self::Load(e)
    }
}

impl From<MergeError> for AppError {
    fn from(e: MergeError) -> Self {
        Self::Merge(e)
    }
}

impl From<ClassificationError> for AppError {
    fn from(e: ClassificationError) -> Self {
        Self::Classification(e)
    }
}

impl From<StorageError> for AppError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        Self::Render(e)
    }
}
