//! Error types for pal-core

use crate::config::ConfigError;
use crate::queue::QueueClosed;
use crate::reconcile::ReconcileError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the mesh components
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mDNS error: {0}")]
    Discovery(#[from] mdns_sd::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("state change rejected: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("corrupt state file {path}: {reason}")]
    Storage { path: PathBuf, reason: String },

    #[error("component is shut down")]
    Closed,
}

impl From<QueueClosed> for MeshError {
    fn from(_: QueueClosed) -> Self {
        MeshError::Closed
    }
}

pub type Result<T, E = MeshError> = std::result::Result<T, E>;
