use std::fmt;

use modmesh_proto::MeshError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    InvalidConfig { reason: String },
    Bind { address: String, reason: String },
    AlreadyRunning { name: String },
    NotRunning { name: String },
    ThreadSpawnFailed { reason: String },
    ThreadJoinFailed { name: String },
    Mesh(MeshError),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::InvalidConfig { reason } => write!(f, "invalid node config: {}", reason),
            NodeError::Bind { address, reason } => {
                write!(f, "failed to bind {}: {}", address, reason)
            }
            NodeError::AlreadyRunning { name } => write!(f, "runtime already running: {}", name),
            NodeError::NotRunning { name } => write!(f, "runtime not running: {}", name),
            NodeError::ThreadSpawnFailed { reason } => {
                write!(f, "failed to spawn node thread: {}", reason)
            }
            NodeError::ThreadJoinFailed { name } => {
                write!(f, "failed to join node thread: {}", name)
            }
            NodeError::Mesh(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NodeError::Mesh(err) => Some(err),
            _ => None,
        }
    }
}

impl From<MeshError> for NodeError {
    fn from(error: MeshError) -> Self {
        match error {
            MeshError::InvalidConfig { reason } => NodeError::InvalidConfig { reason },
            other => NodeError::Mesh(other),
        }
    }
}
