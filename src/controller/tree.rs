//! # Trillian Tree Service
//!
//! Creates log trees on a Trillian log server.
//!
//! A new tree needs two calls: `TrillianAdmin/CreateTree` registers it and
//! `TrillianLog/InitLog` writes the empty signed root. Only the subset of the
//! Trillian messages the operator sends or reads is declared here; unknown
//! fields in responses are skipped by prost.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Endpoint;
use tracing::{debug, info};

const CREATE_TREE_PATH: &str = "/trillian.TrillianAdmin/CreateTree";
const INIT_LOG_PATH: &str = "/trillian.TrillianLog/InitLog";

/// `trillian.TreeState.ACTIVE`
const TREE_STATE_ACTIVE: i32 = 1;
/// `trillian.TreeType.LOG`
const TREE_TYPE_LOG: i32 = 1;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("tree creation timed out after {0:?}")]
    Timeout(Duration),

    #[error("log server unavailable: {0}")]
    Unavailable(String),

    #[error("log server rejected the request: {0}")]
    Rejected(String),

    #[error("invalid log server address {address}: {message}")]
    Transport { address: String, message: String },
}

impl TreeError {
    /// Timeouts and unavailability leave the caller free to retry the same call
    pub fn is_retryable(&self) -> bool {
        matches!(self, TreeError::Timeout(_) | TreeError::Unavailable(_))
    }
}

impl From<tonic::Status> for TreeError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::DeadlineExceeded => TreeError::Timeout(Duration::ZERO),
            tonic::Code::Unavailable
            | tonic::Code::ResourceExhausted
            | tonic::Code::Aborted
            | tonic::Code::Cancelled => TreeError::Unavailable(status.message().to_string()),
            _ => TreeError::Rejected(format!("{:?}: {}", status.code(), status.message())),
        }
    }
}

/// Creates Trillian trees
#[async_trait]
pub trait TreeService: Send + Sync {
    /// Create and initialise a log tree, returning its id
    ///
    /// `address` is `host:port` of the log server gRPC endpoint. The call
    /// gives up with [`TreeError::Timeout`] once `deadline` has elapsed.
    async fn create_tree(
        &self,
        display_name: &str,
        address: &str,
        deadline: Duration,
    ) -> Result<i64, TreeError>;
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Tree {
    #[prost(int64, tag = "1")]
    pub tree_id: i64,
    #[prost(int32, tag = "2")]
    pub tree_state: i32,
    #[prost(int32, tag = "3")]
    pub tree_type: i32,
    #[prost(string, tag = "8")]
    pub display_name: String,
    #[prost(string, tag = "9")]
    pub description: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateTreeRequest {
    #[prost(message, optional, tag = "1")]
    pub tree: Option<Tree>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InitLogRequest {
    #[prost(int64, tag = "1")]
    pub log_id: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InitLogResponse {}

/// [`TreeService`] talking gRPC to a Trillian log server
#[derive(Debug, Clone, Default)]
pub struct GrpcTreeService;

impl GrpcTreeService {
    pub fn new() -> Self {
        Self
    }

    async fn create_and_init(&self, display_name: &str, address: &str) -> Result<i64, TreeError> {
        let endpoint = Endpoint::from_shared(format!("http://{address}")).map_err(|e| {
            TreeError::Transport {
                address: address.to_string(),
                message: e.to_string(),
            }
        })?;
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| TreeError::Unavailable(e.to_string()))?;
        let mut grpc = tonic::client::Grpc::new(channel);

        grpc.ready()
            .await
            .map_err(|e| TreeError::Unavailable(e.to_string()))?;
        let request = CreateTreeRequest {
            tree: Some(Tree {
                tree_id: 0,
                tree_state: TREE_STATE_ACTIVE,
                tree_type: TREE_TYPE_LOG,
                display_name: display_name.to_string(),
                description: format!("{display_name} created by the securesign operator"),
            }),
        };
        let tree: Tree = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(CREATE_TREE_PATH),
                ProstCodec::<CreateTreeRequest, Tree>::default(),
            )
            .await?
            .into_inner();
        debug!(tree_id = tree.tree_id, "CreateTree returned");

        grpc.ready()
            .await
            .map_err(|e| TreeError::Unavailable(e.to_string()))?;
        grpc.unary(
            tonic::Request::new(InitLogRequest {
                log_id: tree.tree_id,
            }),
            PathAndQuery::from_static(INIT_LOG_PATH),
            ProstCodec::<InitLogRequest, InitLogResponse>::default(),
        )
        .await?;

        Ok(tree.tree_id)
    }
}

#[async_trait]
impl TreeService for GrpcTreeService {
    async fn create_tree(
        &self,
        display_name: &str,
        address: &str,
        deadline: Duration,
    ) -> Result<i64, TreeError> {
        let tree_id = tokio::time::timeout(deadline, self.create_and_init(display_name, address))
            .await
            .map_err(|_elapsed| TreeError::Timeout(deadline))??;
        info!(tree_id, address, "Created Trillian tree {}", display_name);
        Ok(tree_id)
    }
}
