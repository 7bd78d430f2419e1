/// Session plumbing: flow, shutdown and version endpoints

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::router::{RequestContext, VersionInfo};

/// Parameters for `Meta.Flow`
#[derive(Debug, Default, Deserialize)]
pub struct MetaFlowParams {}

/// `Meta.Flow` only answers once the flow is over
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MetaFlowResult {}

/// First notification sent on a `Meta.Flow` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaFlowEstablishedNotification {
    /// Identifier of the daemon process the flow was established with
    pub pid: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetaShutdownParams {}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MetaShutdownResult {}

#[derive(Debug, Default, Deserialize)]
pub struct VersionGetParams {}

pub type VersionGetResult = VersionInfo;

/// Keep the daemon alive for as long as the client holds this call open
///
/// When the call is cancelled (typically because the client went away) the
/// daemon shuts down gracefully.
pub async fn flow(ctx: RequestContext, _params: MetaFlowParams) -> anyhow::Result<MetaFlowResult> {
    let established = MetaFlowEstablishedNotification {
        pid: std::process::id(),
    };
    ctx.notify("MetaFlowEstablished", &established).await?;

    ctx.cancelled().await;
    info!("Flow ended, shutting down");
    ctx.shutdown();
    Ok(MetaFlowResult {})
}

pub async fn shutdown(
    ctx: RequestContext,
    _params: MetaShutdownParams,
) -> anyhow::Result<MetaShutdownResult> {
    info!("Shutdown requested by client");
    ctx.shutdown();
    Ok(MetaShutdownResult {})
}

pub async fn version_get(
    ctx: RequestContext,
    _params: VersionGetParams,
) -> anyhow::Result<VersionGetResult> {
    Ok(ctx.version().clone())
}
