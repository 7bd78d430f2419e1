/// Utility endpoints: liveness, cancellation and test helpers

use serde::{Deserialize, Serialize};

use crate::router::RequestContext;

#[derive(Debug, Default, Deserialize)]
pub struct PingParams {}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PingResult {}

/// Parameters for `Cancel`
#[derive(Debug, Deserialize)]
pub struct CancelParams {
    /// Id the operation was registered under
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResult {
    pub did_cancel: bool,
}

#[derive(Debug, Deserialize)]
pub struct NetworkSetSimulateOfflineParams {
    /// If true, every operation after this point behaves as if there were
    /// no network connection
    pub enabled: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NetworkSetSimulateOfflineResult {}

/// Number to double (`Test.DoubleTwice` and the client-side `Test.Double`)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TestDoubleParams {
    pub number: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TestDoubleResult {
    pub number: i64,
}

pub async fn ping(_ctx: RequestContext, _params: PingParams) -> anyhow::Result<PingResult> {
    Ok(PingResult {})
}

/// Cancel an operation registered in the cancellation registry
pub async fn cancel(ctx: RequestContext, params: CancelParams) -> anyhow::Result<CancelResult> {
    let did_cancel = ctx.cancel_funcs().call(&params.id);
    Ok(CancelResult { did_cancel })
}

pub async fn set_simulate_offline(
    ctx: RequestContext,
    params: NetworkSetSimulateOfflineParams,
) -> anyhow::Result<NetworkSetSimulateOfflineResult> {
    tracing::info!("Simulating offline: {}", params.enabled);
    ctx.set_simulate_offline(params.enabled);
    Ok(NetworkSetSimulateOfflineResult {})
}

/// Have the client double a number, then double its answer
pub async fn double_twice(
    ctx: RequestContext,
    params: TestDoubleParams,
) -> anyhow::Result<TestDoubleResult> {
    let once: TestDoubleResult = ctx.call("Test.Double", &params).await?;
    Ok(TestDoubleResult {
        number: once.number * 2,
    })
}
