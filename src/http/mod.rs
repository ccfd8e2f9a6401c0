mod health;

pub use health::HealthState;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::Result;

pub async fn serve(
    addr: SocketAddr,
    ready: CancellationToken,
    health: Arc<HealthState>,
    cancel: CancellationToken,
) -> Result<()> {
    let state = Arc::new(health::State::new(ready, health));

    health::serve(addr, state, cancel).await
}

pub(crate) async fn shutdown(cancel: CancellationToken) {
    select! {
        _ = cancel.cancelled() => {}
    }
}
