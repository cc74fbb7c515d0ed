use anyhow::{Context, Result};

use crate::canary::{CanaryController, CanaryState};
use crate::config::DockyardConfig;
use crate::executor::RemoteExecutor;
use crate::output;
use crate::ssh::SshSession;

use super::CanaryAction;

pub async fn run(config: DockyardConfig, action: CanaryAction) -> Result<()> {
    let server = match &action {
        CanaryAction::Shift { server, .. }
        | CanaryAction::Promote { server }
        | CanaryAction::Rollback { server } => config.server(server.as_deref())?,
    };

    let session = SshSession::connect(server)
        .await
        .with_context(|| format!("Failed to connect to {}", server.name))?;
    let controller = CanaryController::new(&session, &config.app, &config.deploy);

    let result = match action {
        CanaryAction::Shift { weight, .. } => controller.shift(weight).await.map(|state| {
            report(&state);
        }),
        CanaryAction::Promote { .. } => controller.promote().await.map(|state| {
            output::success(&format!(
                "Promoted {}; {} removed",
                state.canary_container, state.stable_container
            ));
        }),
        CanaryAction::Rollback { .. } => controller.rollback().await.map(|state| {
            output::success(&format!(
                "Traffic back on {}; {} removed",
                state.stable_container, state.canary_container
            ));
        }),
    };

    session.close().await?;
    result?;
    Ok(())
}

fn report(state: &CanaryState) {
    output::success(&format!(
        "{}% to {}, {}% to {}",
        state.canary_weight,
        state.canary_container,
        state.stable_weight(),
        state.stable_container
    ));
}
