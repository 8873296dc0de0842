use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::runtime::AgentRuntime;
use crate::auth::AdminGate;
use crate::config::AgentConfig;
use crate::events::{EventReceiver, event_channel};
use crate::kiosk::{AllowedAppsFile, KioskController, SysinfoProcessTable};
use crate::platform;
use crate::protocol::{ProtocolClient, TcpTransport};
use crate::session::{SessionCoordinator, SystemClock, SystemHostActions};
use crate::state::StateFileJournal;

/// Run the agent until interrupted
pub async fn run_agent_daemon(config: AgentConfig, config_path: &Path) -> Result<()> {
    tracing::info!("Starting kiosk agent");
    tracing::info!(
        "Controller: {}:{}",
        config.connection.host,
        config.connection.port
    );
    tracing::info!("Enforcement sweep every {} seconds", config.kiosk.sweep_interval);

    let data_dir = platform::common::data_dir()?;
    platform::common::ensure_directory_exists(&data_dir)?;

    let journal = Arc::new(StateFileJournal::new(config.kiosk.state_path()?));
    let apps_path = config.kiosk.apps_path()?;
    let apps = AllowedAppsFile::load(&apps_path)?.into_apps();
    tracing::info!("{} allowed applications loaded from {}", apps.len(), apps_path.display());

    let (events, log_rx) = event_channel();
    let kiosk = Arc::new(
        KioskController::new(
            config.kiosk.settings(),
            platform::native_policy_store(&data_dir)?,
            Arc::new(SysinfoProcessTable::new()),
            apps,
            events.clone(),
        )
        .with_journal(journal.clone()),
    );

    recover_leftover_backup(&kiosk, &journal).await?;

    let client = ProtocolClient::new(
        Arc::new(TcpTransport),
        config.connection.settings(),
        events.clone(),
    );
    let admin = AdminGate::new(config.admin.password_hash.clone());
    if !admin.is_configured() {
        tracing::warn!("No admin password configured; local override is disabled");
    }

    let coordinator = Arc::new(
        SessionCoordinator::new(
            kiosk.clone(),
            client.clone(),
            Arc::new(SystemHostActions),
            Arc::new(SystemClock),
            events.clone(),
        )
        .with_admin(admin)
        .with_apps_file(apps_path),
    );

    tokio::spawn(log_events(log_rx));

    let agent = AgentRuntime::new(config, client, kiosk, coordinator, events)
        .with_config_path(config_path.to_path_buf())
        .start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    agent.shutdown().await;
    tracing::info!("Agent stopped");
    Ok(())
}

/// Undo a lockdown left behind by a run that was killed mid-session
async fn recover_leftover_backup(
    kiosk: &Arc<KioskController>,
    journal: &Arc<StateFileJournal>,
) -> Result<()> {
    let journal = journal.clone();
    let Some(backup) = tokio::task::spawn_blocking(move || journal.pending())
        .await
        .context("State recovery task failed")??
    else {
        return Ok(());
    };

    let kiosk = kiosk.clone();
    match tokio::task::spawn_blocking(move || kiosk.recover(&backup))
        .await
        .context("State recovery task failed")?
    {
        Ok(()) => tracing::info!("Restored lockdown settings from previous run"),
        // Keep the journal so the next start tries again
        Err(e) => tracing::error!("Could not restore settings from previous run: {}", e),
    }
    Ok(())
}

/// Mirror agent events into the log for headless deployments
async fn log_events(mut events: EventReceiver) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => tracing::debug!(target: "kiosk_agent::events", "{}", json),
                Err(e) => tracing::debug!("Unserializable event {:?}: {}", event, e),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Event log skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kiosk::controller::KioskSettings;
    use crate::kiosk::{BackupJournal, PolicyBackup, PolicyKey, PolicyStore};
    use crate::testing::{FakeProcessTable, MemoryPolicyStore};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_leftover_backup_is_restored_and_cleared() {
        let dir = tempdir().unwrap();
        let journal = Arc::new(StateFileJournal::new(dir.path().join("state.json")));

        let policy = Arc::new(MemoryPolicyStore::with_values(&[(PolicyKey::AltTab, 0)]));
        let backup = PolicyBackup::capture(policy.as_ref(), &[PolicyKey::AltTab, PolicyKey::TaskManager]).unwrap();
        journal.record(&backup).unwrap();
        policy.set(PolicyKey::AltTab, 1).unwrap();
        policy.set(PolicyKey::TaskManager, 1).unwrap();

        let (events, _rx) = event_channel();
        let kiosk = Arc::new(
            KioskController::new(
                KioskSettings::default(),
                policy.clone(),
                Arc::new(FakeProcessTable::default()),
                Vec::new(),
                events,
            )
            .with_journal(journal.clone()),
        );

        recover_leftover_backup(&kiosk, &journal).await.unwrap();

        assert_eq!(policy.get(PolicyKey::AltTab).unwrap(), Some(0));
        assert_eq!(policy.get(PolicyKey::TaskManager).unwrap(), None);
        assert!(journal.pending().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nothing_to_recover_is_a_no_op() {
        let dir = tempdir().unwrap();
        let journal = Arc::new(StateFileJournal::new(dir.path().join("state.json")));
        let (events, _rx) = event_channel();
        let kiosk = Arc::new(KioskController::new(
            KioskSettings::default(),
            Arc::new(MemoryPolicyStore::default()),
            Arc::new(FakeProcessTable::default()),
            Vec::new(),
            events,
        ));

        recover_leftover_backup(&kiosk, &journal).await.unwrap();
        assert!(!dir.path().join("state.json").exists());
    }
}
