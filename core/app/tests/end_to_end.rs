use std::sync::Arc;
use tempfile::TempDir;

use keyward_app::{AppConfig, AppContext, VaultService};
use keyward_common::{Error, SensitiveBytes};
use keyward_storage::MemoryProvider;
use keyward_sync::SyncOutcome;
use keyward_vault::{SessionStatus, VaultEntry, VaultGroup, VaultStore};

fn pass(value: &str) -> SensitiveBytes {
    SensitiveBytes::from_passphrase(value)
}

fn config(root: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::with_data_dir(root);
    config.kdf_memory_kib = 19_456;
    config.kdf_time_cost = 2;
    config.kdf_parallelism = 1;
    config
}

async fn device(root: &std::path::Path, remote: &MemoryProvider) -> VaultService {
    let context = AppContext::from_config(config(root))
        .unwrap()
        .with_provider(Arc::new(remote.clone()));
    VaultService::new(context).await.unwrap()
}

async fn titles(service: &VaultService, vault_id: &keyward_common::VaultId) -> Vec<String> {
    let mut titles: Vec<String> = service
        .list_entries(vault_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.title)
        .collect();
    titles.sort();
    titles
}

#[tokio::test]
async fn test_two_devices_converge_through_remote() {
    let temp = TempDir::new().unwrap();
    let remote = MemoryProvider::new();
    let laptop_root = temp.path().join("laptop");
    let phone_root = temp.path().join("phone");

    let laptop = device(&laptop_root, &remote).await;
    let vault_id = laptop.create_vault("personal", &pass("correct horse")).await.unwrap();

    // The phone starts from a copy of the freshly created, empty vault file.
    let phone_vaults = config(&phone_root).vault_dir();
    std::fs::create_dir_all(&phone_vaults).unwrap();
    std::fs::copy(
        config(&laptop_root).vault_dir().join("personal.kwv"),
        phone_vaults.join("personal.kwv"),
    )
    .unwrap();

    laptop.unlock(&vault_id, &pass("correct horse")).await.unwrap();
    laptop
        .add_entry(&vault_id, VaultEntry::login("Email", "alice", "s3cret"))
        .await
        .unwrap();
    assert!(matches!(
        laptop.sync(&vault_id).await.unwrap(),
        SyncOutcome::Uploaded { .. }
    ));

    let phone = device(&phone_root, &remote).await;
    phone.open_vault("personal").await.unwrap();
    phone.unlock(&vault_id, &pass("correct horse")).await.unwrap();
    phone
        .add_entry(&vault_id, VaultEntry::login("Forum", "al", "hunter2"))
        .await
        .unwrap();
    match phone.sync(&vault_id).await.unwrap() {
        SyncOutcome::Merged { local_changed, .. } => assert!(local_changed),
        other => panic!("expected a merge, got {:?}", other),
    }
    assert_eq!(titles(&phone, &vault_id).await, vec!["Email", "Forum"]);

    assert!(matches!(
        laptop.sync(&vault_id).await.unwrap(),
        SyncOutcome::Merged { .. }
    ));
    assert_eq!(titles(&laptop, &vault_id).await, vec!["Email", "Forum"]);
    assert!(matches!(
        laptop.sync(&vault_id).await.unwrap(),
        SyncOutcome::UpToDate
    ));

    laptop.shutdown().await;
    phone.shutdown().await;
}

#[tokio::test]
async fn test_duress_passphrase_opens_decoy() {
    let temp = TempDir::new().unwrap();
    let context = AppContext::from_config(config(temp.path())).unwrap();
    let service = VaultService::new(context).await.unwrap();
    let vault_id = service.create_vault("personal", &pass("correct horse")).await.unwrap();
    service.unlock(&vault_id, &pass("correct horse")).await.unwrap();
    service
        .add_entry(&vault_id, VaultEntry::login("Bank", "acct-1001", "pin"))
        .await
        .unwrap();

    let mut decoy = VaultStore::new();
    decoy
        .add_entry(VaultEntry::login("Shopping", "alice", "password1"))
        .unwrap();
    service
        .configure_duress(&vault_id, &pass("under pressure"), decoy)
        .await
        .unwrap();

    service.lock(&vault_id).await.unwrap();
    assert_eq!(service.status(&vault_id).await.unwrap(), SessionStatus::Locked);
    assert!(matches!(
        service.list_entries(&vault_id).await,
        Err(Error::Locked)
    ));

    service.unlock(&vault_id, &pass("under pressure")).await.unwrap();
    assert_eq!(service.status(&vault_id).await.unwrap(), SessionStatus::Unlocked);
    assert_eq!(titles(&service, &vault_id).await, vec!["Shopping"]);

    service.lock(&vault_id).await.unwrap();
    service.unlock(&vault_id, &pass("correct horse")).await.unwrap();
    assert_eq!(titles(&service, &vault_id).await, vec!["Bank"]);
}

/// Laptop creates the vault; the phone starts from a copy of the file.
async fn provisioned_pair(
    root: &std::path::Path,
    remote: &MemoryProvider,
) -> (VaultService, VaultService, keyward_common::VaultId) {
    let laptop_root = root.join("laptop");
    let phone_root = root.join("phone");
    let laptop = device(&laptop_root, remote).await;
    let vault_id = laptop.create_vault("personal", &pass("correct horse")).await.unwrap();

    let phone_vaults = config(&phone_root).vault_dir();
    std::fs::create_dir_all(&phone_vaults).unwrap();
    std::fs::copy(
        config(&laptop_root).vault_dir().join("personal.kwv"),
        phone_vaults.join("personal.kwv"),
    )
    .unwrap();

    let phone = device(&phone_root, remote).await;
    phone.open_vault("personal").await.unwrap();
    laptop.unlock(&vault_id, &pass("correct horse")).await.unwrap();
    phone.unlock(&vault_id, &pass("correct horse")).await.unwrap();
    (laptop, phone, vault_id)
}

#[tokio::test]
async fn test_passphrase_change_does_not_strand_other_devices() {
    let temp = TempDir::new().unwrap();
    let remote = MemoryProvider::new();
    let (laptop, phone, vault_id) = provisioned_pair(temp.path(), &remote).await;

    laptop
        .change_passphrase(&vault_id, &pass("correct horse"), &pass("battery staple"))
        .await
        .unwrap();
    laptop
        .add_entry(&vault_id, VaultEntry::login("Email", "alice", "s3cret"))
        .await
        .unwrap();
    laptop.sync(&vault_id).await.unwrap();

    assert!(matches!(
        phone.sync(&vault_id).await.unwrap(),
        SyncOutcome::Merged { .. }
    ));
    assert_eq!(titles(&phone, &vault_id).await, vec!["Email"]);

    // The phone still opens with its own, unchanged passphrase.
    phone.lock(&vault_id).await.unwrap();
    phone.unlock(&vault_id, &pass("correct horse")).await.unwrap();
    assert_eq!(titles(&phone, &vault_id).await, vec!["Email"]);

    laptop.shutdown().await;
    phone.shutdown().await;
}

#[tokio::test]
async fn test_duress_session_leaves_remote_untouched() {
    let temp = TempDir::new().unwrap();
    let remote = MemoryProvider::new();
    let (laptop, phone, vault_id) = provisioned_pair(temp.path(), &remote).await;

    laptop
        .add_entry(&vault_id, VaultEntry::login("Bank", "acct-1001", "pin"))
        .await
        .unwrap();
    laptop.sync(&vault_id).await.unwrap();
    let uploads = remote.upload_count();

    laptop
        .configure_duress(&vault_id, &pass("under pressure"), VaultStore::new())
        .await
        .unwrap();
    laptop.lock(&vault_id).await.unwrap();
    laptop.unlock(&vault_id, &pass("under pressure")).await.unwrap();
    laptop
        .add_entry(&vault_id, VaultEntry::login("Shopping", "alice", "password1"))
        .await
        .unwrap();
    assert!(matches!(
        laptop.sync(&vault_id).await.unwrap(),
        SyncOutcome::UpToDate
    ));
    assert_eq!(remote.upload_count(), uploads);

    assert!(matches!(
        phone.sync(&vault_id).await.unwrap(),
        SyncOutcome::Merged { .. }
    ));
    assert_eq!(titles(&phone, &vault_id).await, vec!["Bank"]);

    laptop.shutdown().await;
    phone.shutdown().await;
}

#[tokio::test]
async fn test_folder_deletion_reaches_other_device() {
    let temp = TempDir::new().unwrap();
    let remote = MemoryProvider::new();
    let (laptop, phone, vault_id) = provisioned_pair(temp.path(), &remote).await;

    let work = laptop
        .add_group(&vault_id, VaultGroup::new("Work"))
        .await
        .unwrap();
    laptop
        .add_entry(
            &vault_id,
            VaultEntry::login("Jira", "alice", "pw").with_group(work),
        )
        .await
        .unwrap();
    laptop.sync(&vault_id).await.unwrap();
    phone.sync(&vault_id).await.unwrap();
    assert_eq!(phone.list_groups(&vault_id).await.unwrap().len(), 1);

    laptop.remove_group(&vault_id, work).await.unwrap();
    laptop.sync(&vault_id).await.unwrap();
    phone.sync(&vault_id).await.unwrap();

    assert!(phone.list_groups(&vault_id).await.unwrap().is_empty());
    let unfiled = phone.entries_in_group(&vault_id, None).await.unwrap();
    assert_eq!(unfiled.len(), 1);

    // The laptop pulls nothing back.
    laptop.sync(&vault_id).await.unwrap();
    assert!(laptop.list_groups(&vault_id).await.unwrap().is_empty());

    laptop.shutdown().await;
    phone.shutdown().await;
}
