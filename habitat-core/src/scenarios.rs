//! End-to-end node flows through HDB, the node reconciler and fake drivers.

use crate::error::HabitatError;
use crate::node::state::{
    AppLifecycleState, DriverType, NODE_DB_DEFAULT_NAME, Package, ProcessLifecycleState,
    ROOT_USER_ID, SCHEMA_NAME, User, init_root_state,
};
use crate::node::transitions::{
    ADD_USER, AddUserTransition, InitializeTransition, PROCESS_START, START_INSTALLATION,
};
use crate::operations::{
    AddUserOperation, AddUserOperationRequest, InitNodeOperation, InitNodeOperationOutcome,
    InitNodeOperationRequest, InstallAppOperation, InstallAppOperationRequest,
    StartProcessOperation, StartProcessOperationRequest, StopProcessOperation,
    StopProcessOperationRequest, UninstallAppOperation, UninstallAppOperationRequest,
    UpgradeAppOperation, UpgradeAppOperationRequest,
};
use crate::testing::{FakeDocker, NodeHarness, ScriptedPackages};
use habitat_meta::{HdbError, RESTORE_TRANSITION_TYPE};
use serde_json::Map;
use std::sync::Arc;

fn package(tag: &str) -> Package {
    Package {
        driver: DriverType::Docker,
        driver_config: Map::new(),
        registry_url_base: "r.io".to_string(),
        registry_app_id: "pds".to_string(),
        registry_tag: tag.to_string(),
    }
}

async fn init(harness: &NodeHarness) {
    let outcome = InitNodeOperation::new(harness.controller.clone())
        .run(InitNodeOperationRequest {
            node_id: Some("abc".to_string()),
            name: "n1".to_string(),
            root_user_certificate: String::new(),
        })
        .await
        .unwrap();
    assert!(matches!(outcome, InitNodeOperationOutcome::Initialized(_)));
}

async fn install(harness: &NodeHarness, user_id: &str) -> String {
    let result = InstallAppOperation::new(harness.controller.clone())
        .run(InstallAppOperationRequest {
            user_id: user_id.to_string(),
            name: "pds".to_string(),
            version: "1".to_string(),
            package: package("latest"),
            proxy_rules: Vec::new(),
            wait_until_installed: true,
        })
        .await
        .unwrap();
    assert_eq!(result.state, AppLifecycleState::Installed);
    result.app_id
}

async fn start(harness: &NodeHarness, app_id: &str) -> (String, Option<String>) {
    let result = StartProcessOperation::new(harness.controller.clone())
        .run(StartProcessOperationRequest {
            app_id: app_id.to_string(),
            wait_until_running: true,
        })
        .await
        .unwrap();
    (result.process_id, result.ext_driver_id)
}

#[tokio::test]
async fn test_init_and_add_user() {
    let temp_dir = tempfile::tempdir().unwrap();
    let harness = NodeHarness::open(
        temp_dir.path(),
        Arc::new(FakeDocker::default()),
        Arc::new(ScriptedPackages::default()),
    )
    .await;

    // init and add_user committed as one batch
    let database = harness
        .manager
        .create_database(
            NODE_DB_DEFAULT_NAME,
            SCHEMA_NAME,
            vec![
                Box::new(InitializeTransition {
                    init_state: init_root_state("abc", "n1", ""),
                }),
                Box::new(AddUserTransition {
                    user: User {
                        id: String::new(),
                        username: "alice".to_string(),
                        certificate: String::new(),
                        atproto_did: None,
                    },
                }),
            ],
        )
        .await
        .unwrap();
    database.wait_applied(database.committed_index()).await.unwrap();
    let state = harness.controller.node_state().await.unwrap();
    assert_eq!(state.node_id, "abc");
    let alice = state.user_by_name("alice").unwrap();
    assert!(!alice.id.is_empty());
    assert_ne!(alice.id, ROOT_USER_ID);

    let error = AddUserOperation::new(harness.controller.clone())
        .run(AddUserOperationRequest {
            username: "alice".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(error, HabitatError::Hdb(HdbError::Conflict(_))));

    let outcome = InitNodeOperation::new(harness.controller.clone())
        .run(InitNodeOperationRequest::default())
        .await
        .unwrap();
    assert!(matches!(outcome, InitNodeOperationOutcome::AlreadyInitialized(_)));
    harness.close().await;
}

#[tokio::test]
async fn test_install_start_and_restart() {
    let temp_dir = tempfile::tempdir().unwrap();
    let docker = Arc::new(FakeDocker::default());
    let packages = Arc::new(ScriptedPackages::default());

    let harness = NodeHarness::open(temp_dir.path(), docker.clone(), packages.clone()).await;
    init(&harness).await;
    let user = AddUserOperation::new(harness.controller.clone())
        .run(AddUserOperationRequest {
            username: "u1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
        .user;

    let app_id = install(&harness, &user.id).await;
    assert_eq!(packages.installs.lock().unwrap().len(), 1);

    let (process_id, ext_driver_id) = start(&harness, &app_id).await;
    assert_eq!(ext_driver_id.as_deref(), Some("ctr-1"));
    let state = harness.controller.node_state().await.unwrap();
    let process = state.process(&process_id).unwrap();
    assert_eq!(process.state, ProcessLifecycleState::Running);
    assert_eq!(process.driver, DriverType::Docker);
    assert_eq!(harness.processes.list().await.len(), 1);

    let before_restart = harness.controller.database().await.unwrap().bytes();
    harness.close().await;

    // new in-memory world over the same disk and the same containers
    let harness = NodeHarness::open(temp_dir.path(), docker.clone(), packages.clone()).await;
    harness.settle().await;

    let database = harness.controller.database().await.unwrap();
    assert_eq!(database.bytes(), before_restart);

    let seen = harness.recorder.transition_types();
    assert_eq!(seen, vec![RESTORE_TRANSITION_TYPE.to_string()]);
    assert!(!seen.iter().any(|tag| tag == START_INSTALLATION || tag == PROCESS_START));

    // the restorer adopted the container instead of reinstalling
    assert_eq!(packages.installs.lock().unwrap().len(), 1);
    let managed = harness.processes.get(&process_id).await.unwrap();
    assert_eq!(managed.ext_driver_id, "ctr-1");
    assert!(docker.is_running("ctr-1"));

    // new commits are published again
    AddUserOperation::new(harness.controller.clone())
        .run(AddUserOperationRequest {
            username: "bob".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let updates = harness.recorder.updates.lock().unwrap().clone();
    let restore_index = updates[0].log_index;
    let last = updates.last().unwrap();
    assert_eq!(last.transition_type, ADD_USER);
    assert!(last.log_index > restore_index);
    harness.close().await;
}

#[tokio::test]
async fn test_upgrade_with_running_process() {
    let temp_dir = tempfile::tempdir().unwrap();
    let docker = Arc::new(FakeDocker::default());
    let packages = Arc::new(ScriptedPackages::default());
    let harness = NodeHarness::open(temp_dir.path(), docker.clone(), packages.clone()).await;
    init(&harness).await;

    let app_id = install(&harness, ROOT_USER_ID).await;
    let (old_process_id, _) = start(&harness, &app_id).await;

    let result = UpgradeAppOperation::new(harness.controller.clone())
        .run(UpgradeAppOperationRequest {
            app_id: app_id.clone(),
            version: "2".to_string(),
            package: package("v2"),
            proxy_rules: Vec::new(),
        })
        .await
        .unwrap();
    assert!(result.previously_running);
    assert_eq!(result.stopped_process_id.as_deref(), Some(old_process_id.as_str()));
    let new_process_id = result.new_process_id.unwrap();
    assert_ne!(new_process_id, old_process_id);

    harness
        .controller
        .wait_for(|state| {
            Ok(state.process(&new_process_id)?.state == ProcessLifecycleState::Running
                && !state.processes.contains_key(&old_process_id))
        })
        .await
        .unwrap();
    harness.settle().await;

    let seen = harness.recorder.transition_types();
    let position = |tag: &str| seen.iter().rposition(|seen| seen == tag).unwrap();
    assert!(position("process_stop") < position("start_app_upgrade"));
    assert!(position("start_app_upgrade") < position("finish_app_upgrade"));
    assert!(position("finish_app_upgrade") < position(PROCESS_START));

    let state = harness.controller.node_state().await.unwrap();
    let app = state.app(&app_id).unwrap();
    assert_eq!(app.state, AppLifecycleState::Installed);
    assert_eq!(app.version, "2");
    assert_eq!(docker.stopped.lock().unwrap().clone(), vec!["ctr-1".to_string()]);
    assert!(docker.is_running("ctr-2"));
    assert_eq!(
        packages.installs.lock().unwrap().last().cloned(),
        Some(("pds:v2".to_string(), "2".to_string()))
    );
    harness.close().await;
}

#[tokio::test]
async fn test_upgrade_of_idle_app_starts_it() {
    let temp_dir = tempfile::tempdir().unwrap();
    let harness = NodeHarness::open(
        temp_dir.path(),
        Arc::new(FakeDocker::default()),
        Arc::new(ScriptedPackages::default()),
    )
    .await;
    init(&harness).await;
    let app_id = install(&harness, ROOT_USER_ID).await;

    let result = UpgradeAppOperation::new(harness.controller.clone())
        .run(UpgradeAppOperationRequest {
            app_id: app_id.clone(),
            version: "2".to_string(),
            package: package("v2"),
            proxy_rules: Vec::new(),
        })
        .await
        .unwrap();
    assert!(!result.previously_running);
    assert!(result.new_process_id.is_none());

    harness
        .controller
        .wait_for(|state| {
            Ok(state
                .live_process_for_app(&app_id)
                .is_some_and(|process| process.state == ProcessLifecycleState::Running))
        })
        .await
        .unwrap();
    harness.close().await;
}

#[tokio::test]
async fn test_stop_then_uninstall() {
    let temp_dir = tempfile::tempdir().unwrap();
    let docker = Arc::new(FakeDocker::default());
    let harness = NodeHarness::open(
        temp_dir.path(),
        docker.clone(),
        Arc::new(ScriptedPackages::default()),
    )
    .await;
    init(&harness).await;
    let app_id = install(&harness, ROOT_USER_ID).await;
    let (process_id, _) = start(&harness, &app_id).await;

    StopProcessOperation::new(harness.controller.clone())
        .run(StopProcessOperationRequest {
            process_id: process_id.clone(),
            wait_until_stopped: true,
        })
        .await
        .unwrap();
    harness
        .controller
        .wait_for(|state| Ok(!state.processes.contains_key(&process_id)))
        .await
        .unwrap();
    assert!(!docker.is_running("ctr-1"));
    assert!(harness.processes.list().await.is_empty());

    let result = UninstallAppOperation::new(harness.controller.clone())
        .run(UninstallAppOperationRequest {
            app_id: app_id.clone(),
        })
        .await
        .unwrap();
    assert!(result.stopped_process_id.is_none());
    let state = harness.controller.node_state().await.unwrap();
    assert_eq!(state.app(&app_id).unwrap().state, AppLifecycleState::Uninstalled);
    harness.close().await;
}
