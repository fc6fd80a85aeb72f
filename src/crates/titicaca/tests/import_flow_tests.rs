//! Integration tests for the import flows run through the task executor

mod common;

use common::{active_image_in, CountingStore, FailingStore, FakeInspector, FixedSource, TestEnv, FAST, SLOW};
use serde_json::json;
use std::sync::Arc;
use titicaca::config::EngineMode;
use titicaca::executor::RetryConfig;
use titicaca::flows::copy_image::CopyImage;
use titicaca::flows::{FlowContext, FlowStep, ImportActionWrapper};
use titicaca::models::{ImageStatus, Task, TaskStatus, TaskType, IMPORT_LOCK_PROPERTY};
use titicaca::repositories::{ImageRepository, TaskRepository};
use titicaca::TiticacaError;

fn stores(names: &[&str]) -> std::collections::BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

async fn run_direct_import(engine_mode: EngineMode) {
    let env = TestEnv::new(engine_mode);
    let image = env.queued_image().await;
    env.stage(&image.id, &[1u8; 2048]);

    let task = env
        .api_import_task(
            &image.id,
            json!({ "method": { "name": "titicaca-direct" }, "stores": [FAST, SLOW] }),
        )
        .await;

    let finished = env.executor().begin_processing(&task.id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Success);
    assert_eq!(finished.result, Some(json!({ "image_id": image.id })));

    let image = env.image(&image.id).await;
    assert_eq!(image.status, ImageStatus::Active);
    assert_eq!(image.size, Some(2048));
    assert!(image.checksum.is_some());
    assert_eq!(image.completed_stores, stores(&[FAST, SLOW]));
    assert!(image.importing_stores.is_empty());
    assert!(image.failed_stores.is_empty());
    assert_eq!(image.locations.len(), 2);
    assert!(!image.extra_properties.contains_key(IMPORT_LOCK_PROPERTY));

    assert!(!env.staging_path(&image.id).exists());
    assert!(env.root().join(FAST).join(&image.id).exists());
    assert!(env.root().join(SLOW).join(&image.id).exists());

    let stored = env.task(&task.id).await;
    assert_eq!(stored.status, TaskStatus::Success);
}

#[tokio::test]
async fn test_direct_import_serial() {
    run_direct_import(EngineMode::Serial).await;
}

#[tokio::test]
async fn test_direct_import_parallel() {
    run_direct_import(EngineMode::Parallel).await;
}

#[tokio::test]
async fn test_direct_import_without_staged_data_fails() {
    let env = TestEnv::new(EngineMode::Serial);
    let image = env.queued_image().await;
    let task = env
        .api_import_task(&image.id, json!({ "method": { "name": "titicaca-direct" } }))
        .await;

    let err = env.executor().begin_processing(&task.id).await.unwrap_err();
    assert!(matches!(err, TiticacaError::ImportTask(_)));

    let image = env.image(&image.id).await;
    assert_eq!(image.status, ImageStatus::Queued);
    assert_eq!(image.failed_stores, stores(&[FAST]));
    assert!(image.import_lock().is_none());
}

#[tokio::test]
async fn test_web_download_import_with_matching_length() {
    for engine_mode in [EngineMode::Serial, EngineMode::Parallel] {
        let env = TestEnv::new(engine_mode);
        let image = env.queued_image().await;
        let task = env
            .api_import_task(
                &image.id,
                json!({ "method": { "name": "web-download", "uri": "http://example.com/disk.raw" } }),
            )
            .await;

        let finished = env.executor().begin_processing(&task.id).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Success);

        let image = env.image(&image.id).await;
        assert_eq!(image.status, ImageStatus::Active);
        assert_eq!(image.size, Some(1024));
        assert_eq!(image.completed_stores, stores(&[FAST]));
    }
}

#[tokio::test]
async fn test_web_download_short_body_rolls_back() {
    let env = TestEnv::new(EngineMode::Serial)
        .with_source(FixedSource::new(vec![7u8; 512], Some(1024)));
    let image = env.queued_image().await;
    let task = env
        .api_import_task(
            &image.id,
            json!({ "method": { "name": "web-download", "uri": "https://example.com/disk.raw" } }),
        )
        .await;

    let err = env.executor().begin_processing(&task.id).await.unwrap_err();
    assert!(err.to_string().contains("does not match the expected size"));

    let task = env.task(&task.id).await;
    assert_eq!(task.status, TaskStatus::Failure);
    assert!(task.message.contains("does not match the expected size"));

    let image = env.image(&image.id).await;
    assert_eq!(image.status, ImageStatus::Queued);
    assert!(image.importing_stores.is_empty());
    assert_eq!(image.failed_stores, stores(&[FAST]));
    assert!(image.completed_stores.is_empty());
    assert!(image.import_lock().is_none());
    assert!(image.store_sets_disjoint());
    assert!(!env.staging_path(&image.id).exists());
}

#[tokio::test]
async fn test_partial_store_failure_allowed() {
    let env = TestEnv::new(EngineMode::Serial).with_store(Arc::new(FailingStore::new("broken")));
    let image = env.queued_image().await;
    env.stage(&image.id, b"image bytes");

    let task = env
        .api_import_task(
            &image.id,
            json!({
                "method": { "name": "titicaca-direct" },
                "stores": ["broken", FAST],
                "all_stores_must_succeed": false
            }),
        )
        .await;

    let finished = env.executor().begin_processing(&task.id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Success);

    let image = env.image(&image.id).await;
    assert_eq!(image.status, ImageStatus::Active);
    assert_eq!(image.completed_stores, stores(&[FAST]));
    assert_eq!(image.failed_stores, stores(&["broken"]));
    assert!(image.importing_stores.is_empty());
}

#[tokio::test]
async fn test_store_failure_aborts_when_all_must_succeed() {
    let env = TestEnv::new(EngineMode::Serial).with_store(Arc::new(FailingStore::new("broken")));
    let image = env.queued_image().await;
    env.stage(&image.id, b"image bytes");

    let task = env
        .api_import_task(
            &image.id,
            json!({ "method": { "name": "titicaca-direct" }, "stores": [FAST, "broken"] }),
        )
        .await;

    let err = env.executor().begin_processing(&task.id).await.unwrap_err();
    assert!(matches!(err, TiticacaError::Store(_)));

    let image = env.image(&image.id).await;
    assert_eq!(image.status, ImageStatus::Queued);
    assert!(image.importing_stores.is_empty());
    assert_eq!(image.failed_stores, stores(&[FAST, "broken"]));
    assert!(image.completed_stores.is_empty());
    assert!(image.locations.is_empty());
    assert!(image.location_for_store(FAST).is_none());
    assert!(image.import_lock().is_none());
    assert!(!env.root().join(FAST).join(&image.id).exists());
}

#[tokio::test]
async fn test_image_is_not_activated_before_every_store_ran() {
    let env = TestEnv::new(EngineMode::Parallel).with_store(Arc::new(FailingStore::new("broken")));
    let image = env.queued_image().await;
    env.stage(&image.id, b"image bytes");

    let task = env
        .api_import_task(
            &image.id,
            json!({
                "method": { "name": "titicaca-direct" },
                "stores": [FAST, SLOW, "broken"],
                "all_stores_must_succeed": true
            }),
        )
        .await;

    env.executor().begin_processing(&task.id).await.unwrap_err();
    assert_eq!(env.task(&task.id).await.status, TaskStatus::Failure);

    let image = env.image(&image.id).await;
    assert_eq!(image.status, ImageStatus::Queued);
    assert!(image.locations.is_empty());
    assert_eq!(image.failed_stores, stores(&[FAST, SLOW, "broken"]));
    assert!(image.store_sets_disjoint());
}

#[tokio::test]
async fn test_every_store_failing_leaves_image_queued() {
    let env = TestEnv::new(EngineMode::Serial).with_store(Arc::new(FailingStore::new("broken")));
    let image = env.queued_image().await;
    env.stage(&image.id, b"image bytes");

    let task = env
        .api_import_task(
            &image.id,
            json!({
                "method": { "name": "titicaca-direct" },
                "stores": ["broken"],
                "all_stores_must_succeed": false
            }),
        )
        .await;

    let err = env.executor().begin_processing(&task.id).await.unwrap_err();
    assert!(matches!(err, TiticacaError::ImportTask(_)));

    let image = env.image(&image.id).await;
    assert_eq!(image.status, ImageStatus::Queued);
    assert_eq!(image.failed_stores, stores(&["broken"]));
    assert!(image.import_lock().is_none());
}

#[tokio::test]
async fn test_import_rejected_while_another_task_holds_the_lock() {
    let env = TestEnv::new(EngineMode::Serial);
    let mut image = env.queued_image().await;
    image
        .extra_properties
        .insert(IMPORT_LOCK_PROPERTY.to_string(), "other-task".to_string());
    let image = ImageRepository::save(env.db.as_ref(), &image).await.unwrap();
    env.stage(&image.id, b"data");

    let task = env
        .api_import_task(&image.id, json!({ "method": { "name": "titicaca-direct" } }))
        .await;

    let err = env.executor().begin_processing(&task.id).await.unwrap_err();
    assert!(matches!(err, TiticacaError::TaskAborted(_)));

    let image = env.image(&image.id).await;
    assert_eq!(image.import_lock(), Some("other-task"));
    assert_eq!(image.status, ImageStatus::Queued);
    assert!(image.importing_stores.is_empty());
}

#[tokio::test]
async fn test_unknown_store_is_bad_configuration() {
    let env = TestEnv::new(EngineMode::Serial);
    let image = env.queued_image().await;
    let task = env
        .api_import_task(
            &image.id,
            json!({ "method": { "name": "titicaca-direct" }, "stores": ["nowhere"] }),
        )
        .await;

    let err = env.executor().begin_processing(&task.id).await.unwrap_err();
    assert!(matches!(err, TiticacaError::BadTaskConfiguration(_)));
    assert_eq!(env.task(&task.id).await.status, TaskStatus::Failure);
}

#[tokio::test]
async fn test_copy_image_to_additional_store() {
    let env = TestEnv::new(EngineMode::Parallel);
    let image = active_image_in(&env, FAST, &[3u8; 4096]).await;

    let task = env
        .api_import_task(
            &image.id,
            json!({ "method": { "name": "copy-image" }, "stores": [SLOW] }),
        )
        .await;

    let finished = env.executor().begin_processing(&task.id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Success);

    let image = env.image(&image.id).await;
    assert_eq!(image.status, ImageStatus::Active);
    assert_eq!(image.completed_stores, stores(&[FAST, SLOW]));
    assert_eq!(image.locations.len(), 2);
    assert_eq!(
        std::fs::read(env.root().join(SLOW).join(&image.id)).unwrap(),
        vec![3u8; 4096]
    );
}

#[tokio::test]
async fn test_copy_image_reuses_complete_staged_copy() {
    let env = TestEnv::new(EngineMode::Serial);
    let counting = Arc::new(CountingStore::new(FAST, env.root().join("counted")));
    let env = env.with_store(counting.clone());
    let image = active_image_in(&env, FAST, &[9u8; 1000]).await;

    let services = env.services();
    let wrapper = Arc::new(ImportActionWrapper::new(
        env.db.clone(),
        image.id.clone(),
        "task-copy",
        RetryConfig::default(),
    ));
    let step = CopyImage::new(
        "copy".to_string(),
        wrapper,
        services.stores.clone(),
        services.stores.staging().unwrap(),
        env.staging_path(&image.id),
        vec![SLOW.to_string()],
    );

    let ctx = FlowContext::new();
    step.execute(&ctx).await.unwrap();
    assert_eq!(counting.get_count(), 1);

    step.execute(&ctx).await.unwrap();
    assert_eq!(counting.get_count(), 1);
    assert_eq!(std::fs::read(env.staging_path(&image.id)).unwrap().len(), 1000);
}

#[tokio::test]
async fn test_copy_image_restarts_partial_staged_copy() {
    let env = TestEnv::new(EngineMode::Serial);
    let counting = Arc::new(CountingStore::new(FAST, env.root().join("counted")));
    let env = env.with_store(counting.clone());
    let image = active_image_in(&env, FAST, &[9u8; 1000]).await;
    env.stage(&image.id, &[9u8; 10]);

    let services = env.services();
    let step = CopyImage::new(
        "copy".to_string(),
        Arc::new(ImportActionWrapper::new(
            env.db.clone(),
            image.id.clone(),
            "task-copy",
            RetryConfig::default(),
        )),
        services.stores.clone(),
        services.stores.staging().unwrap(),
        env.staging_path(&image.id),
        vec![SLOW.to_string()],
    );

    step.execute(&FlowContext::new()).await.unwrap();
    assert_eq!(counting.get_count(), 1);
    assert_eq!(std::fs::read(env.staging_path(&image.id)).unwrap().len(), 1000);
}

#[tokio::test]
async fn test_conversion_skipped_when_already_target_format() {
    let env = TestEnv::new(EngineMode::Serial)
        .with_inspector(FakeInspector::reporting("raw", 10 * 1024 * 1024))
        .with_config(|c| c.image_import.image_import_plugins = vec!["image_conversion".to_string()]);
    let image = env.queued_image().await;
    env.stage(&image.id, &[0u8; 512]);

    let task = env
        .api_import_task(&image.id, json!({ "method": { "name": "titicaca-direct" } }))
        .await;
    env.executor().begin_processing(&task.id).await.unwrap();

    assert_eq!(env.inspector.converts(), 0);
    let image = env.image(&image.id).await;
    assert_eq!(image.virtual_size, Some(10 * 1024 * 1024));
    assert_eq!(image.disk_format.as_deref(), Some("raw"));
    assert_eq!(image.size, Some(512));
}

#[tokio::test]
async fn test_conversion_rewrites_disk_format() {
    let env = TestEnv::new(EngineMode::Serial)
        .with_inspector(FakeInspector::reporting("qcow2", 4096))
        .with_config(|c| {
            c.image_import.image_import_plugins =
                vec!["introspect".to_string(), "image_conversion".to_string()]
        });
    let image = env
        .add_image(titicaca::models::Image::new("project").with_formats("qcow2", "bare"))
        .await;
    env.stage(&image.id, &[5u8; 300]);

    let task = env
        .api_import_task(&image.id, json!({ "method": { "name": "titicaca-direct" } }))
        .await;
    env.executor().begin_processing(&task.id).await.unwrap();

    assert_eq!(env.inspector.converts(), 1);
    let image = env.image(&image.id).await;
    assert_eq!(image.status, ImageStatus::Active);
    assert_eq!(image.disk_format.as_deref(), Some("raw"));
    assert_eq!(image.container_format.as_deref(), Some("bare"));
    assert_eq!(image.virtual_size, Some(4096));
}

#[tokio::test]
async fn test_backing_file_fails_the_import() {
    let inspector = FakeInspector::reporting("qcow2", 4096);
    inspector.info.lock().backing_filename = Some("/etc/passwd".to_string());
    let env = TestEnv::new(EngineMode::Serial)
        .with_inspector(inspector)
        .with_config(|c| c.image_import.image_import_plugins = vec!["image_conversion".to_string()]);
    let image = env.queued_image().await;
    env.stage(&image.id, &[5u8; 300]);

    let task = env
        .api_import_task(&image.id, json!({ "method": { "name": "titicaca-direct" } }))
        .await;
    let err = env.executor().begin_processing(&task.id).await.unwrap_err();

    assert!(matches!(err, TiticacaError::UnsafeImage(_)));
    let image = env.image(&image.id).await;
    assert_eq!(image.status, ImageStatus::Queued);
    assert_eq!(image.failed_stores, stores(&[FAST]));
}

async fn run_vmdk_import(create_type: Option<&str>) -> (TiticacaError, TestEnv, String, String) {
    let inspector = FakeInspector::reporting("vmdk", 4096);
    inspector.info.lock().create_type = create_type.map(str::to_string);
    let env = TestEnv::new(EngineMode::Serial)
        .with_inspector(inspector)
        .with_config(|c| c.image_import.image_import_plugins = vec!["image_conversion".to_string()]);
    let image = env.queued_image().await;
    env.stage(&image.id, &[6u8; 300]);

    let task = env
        .api_import_task(&image.id, json!({ "method": { "name": "titicaca-direct" } }))
        .await;
    let err = env.executor().begin_processing(&task.id).await.unwrap_err();
    (err, env, image.id, task.id)
}

#[tokio::test]
async fn test_vmdk_with_unlisted_create_type_fails_the_import() {
    let (err, env, image_id, task_id) = run_vmdk_import(Some("monolithicFlat")).await;

    assert!(matches!(err, TiticacaError::UnsafeImage(_)));
    let task = env.task(&task_id).await;
    assert_eq!(task.status, TaskStatus::Failure);
    assert!(!task.message.is_empty());
    assert_eq!(env.inspector.converts(), 0);

    let image = env.image(&image_id).await;
    assert_eq!(image.status, ImageStatus::Queued);
    assert_eq!(image.failed_stores, stores(&[FAST]));
}

#[tokio::test]
async fn test_vmdk_without_create_type_fails_the_import() {
    let (err, env, image_id, task_id) = run_vmdk_import(None).await;

    assert!(matches!(err, TiticacaError::UnsafeImage(_)));
    assert_eq!(env.task(&task_id).await.status, TaskStatus::Failure);
    assert_eq!(env.image(&image_id).await.status, ImageStatus::Queued);
}

#[tokio::test]
async fn test_vmdk_with_allowed_create_type_is_converted() {
    let inspector = FakeInspector::reporting("vmdk", 4096);
    inspector.info.lock().create_type = Some("streamOptimized".to_string());
    let env = TestEnv::new(EngineMode::Serial)
        .with_inspector(inspector)
        .with_config(|c| c.image_import.image_import_plugins = vec!["image_conversion".to_string()]);
    let image = env.queued_image().await;
    env.stage(&image.id, &[6u8; 300]);

    let task = env
        .api_import_task(&image.id, json!({ "method": { "name": "titicaca-direct" } }))
        .await;
    env.executor().begin_processing(&task.id).await.unwrap();

    assert_eq!(env.inspector.converts(), 1);
    assert_eq!(env.image(&image.id).await.status, ImageStatus::Active);
}

#[tokio::test]
async fn test_missing_inspection_tool_does_not_fail_the_import() {
    let env = TestEnv::new(EngineMode::Serial)
        .with_inspector(FakeInspector::without_tool())
        .with_config(|c| c.image_import.image_import_plugins = vec!["introspect".to_string()]);
    let image = env.queued_image().await;
    env.stage(&image.id, &[3u8; 128]);

    let task = env
        .api_import_task(&image.id, json!({ "method": { "name": "titicaca-direct" } }))
        .await;
    let finished = env.executor().begin_processing(&task.id).await.unwrap();

    assert_eq!(finished.status, TaskStatus::Success);
    let image = env.image(&image.id).await;
    assert_eq!(image.status, ImageStatus::Active);
    assert_eq!(image.virtual_size, None);
}

#[tokio::test]
async fn test_inject_metadata_for_regular_users() {
    let env = TestEnv::new(EngineMode::Serial).with_config(|c| {
        c.image_import.image_import_plugins = vec!["inject_image_metadata".to_string()];
        c.inject_metadata_properties
            .inject
            .insert("hw_scsi_model".to_string(), "virtio-scsi".to_string());
    });
    let image = env.queued_image().await;
    env.stage(&image.id, b"data");

    let task = env
        .api_import_task(&image.id, json!({ "method": { "name": "titicaca-direct" } }))
        .await;
    env.executor().begin_processing(&task.id).await.unwrap();

    let image = env.image(&image.id).await;
    assert_eq!(
        image.extra_properties.get("hw_scsi_model").map(String::as_str),
        Some("virtio-scsi")
    );
}

#[tokio::test]
async fn test_unknown_plugin_fails_task() {
    let env = TestEnv::new(EngineMode::Serial)
        .with_config(|c| c.image_import.image_import_plugins = vec!["teleport".to_string()]);
    let image = env.queued_image().await;
    let task = env
        .api_import_task(&image.id, json!({ "method": { "name": "titicaca-direct" } }))
        .await;

    let err = env.executor().begin_processing(&task.id).await.unwrap_err();
    assert!(matches!(err, TiticacaError::BadTaskConfiguration(_)));
}

#[tokio::test]
async fn test_legacy_import_creates_active_image() {
    let env = TestEnv::new(EngineMode::Serial);
    let task = Task::new(
        TaskType::Import,
        "project",
        json!({
            "import_from": "http://example.com/cirros.raw",
            "import_from_format": "raw",
            "image_properties": { "name": "cirros", "container_format": "bare" }
        }),
    );
    TaskRepository::add(env.db.as_ref(), &task).await.unwrap();

    let finished = env.executor().begin_processing(&task.id).await.unwrap();
    let image_id = finished.result.as_ref().unwrap()["image_id"]
        .as_str()
        .unwrap()
        .to_string();

    let image = env.image(&image_id).await;
    assert_eq!(image.name.as_deref(), Some("cirros"));
    assert_eq!(image.disk_format.as_deref(), Some("raw"));
    assert_eq!(image.owner, "project");
    assert_eq!(image.status, ImageStatus::Active);
    assert_eq!(image.size, Some(1024));
    assert_eq!(image.completed_stores, stores(&[FAST]));
    assert!(image.import_lock().is_none());
}

#[tokio::test]
async fn test_legacy_import_failure_removes_image() {
    let env = TestEnv::new(EngineMode::Serial)
        .with_source(FixedSource::new(vec![1u8; 100], Some(200)));
    let task = Task::new(
        TaskType::Import,
        "project",
        json!({ "import_from": "http://example.com/cirros.raw" }),
    )
    .with_image_id("legacy-image");
    TaskRepository::add(env.db.as_ref(), &task).await.unwrap();

    env.executor().begin_processing(&task.id).await.unwrap_err();

    assert_eq!(env.task(&task.id).await.status, TaskStatus::Failure);
    let err = ImageRepository::get(env.db.as_ref(), "legacy-image")
        .await
        .unwrap_err();
    assert!(matches!(err, TiticacaError::ImageNotFound { .. }));
}

#[tokio::test]
async fn test_task_that_is_not_pending_is_not_run() {
    let env = TestEnv::new(EngineMode::Serial);
    let image = env.queued_image().await;
    env.stage(&image.id, b"data");
    let task = env
        .api_import_task(&image.id, json!({ "method": { "name": "titicaca-direct" } }))
        .await;

    env.executor().begin_processing(&task.id).await.unwrap();
    let err = env.executor().begin_processing(&task.id).await.unwrap_err();
    assert!(matches!(err, TiticacaError::InvalidTaskStatusTransition { .. }));
}
